//! Module versions and version constraints.
//!
//! `ModuleVersion` wraps a semantic version and accepts the looser forms
//! found in module manifests and release tags (`v1.2`, `2`, `1.0.0-beta.1`).
//! Ordering is major, then minor, then patch, with a pre-release sorting
//! below the matching release. Build metadata never affects ordering.
//!
//! `VersionConstraint` evaluates the constraint syntax used in manifest
//! `requires` blocks:
//!
//! - exact versions (`1.2.3`, `=1.2.3`)
//! - comparison operators (`>=1.0`, `<2.0`, `!=1.4.0`)
//! - caret ranges (`^1.2`, compatible within the same major)
//! - tilde ranges (`~1.2.3`, compatible within the same minor)
//! - wildcards (`1.2.*`)
//! - conjunctions separated by commas or whitespace, alternatives by `||`
//!
//! An empty constraint or `*` is satisfied by every version.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use semver::{BuildMetadata, Prerelease, Version};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors raised while parsing versions and constraints.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// The input is not a dotted numeric version
    #[error("invalid version format: {0:?}")]
    InvalidVersionFormat(String),

    /// The constraint expression could not be parsed
    #[error("invalid version constraint {constraint:?}: {reason}")]
    InvalidConstraint { constraint: String, reason: String },
}

/// A semantic version of a module or of the host core.
#[derive(Debug, Clone)]
pub struct ModuleVersion(Version);

impl ModuleVersion {
    /// Create a release version from its numeric components.
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(Version::new(major, minor, patch))
    }

    /// Parse a version string.
    ///
    /// A leading `v` is ignored and missing minor/patch components are
    /// filled with zero, so `v2.1` parses as `2.1.0`.
    ///
    /// # Errors
    ///
    /// Returns `VersionError::InvalidVersionFormat` when the numeric core is
    /// missing, has more than three components, contains non-digits, or
    /// when the pre-release/build suffix is malformed.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let invalid = || VersionError::InvalidVersionFormat(input.to_string());

        let trimmed = input.trim();
        let stripped = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
        let (core, suffix) = split_core_and_suffix(stripped);

        let mut components = [0u64; 3];
        let mut count = 0;
        for part in core.split('.') {
            if count == 3 || part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            components[count] = part.parse::<u64>().map_err(|_| invalid())?;
            count += 1;
        }

        let mut version = Version::new(components[0], components[1], components[2]);

        if !suffix.is_empty() {
            let (pre, build) = match suffix.split_once('+') {
                Some((pre, build)) => (pre, Some(build)),
                None => (suffix, None),
            };
            if let Some(pre) = pre.strip_prefix('-') {
                version.pre = Prerelease::new(pre).map_err(|_| invalid())?;
            } else if !pre.is_empty() {
                return Err(invalid());
            }
            if let Some(build) = build {
                version.build = BuildMetadata::new(build).map_err(|_| invalid())?;
            }
        }

        Ok(Self(version))
    }

    pub fn major(&self) -> u64 {
        self.0.major
    }

    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    pub fn patch(&self) -> u64 {
        self.0.patch
    }

    /// Whether this version carries a pre-release tag.
    pub fn is_prerelease(&self) -> bool {
        !self.0.pre.is_empty()
    }

    /// Access the underlying semver value.
    pub fn as_semver(&self) -> &Version {
        &self.0
    }

    /// True iff moving from `current` to `self` crosses a major version.
    ///
    /// Used to flag breaking-change risk in update previews.
    pub fn is_major_upgrade_from(&self, current: &ModuleVersion) -> bool {
        self.major() > current.major()
    }

    /// The first pre-release of the next major, used as an exclusive upper bound.
    ///
    /// Fails when the component is already `u64::MAX`.
    fn next_major_floor(&self) -> Result<Self, String> {
        let major = bump(self.major(), "major")?;
        Ok(floor(major, 0, 0))
    }

    fn next_minor_floor(&self) -> Result<Self, String> {
        let minor = bump(self.minor(), "minor")?;
        Ok(floor(self.major(), minor, 0))
    }

    fn next_patch_floor(&self) -> Result<Self, String> {
        let patch = bump(self.patch(), "patch")?;
        Ok(floor(self.major(), self.minor(), patch))
    }
}

fn bump(component: u64, name: &str) -> Result<u64, String> {
    component
        .checked_add(1)
        .ok_or_else(|| format!("{name} component {component} has no upper bound"))
}

/// `major.minor.patch-0`, the lowest version with that numeric core.
fn floor(major: u64, minor: u64, patch: u64) -> ModuleVersion {
    let mut version = Version::new(major, minor, patch);
    version.pre = Prerelease::new("0").unwrap_or(Prerelease::EMPTY);
    ModuleVersion(version)
}

fn split_core_and_suffix(version: &str) -> (&str, &str) {
    let idx = version.find(['-', '+']).unwrap_or(version.len());
    (&version[..idx], &version[idx..])
}

impl PartialEq for ModuleVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ModuleVersion {}

impl PartialOrd for ModuleVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ModuleVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .major
            .cmp(&other.0.major)
            .then(self.0.minor.cmp(&other.0.minor))
            .then(self.0.patch.cmp(&other.0.patch))
            .then_with(|| self.0.pre.cmp(&other.0.pre))
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ModuleVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ModuleVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ModuleVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Comparator {
    op: Op,
    version: ModuleVersion,
}

impl Comparator {
    fn new(op: Op, version: ModuleVersion) -> Self {
        Self { op, version }
    }

    fn matches(&self, candidate: &ModuleVersion) -> bool {
        match self.op {
            Op::Eq => candidate == &self.version,
            Op::Ne => candidate != &self.version,
            Op::Gt => candidate > &self.version,
            Op::Ge => candidate >= &self.version,
            Op::Lt => candidate < &self.version,
            Op::Le => candidate <= &self.version,
        }
    }
}

/// A parsed version constraint.
///
/// Internally a disjunction of conjunctions of comparators; an empty
/// disjunction (or an empty conjunction) accepts everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    raw: String,
    alternatives: Vec<Vec<Comparator>>,
}

impl VersionConstraint {
    /// A constraint satisfied by every version.
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            alternatives: Vec::new(),
        }
    }

    /// Parse a constraint expression.
    ///
    /// # Errors
    ///
    /// Returns `VersionError::InvalidConstraint` on unknown syntax or
    /// malformed versions inside the expression.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let raw = input.trim();
        if raw.is_empty() || raw == "*" {
            return Ok(Self {
                raw: if raw.is_empty() { "*".to_string() } else { raw.to_string() },
                alternatives: Vec::new(),
            });
        }

        let fail = |reason: String| VersionError::InvalidConstraint {
            constraint: raw.to_string(),
            reason,
        };

        let mut alternatives = Vec::new();
        for alternative in raw.split("||") {
            let tokens: Vec<&str> = alternative
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|t| !t.is_empty())
                .collect();
            if tokens.is_empty() {
                return Err(fail("empty alternative".to_string()));
            }

            let mut comparators = Vec::new();
            let mut i = 0;
            while i < tokens.len() {
                let mut term = tokens[i].to_string();
                // `>= 1.0` arrives as two tokens
                if is_bare_operator(&term) {
                    let next = tokens
                        .get(i + 1)
                        .ok_or_else(|| fail(format!("operator {term:?} without a version")))?;
                    term.push_str(next);
                    i += 1;
                }
                parse_term(&term, &mut comparators).map_err(fail)?;
                i += 1;
            }
            alternatives.push(comparators);
        }

        // `1.0 || *` accepts everything
        if alternatives.iter().any(Vec::is_empty) {
            alternatives.clear();
        }

        Ok(Self {
            raw: raw.to_string(),
            alternatives,
        })
    }

    /// Whether `version` satisfies this constraint.
    pub fn satisfied_by(&self, version: &ModuleVersion) -> bool {
        self.alternatives.is_empty()
            || self
                .alternatives
                .iter()
                .any(|all| all.iter().all(|c| c.matches(version)))
    }

    /// Whether this constraint accepts every version.
    pub fn is_any(&self) -> bool {
        self.alternatives.is_empty()
    }

    /// The constraint as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Default for VersionConstraint {
    fn default() -> Self {
        Self::any()
    }
}

fn is_bare_operator(token: &str) -> bool {
    matches!(token, ">" | ">=" | "<" | "<=" | "=" | "==" | "!=" | "^" | "~")
}

/// Parse a possibly partial version (`1`, `1.2`, `1.2.3-rc.1`) and report
/// how many numeric components were written.
fn parse_partial(input: &str) -> Result<(ModuleVersion, usize), String> {
    let stripped = input.strip_prefix(['v', 'V']).unwrap_or(input);
    let (core, _) = split_core_and_suffix(stripped);
    let count = core.split('.').count();
    let version = ModuleVersion::parse(stripped).map_err(|e| e.to_string())?;
    Ok((version, count))
}

fn parse_term(term: &str, out: &mut Vec<Comparator>) -> Result<(), String> {
    if term == "*" {
        return Ok(());
    }

    if let Some(rest) = term.strip_prefix('^') {
        let (lower, count) = parse_partial(rest)?;
        let upper = if lower.major() > 0 {
            lower.next_major_floor()?
        } else if count >= 2 && lower.minor() > 0 {
            lower.next_minor_floor()?
        } else if count == 3 {
            lower.next_patch_floor()?
        } else if count == 2 {
            lower.next_minor_floor()?
        } else {
            lower.next_major_floor()?
        };
        out.push(Comparator::new(Op::Ge, lower));
        out.push(Comparator::new(Op::Lt, upper));
        return Ok(());
    }

    if let Some(rest) = term.strip_prefix('~') {
        let (lower, count) = parse_partial(rest)?;
        let upper = if count == 3 {
            lower.next_minor_floor()?
        } else {
            lower.next_major_floor()?
        };
        out.push(Comparator::new(Op::Ge, lower));
        out.push(Comparator::new(Op::Lt, upper));
        return Ok(());
    }

    for (prefix, op) in [
        (">=", Op::Ge),
        ("<=", Op::Le),
        ("!=", Op::Ne),
        ("==", Op::Eq),
        (">", Op::Gt),
        ("<", Op::Lt),
        ("=", Op::Eq),
    ] {
        if let Some(rest) = term.strip_prefix(prefix) {
            let (version, _) = parse_partial(rest)?;
            out.push(Comparator::new(op, version));
            return Ok(());
        }
    }

    if split_core_and_suffix(term).0.contains(['*', 'x', 'X']) {
        return parse_wildcard(term, out);
    }

    let (version, _) = parse_partial(term)?;
    out.push(Comparator::new(Op::Eq, version));
    Ok(())
}

fn parse_wildcard(term: &str, out: &mut Vec<Comparator>) -> Result<(), String> {
    let stripped = term.strip_prefix(['v', 'V']).unwrap_or(term);
    let mut numbers = Vec::new();
    let mut parts = stripped.split('.');
    for part in parts.by_ref() {
        if matches!(part, "*" | "x" | "X") {
            break;
        }
        numbers.push(
            part.parse::<u64>()
                .map_err(|_| format!("invalid wildcard component {part:?}"))?,
        );
    }
    if parts.any(|rest| !matches!(rest, "*" | "x" | "X")) {
        return Err(format!("wildcard must be the last component in {term:?}"));
    }

    match numbers.as_slice() {
        [] => {}
        [major] => {
            let lower = ModuleVersion::new(*major, 0, 0);
            out.push(Comparator::new(Op::Lt, lower.next_major_floor()?));
            out.push(Comparator::new(Op::Ge, lower));
        }
        [major, minor] => {
            let lower = ModuleVersion::new(*major, *minor, 0);
            out.push(Comparator::new(Op::Lt, lower.next_minor_floor()?));
            out.push(Comparator::new(Op::Ge, lower));
        }
        _ => return Err(format!("too many components in wildcard {term:?}")),
    }
    Ok(())
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for VersionConstraint {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for VersionConstraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
