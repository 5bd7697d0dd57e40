//! Property-based tests for modhost-updater.
//!
//! # Properties Tested
//!
//! - The status table only lets failures touch files through `RolledBack`
//! - Cancellable phases never overlap phases that replace files
//! - Artifacts verify against their own digest and fail against any other
//! - Checksum files yield the digest of the requested asset
//! - Backup retention keeps exactly the newest `max_backups` backups

#![cfg(test)]

use std::fs;
use std::path::Path;

use chrono::Utc;
use proptest::prelude::*;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use modhost_core::{Module, ModuleManifest, MANIFEST_FILE};

use crate::backup::BackupManager;
use crate::checksum::{parse_checksum_file, verify_file};
use crate::status::UpdateStatus;

// =============================================================================
// Generators
// =============================================================================

fn arb_status() -> impl Strategy<Value = UpdateStatus> {
    prop::sample::select(UpdateStatus::ALL.to_vec())
}

/// Random artifact content (1 byte to 8KB).
fn arb_artifact_content() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..8192)
}

fn arb_asset_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,15}\\.zip"
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn installed_module(root: &Path) -> Module {
    let path = root.join("modules").join("blog");
    fs::create_dir_all(&path).unwrap();
    let manifest = r#"{"name": "blog", "version": "1.0.0"}"#;
    fs::write(path.join(MANIFEST_FILE), manifest).unwrap();
    let manifest = ModuleManifest::from_json(manifest, &path.join(MANIFEST_FILE)).unwrap();
    Module::from_manifest(manifest, path, Utc::now())
}

// =============================================================================
// Status table
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Terminal states have no successors; every other state can fail.
    #[test]
    fn prop_terminal_states_are_final(status in arb_status()) {
        if status.is_terminal() {
            prop_assert!(status.next_states().is_empty());
        } else {
            prop_assert!(status.can_transition_to(UpdateStatus::Failed));
        }
    }

    /// `RolledBack` is reachable exactly from the phases that replace files.
    #[test]
    fn prop_rollback_only_after_files_touched(status in arb_status()) {
        prop_assert_eq!(
            status.can_transition_to(UpdateStatus::RolledBack),
            status.touches_files()
        );
    }

    /// A cancel can never interrupt a phase that has replaced files.
    #[test]
    fn prop_cancellable_never_touches_files(status in arb_status()) {
        if status.is_cancellable() {
            prop_assert!(!status.touches_files());
            prop_assert!(!status.is_terminal());
        }
    }

    /// Transitions only ever move forward in pipeline order.
    #[test]
    fn prop_transitions_move_forward(from in arb_status(), to in arb_status()) {
        if from.can_transition_to(to) {
            let index = |s: UpdateStatus| UpdateStatus::ALL.iter().position(|x| *x == s).unwrap();
            prop_assert!(index(to) > index(from));
        }
    }
}

// =============================================================================
// Checksums
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// A file verifies against its own digest, in either case.
    #[test]
    fn prop_artifact_matches_own_digest(content in arb_artifact_content()) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("artifact.zip");
        fs::write(&path, &content).unwrap();

        let digest = sha256_hex(&content);
        prop_assert!(verify_file(&path, &digest).unwrap());
        prop_assert!(verify_file(&path, &digest.to_ascii_uppercase()).unwrap());
    }

    /// Changing any single byte of the content breaks verification.
    #[test]
    fn prop_tampered_artifact_rejected(
        content in arb_artifact_content(),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("artifact.zip");
        let digest = sha256_hex(&content);

        let mut tampered = content.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= flip;
        fs::write(&path, &tampered).unwrap();

        prop_assert!(!verify_file(&path, &digest).unwrap());
    }

    /// The digest listed for an asset is found among other entries.
    #[test]
    fn prop_checksum_file_lookup(
        asset in arb_asset_name(),
        others in prop::collection::vec(arb_asset_name(), 0..5),
        content in arb_artifact_content(),
    ) {
        let digest = sha256_hex(&content);
        let mut lines: Vec<String> = others
            .iter()
            .filter(|name| **name != asset)
            .map(|name| format!("{}  {}", sha256_hex(name.as_bytes()), name))
            .collect();
        lines.insert(lines.len() / 2, format!("{}  *{}", digest.to_ascii_uppercase(), asset));

        prop_assert_eq!(parse_checksum_file(&lines.join("\n"), &asset), Some(digest));
    }
}

// =============================================================================
// Backup retention
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    /// After cleanup exactly `min(created, max_backups)` backups remain and
    /// they are the newest ones.
    #[test]
    fn prop_retention_keeps_newest(created in 1usize..7, max_backups in 1usize..5) {
        let temp = TempDir::new().unwrap();
        let module = installed_module(temp.path());
        let manager = BackupManager::new(temp.path().join("backups"), max_backups);

        let mut paths = Vec::new();
        for _ in 0..created {
            paths.push(manager.create_backup(&module).unwrap().path);
        }
        let newest_before: Vec<_> = manager
            .list_backups("blog")
            .unwrap()
            .into_iter()
            .take(max_backups)
            .map(|b| b.path)
            .collect();

        let deleted = manager.cleanup_old_backups("blog").unwrap();
        let remaining: Vec<_> = manager.list_backups("blog").unwrap().into_iter().map(|b| b.path).collect();

        prop_assert_eq!(deleted, created.saturating_sub(max_backups));
        prop_assert_eq!(remaining.len(), created.min(max_backups));
        prop_assert_eq!(remaining, newest_before);
    }
}
