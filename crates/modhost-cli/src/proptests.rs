//! Property-based tests for modhost-cli.
//!
//! # Properties Tested
//!
//! - Output formats parse regardless of letter case
//! - Rollback outcomes map to their exit codes whatever the cause
//! - Every valid format and level combination passes validation
//! - Command-line overrides always win over the config file

#![cfg(test)]

use std::path::PathBuf;
use std::str::FromStr;

use proptest::prelude::*;

use modhost_updater::UpdateError;

use crate::config::{CliOverrides, Config};
use crate::output::OutputFormat;
use crate::ExitCode;

// =============================================================================
// Generators
// =============================================================================

fn arb_format() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["table", "json", "quiet"])
}

fn arb_level() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["error", "warn", "info", "debug", "trace"])
}

/// A failure that can happen while files are being replaced.
fn arb_cause() -> impl Strategy<Value = UpdateError> {
    let module = "[a-z][a-z0-9-]{0,12}";
    prop_oneof![
        (module, "[a-z ]{1,20}").prop_map(|(m, r)| UpdateError::ExtractionFailed { module: m, reason: r }),
        (module, "[a-z ]{1,20}").prop_map(|(m, r)| UpdateError::MigrationFailed { module: m, reason: r }),
        (module, prop::collection::vec("[a-z ]{1,20}", 1..3))
            .prop_map(|(m, errors)| UpdateError::HealthCheckFailed { module: m, errors }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Any casing of a known format parses to the same format.
    #[test]
    fn prop_output_format_case_insensitive(
        format in arb_format(),
        mask in prop::collection::vec(any::<bool>(), 5),
    ) {
        let mixed: String = format
            .chars()
            .zip(mask.iter().cycle())
            .map(|(c, upper)| if *upper { c.to_ascii_uppercase() } else { c })
            .collect();
        let parsed = OutputFormat::from_str(&mixed).unwrap();
        prop_assert_eq!(parsed.to_string(), format);
    }

    /// Rolled-back and failed rollbacks keep their own exit codes.
    #[test]
    fn prop_rollback_exit_codes(cause in arb_cause(), reason in "[a-z ]{1,20}") {
        let module = cause.module().unwrap_or("blog").to_string();
        let rolled = UpdateError::RolledBack { module: module.clone(), cause: Box::new(cause) };
        prop_assert_eq!(ExitCode::from_update_error(&rolled), ExitCode::RolledBack);

        let UpdateError::RolledBack { cause, .. } = rolled else { unreachable!() };
        let fatal = UpdateError::RollbackFailed { module, cause, reason };
        prop_assert_eq!(ExitCode::from_update_error(&fatal), ExitCode::RollbackFailed);
    }

    /// Valid format and level values always validate.
    #[test]
    fn prop_valid_settings_validate(format in arb_format(), level in arb_level()) {
        let mut config = Config::default();
        config.output.format = format.to_string();
        config.logging.level = level.to_string();
        prop_assert!(config.validate().is_ok());
    }

    /// Overrides replace file values; absent overrides keep them.
    #[test]
    fn prop_overrides_take_precedence(
        file_format in arb_format(),
        cli_format in prop::option::of(arb_format()),
        modules_dir in prop::option::of("/[a-z]{1,8}/[a-z]{1,8}"),
    ) {
        let mut config = Config::default();
        config.output.format = file_format.to_string();
        let original_dir = config.paths.modules_dir.clone();

        let overrides = CliOverrides {
            output_format: cli_format.map(str::to_string),
            modules_dir: modules_dir.clone().map(PathBuf::from),
            ..Default::default()
        };
        let config = config.with_overrides(&overrides);

        prop_assert_eq!(config.output.format, cli_format.unwrap_or(file_format));
        prop_assert_eq!(config.paths.modules_dir, modules_dir.map(PathBuf::from).unwrap_or(original_dir));
    }
}
