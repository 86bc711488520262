//! Crate-wide constants.

/// Application name, used for directory naming.
pub const APP_NAME: &str = "fleetlab";

/// Environment variable that overrides the fleetlab home directory.
pub const HOME_ENV: &str = "FLEETLAB_HOME";

/// Environment variable prefix scanned by the `EnvVars` bootstrap.
///
/// Double underscores separate namespaces, so leaf names may themselves
/// contain underscores: `FLEETLAB_VAR_remote__key_path=~/.ssh/fleet.pem`
/// puts `remote/key_path`.
pub const VAR_ENV_PREFIX: &str = "FLEETLAB_VAR_";
