//! Filesystem locations for fleetlab state.

use std::path::PathBuf;

use crate::consts::{APP_NAME, HOME_ENV};

/// Returns the user's home directory
fn home_dir() -> PathBuf {
  let home = std::env::var("HOME").expect("HOME not set");
  PathBuf::from(home)
}

/// Returns the fleetlab home directory.
///
/// Resolution order:
/// 1. `$FLEETLAB_HOME`
/// 2. `$XDG_DATA_HOME/fleetlab`
/// 3. `~/.local/share/fleetlab`
pub fn fleet_home() -> PathBuf {
  if let Ok(home) = std::env::var(HOME_ENV) {
    return PathBuf::from(home);
  }
  let data_home = std::env::var("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".local").join("share"));
  data_home.join(APP_NAME)
}
