use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const STATE_FILE: &str = "config_USER.json";

/// What survives a reload for one theme: whether it is on and what the user picked.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ThemeState {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub patches: BTreeMap<String, String>,
    /// patch -> component -> value
    #[serde(default)]
    pub components: BTreeMap<String, BTreeMap<String, String>>,
}

/// Reads `<dir>/config_USER.json`. A missing file is not an error.
pub fn load_state(dir: &Path) -> Result<Option<ThemeState>> {
    let path = dir.join(STATE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

pub fn save_state(dir: &Path, state: &ThemeState) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    let content = serde_json::to_string_pretty(state)?;
    fs::write(dir.join(STATE_FILE), content)?;
    Ok(())
}
