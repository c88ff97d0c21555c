use crate::error::Result;
use crate::inject::{InjectionUnit, Removal};
use crate::patch::{Patch, PatchManifest, PatchSummary};
use crate::store::{self, ThemeState};
use crate::transport::{TabId, TabTransport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "theme.json";
pub const LEGACY_STYLESHEET: &str = "theme.css";

/// What a theme asks of one of its dependencies, per patch: either a plain option
/// value, or values keyed by component (unknown keys select the patch option).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum DependencyOverride {
    Value(String),
    Keyed(BTreeMap<String, String>),
}

pub type Dependencies = BTreeMap<String, BTreeMap<String, DependencyOverride>>;

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ThemeManifest {
    pub name: Option<String>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub version: String,
    #[serde(default = "default_manifest_version")]
    pub manifest_version: u32,
    #[serde(default)]
    pub inject: BTreeMap<String, Vec<TabId>>,
    #[serde(default)]
    pub patches: BTreeMap<String, PatchManifest>,
    #[serde(default)]
    pub dependencies: Dependencies,
}

fn default_manifest_version() -> u32 {
    1
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ThemeSummary {
    pub name: String,
    pub author: String,
    pub version: String,
    pub manifest_version: u32,
    pub enabled: bool,
    pub patches: Vec<PatchSummary>,
    pub dependencies: Vec<String>,
}

pub struct Theme {
    pub name: String,
    pub author: String,
    pub version: String,
    pub manifest_version: u32,
    pub path: PathBuf,
    config_dir: PathBuf,
    injects: Vec<Arc<InjectionUnit>>,
    pub patches: Vec<Patch>,
    pub dependencies: Dependencies,
    pub enabled: bool,
}

impl Theme {
    /// Reads a theme directory. Directories holding neither a manifest nor a
    /// bare `theme.css` are not themes and yield `None`.
    pub fn parse_dir(
        theme_dir: &Path,
        config_dir: &Path,
        default_tab: &str,
    ) -> Result<Option<Self>> {
        let manifest_path = theme_dir.join(MANIFEST_FILE);
        let manifest = if manifest_path.exists() {
            let content = fs::read_to_string(&manifest_path)?;
            serde_json::from_str::<ThemeManifest>(&content)?
        } else if theme_dir.join(LEGACY_STYLESHEET).exists() {
            let tabs = vec![default_tab.to_string()];
            ThemeManifest {
                inject: BTreeMap::from([(LEGACY_STYLESHEET.to_string(), tabs)]),
                ..ThemeManifest::default()
            }
        } else {
            return Ok(None);
        };
        Ok(Some(Self::from_manifest(manifest, theme_dir, config_dir)))
    }

    pub fn from_manifest(manifest: ThemeManifest, theme_dir: &Path, config_dir: &Path) -> Self {
        let name = manifest.name.unwrap_or_else(|| {
            theme_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        let injects = manifest
            .inject
            .into_iter()
            .map(|(file, tabs)| Arc::new(InjectionUnit::from_file(theme_dir.join(file), tabs)))
            .collect();
        let patches = manifest
            .patches
            .iter()
            .map(|(patch_name, patch)| Patch::from_manifest(patch_name, patch, theme_dir))
            .collect();

        Self {
            name,
            author: manifest.author,
            version: manifest.version,
            manifest_version: manifest.manifest_version,
            path: theme_dir.to_path_buf(),
            config_dir: config_dir.to_path_buf(),
            injects,
            patches,
            dependencies: manifest.dependencies,
            enabled: false,
        }
    }

    /// Restores the persisted state. An enabled theme is injected right away when
    /// `inject_now`, otherwise its units are only armed for the watchdog.
    pub async fn load<T: TabTransport>(&mut self, transport: &T, inject_now: bool) -> Result<()> {
        if let Some(state) = store::load_state(&self.config_dir)? {
            self.enabled = state.active;
            for patch in &mut self.patches {
                if let Some(value) = state.patches.get(&patch.name) {
                    patch.set_value(value);
                }
                if let Some(values) = state.components.get(&patch.name) {
                    for component in &mut patch.components {
                        if let Some(value) = values.get(&component.name) {
                            component.set_value(value.clone());
                        }
                    }
                }
            }
        }
        for patch in &self.patches {
            patch.sync_components().await;
        }

        if !self.enabled {
            return Ok(());
        }
        if inject_now {
            self.inject_units(transport).await
        } else {
            for unit in self.get_all_injects() {
                unit.arm().await;
            }
            Ok(())
        }
    }

    pub fn save(&self) -> Result<()> {
        let mut state = ThemeState {
            active: self.enabled,
            ..ThemeState::default()
        };
        for patch in &self.patches {
            state.patches.insert(patch.name.clone(), patch.value().to_string());
            if !patch.components.is_empty() {
                state.components.insert(
                    patch.name.clone(),
                    patch
                        .components
                        .iter()
                        .map(|c| (c.name.clone(), c.value().to_string()))
                        .collect(),
                );
            }
        }
        store::save_state(&self.config_dir, &state)
    }

    /// Turns the theme on and persists that, even if a tab refused the stylesheet.
    pub async fn inject<T: TabTransport>(&mut self, transport: &T) -> Result<()> {
        self.enabled = true;
        let result = self.inject_units(transport).await;
        self.save()?;
        result
    }

    pub(crate) async fn inject_units<T: TabTransport>(&self, transport: &T) -> Result<()> {
        for unit in &self.injects {
            unit.inject(transport, None).await?;
        }
        for patch in &self.patches {
            patch.inject(transport).await?;
        }
        Ok(())
    }

    pub async fn remove<T: TabTransport>(&mut self, transport: &T) -> Result<Removal> {
        self.enabled = false;
        let removal = self.remove_units(transport).await;
        if !removal.is_clean() {
            debug!(theme = %self.name, missed = removal.missed, "some styles were already gone");
        }
        self.save()?;
        Ok(removal)
    }

    pub(crate) async fn remove_units<T: TabTransport>(&self, transport: &T) -> Removal {
        let mut total = Removal::default();
        for unit in &self.injects {
            total.merge(unit.remove(transport, None).await);
        }
        for patch in &self.patches {
            total.merge(patch.remove(transport).await);
        }
        total
    }

    /// Clears every injection, then the directory. Nothing is deleted when cleanup fails.
    pub async fn delete<T: TabTransport>(&mut self, transport: &T) -> Result<()> {
        self.remove(transport).await?;
        fs::remove_dir_all(&self.path)?;
        info!(theme = %self.name, path = %self.path.display(), "Deleted theme");
        Ok(())
    }

    /// Base units plus every patch's active units.
    pub fn get_all_injects(&self) -> Vec<Arc<InjectionUnit>> {
        let mut units = self.injects.clone();
        for patch in &self.patches {
            units.extend(patch.active_units());
        }
        units
    }

    pub fn patch(&self, name: &str) -> Option<&Patch> {
        self.patches.iter().find(|p| p.name == name)
    }

    pub fn patch_mut(&mut self, name: &str) -> Option<&mut Patch> {
        self.patches.iter_mut().find(|p| p.name == name)
    }

    /// Applies what a dependent theme asks of this one. Unknown patches are skipped.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, DependencyOverride>) {
        for (patch_name, wanted) in overrides {
            let Some(patch) = self.patch_mut(patch_name) else {
                debug!(theme = %self.name, patch = %patch_name, "override targets unknown patch");
                continue;
            };
            match wanted {
                DependencyOverride::Value(value) => {
                    patch.set_value(value);
                }
                DependencyOverride::Keyed(values) => {
                    for (key, value) in values {
                        match patch.component_mut(key) {
                            Some(component) => component.set_value(value.clone()),
                            None => {
                                patch.set_value(value);
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn summary(&self) -> ThemeSummary {
        ThemeSummary {
            name: self.name.clone(),
            author: self.author.clone(),
            version: self.version.clone(),
            manifest_version: self.manifest_version,
            enabled: self.enabled,
            patches: self.patches.iter().map(Patch::summary).collect(),
            dependencies: self.dependencies.keys().cloned().collect(),
        }
    }
}
