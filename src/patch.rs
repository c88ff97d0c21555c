use crate::error::Result;
use crate::inject::{InjectionUnit, Removal};
use crate::transport::{TabId, TabTransport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// A patch as written in `theme.json`. Every key besides the named ones is an option
/// mapping stylesheet files to the tabs they target.
#[derive(Deserialize, Debug, Clone)]
pub struct PatchManifest {
    pub default: String,
    #[serde(rename = "type", default = "default_patch_kind")]
    pub kind: String,
    #[serde(default)]
    pub components: Vec<ComponentManifest>,
    #[serde(flatten)]
    pub options: BTreeMap<String, serde_json::Value>,
}

fn default_patch_kind() -> String {
    "dropdown".to_string()
}

#[derive(Deserialize, Debug, Clone)]
pub struct ComponentManifest {
    pub name: String,
    #[serde(rename = "type", default = "default_component_kind")]
    pub kind: String,
    /// The option this component belongs to.
    pub on: String,
    pub default: String,
    pub css_variable: String,
    pub tabs: Vec<TabId>,
}

fn default_component_kind() -> String {
    "color-picker".to_string()
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ComponentSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub on: String,
    pub value: String,
    pub default: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PatchSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub default: String,
    pub value: String,
    pub options: Vec<String>,
    pub components: Vec<ComponentSummary>,
}

/// A user-adjustable value rendered into a CSS custom property.
pub struct Component {
    pub name: String,
    pub kind: String,
    pub on: String,
    pub default: String,
    css_variable: String,
    value: String,
    unit: Arc<InjectionUnit>,
}

impl Component {
    pub fn from_manifest(manifest: &ComponentManifest) -> Self {
        let css = render_variable(&manifest.css_variable, &manifest.default);
        Self {
            name: manifest.name.clone(),
            kind: manifest.kind.clone(),
            on: manifest.on.clone(),
            default: manifest.default.clone(),
            css_variable: manifest.css_variable.clone(),
            value: manifest.default.clone(),
            unit: Arc::new(InjectionUnit::generated(&css, manifest.tabs.iter().cloned())),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Stores the value. The stylesheet only changes on the next `generate_and_reinject`.
    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }

    pub fn generate(&self) -> String {
        render_variable(&self.css_variable, &self.value)
    }

    pub fn unit(&self) -> &Arc<InjectionUnit> {
        &self.unit
    }

    /// Regenerates the stylesheet and, when `live`, swaps it in on every tab.
    pub async fn generate_and_reinject<T: TabTransport>(
        &self,
        transport: &T,
        live: bool,
    ) -> Result<()> {
        self.unit.set_css(&self.generate()).await;
        if !live {
            return Ok(());
        }
        self.unit.remove(transport, None).await;
        self.unit.inject(transport, None).await
    }

    fn summary(&self) -> ComponentSummary {
        ComponentSummary {
            name: self.name.clone(),
            kind: self.kind.clone(),
            on: self.on.clone(),
            value: self.value.clone(),
            default: self.default.clone(),
        }
    }
}

fn render_variable(variable: &str, value: &str) -> String {
    format!(":root {{ --{variable}: {value}; }}")
}

pub struct Patch {
    pub name: String,
    pub kind: String,
    pub default: String,
    options: Vec<String>,
    value: String,
    option_units: BTreeMap<String, Vec<Arc<InjectionUnit>>>,
    pub components: Vec<Component>,
}

impl Patch {
    /// Builds a patch whose option stylesheets live under `theme_dir`.
    pub fn from_manifest(name: &str, manifest: &PatchManifest, theme_dir: &Path) -> Self {
        let mut options = Vec::new();
        let mut option_units = BTreeMap::new();
        for (option, files) in &manifest.options {
            let Some(files) = files.as_object() else {
                continue;
            };
            let units = files
                .iter()
                .map(|(file, tabs)| {
                    let tabs: Vec<TabId> = tabs
                        .as_array()
                        .map(|t| t.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                        .unwrap_or_default();
                    Arc::new(InjectionUnit::from_file(theme_dir.join(file), tabs))
                })
                .collect();
            options.push(option.clone());
            option_units.insert(option.clone(), units);
        }

        let value = if options.contains(&manifest.default) || options.is_empty() {
            manifest.default.clone()
        } else {
            options[0].clone()
        };

        Self {
            name: name.to_string(),
            kind: manifest.kind.clone(),
            default: manifest.default.clone(),
            options,
            value,
            option_units,
            components: manifest.components.iter().map(Component::from_manifest).collect(),
        }
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Selects `value` if it is one of the options. Anything else is ignored.
    pub fn set_value(&mut self, value: &str) -> bool {
        if !self.options.iter().any(|o| o == value) {
            return false;
        }
        self.value = value.to_string();
        true
    }

    pub fn component_mut(&mut self, name: &str) -> Option<&mut Component> {
        self.components.iter_mut().find(|c| c.name == name)
    }

    /// Units of the selected option plus the components that belong to it.
    pub fn active_units(&self) -> Vec<Arc<InjectionUnit>> {
        let mut units: Vec<_> = self
            .option_units
            .get(&self.value)
            .map(|u| u.to_vec())
            .unwrap_or_default();
        units.extend(
            self.components
                .iter()
                .filter(|c| c.on == self.value)
                .map(|c| c.unit.clone()),
        );
        units
    }

    fn all_units(&self) -> impl Iterator<Item = &Arc<InjectionUnit>> {
        self.option_units
            .values()
            .flatten()
            .chain(self.components.iter().map(|c| &c.unit))
    }

    /// Pushes the components' current values into their stylesheets.
    pub async fn sync_components(&self) {
        for component in &self.components {
            component.unit.set_css(&component.generate()).await;
        }
    }

    pub async fn inject<T: TabTransport>(&self, transport: &T) -> Result<()> {
        for unit in self.active_units() {
            unit.inject(transport, None).await?;
        }
        Ok(())
    }

    /// Removes every option's units, not just the selected one's.
    pub async fn remove<T: TabTransport>(&self, transport: &T) -> Removal {
        let mut total = Removal::default();
        for unit in self.all_units() {
            total.merge(unit.remove(transport, None).await);
        }
        total
    }

    pub async fn arm(&self) {
        for unit in self.active_units() {
            unit.arm().await;
        }
    }

    pub fn summary(&self) -> PatchSummary {
        PatchSummary {
            name: self.name.clone(),
            kind: self.kind.clone(),
            default: self.default.clone(),
            value: self.value.clone(),
            options: self.options.clone(),
            components: self.components.iter().map(Component::summary).collect(),
        }
    }
}
