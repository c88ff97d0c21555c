use crate::error::{Error, Result};
use crate::inject::InjectionUnit;
use crate::order::DependencyGraph;
use crate::theme::{Theme, ThemeSummary};
use crate::transport::{TabId, TabTransport};
use crate::watchdog::{UI_MARKER, inject_test_element};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub themes_dir: PathBuf,
    /// Bundled themes. Their persisted state still lives under `themes_dir`.
    pub default_themes_dir: Option<PathBuf>,
    /// Tab that legacy `theme.css`-only themes target, and the one startup waits for.
    pub primary_tab: TabId,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub version: String,
    pub themes: usize,
    pub tabs: Vec<TabId>,
    pub injects: usize,
    pub injected: usize,
}

/// Themes plus the caches derived from them. The caches are only ever rebuilt whole.
#[derive(Default)]
struct Catalog {
    themes: Vec<Theme>,
    injects: Vec<Arc<InjectionUnit>>,
    tabs: Vec<TabId>,
}

impl Catalog {
    fn position(&self, name: &str) -> Option<usize> {
        self.themes.iter().position(|t| t.name == name)
    }

    fn theme_mut(&mut self, name: &str) -> Result<&mut Theme> {
        self.themes
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::not_found(format!("Did not find theme '{name}'")))
    }

    fn rebuild(&mut self) {
        self.injects = self.themes.iter().flat_map(Theme::get_all_injects).collect();
        self.tabs.clear();
        for unit in &self.injects {
            for tab in unit.tabs() {
                if !self.tabs.contains(tab) {
                    self.tabs.push(tab.clone());
                }
            }
        }
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns every theme and keeps their stylesheets applied.
///
/// Mutations and reloads hold the catalog write lock for their whole duration,
/// so reloads are serialized with user actions. The watchdog only takes a
/// snapshot of the caches and works on the units, each guarded by its own lock.
pub struct ThemeRegistry<T> {
    transport: Arc<T>,
    settings: RegistrySettings,
    catalog: RwLock<Catalog>,
    busy: AtomicBool,
}

impl<T: TabTransport> ThemeRegistry<T> {
    pub fn new(transport: Arc<T>, settings: RegistrySettings) -> Self {
        Self {
            transport,
            settings,
            catalog: RwLock::new(Catalog::default()),
            busy: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// True while a reload is in progress.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub async fn get_themes(&self) -> Vec<ThemeSummary> {
        self.catalog.read().await.themes.iter().map(Theme::summary).collect()
    }

    /// Cached units and tabs, as the watchdog sees them.
    pub async fn snapshot(&self) -> (Vec<Arc<InjectionUnit>>, Vec<TabId>) {
        let catalog = self.catalog.read().await;
        (catalog.injects.clone(), catalog.tabs.clone())
    }

    pub async fn status(&self) -> Status {
        let catalog = self.catalog.read().await;
        let mut injected = 0;
        for unit in &catalog.injects {
            if unit.is_enabled().await {
                injected += 1;
            }
        }
        Status {
            version: env!("CARGO_PKG_VERSION").to_string(),
            themes: catalog.themes.len(),
            tabs: catalog.tabs.clone(),
            injects: catalog.injects.len(),
            injected,
        }
    }

    /// Turns a theme on or off. Turning on first re-applies every dependency with
    /// the patch values this theme asks for.
    pub async fn set_theme_state(&self, name: &str, enabled: bool) -> Result<()> {
        let mut catalog = self.catalog.write().await;
        let mut chain = Vec::new();
        let result = self.apply_state(&mut catalog, name, enabled, &mut chain).await;
        catalog.rebuild();
        result
    }

    fn apply_state<'a>(
        &'a self,
        catalog: &'a mut Catalog,
        name: &'a str,
        enabled: bool,
        chain: &'a mut Vec<String>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            info!(theme = %name, enabled, "Setting theme state");
            let idx = catalog
                .position(name)
                .ok_or_else(|| Error::not_found(format!("Did not find theme {name}")))?;
            let transport = &*self.transport;

            if !enabled {
                return catalog.themes[idx].remove(transport).await.map(|_| ());
            }

            if chain.iter().any(|n| n == name) {
                let mut cycle = chain.clone();
                cycle.push(name.to_string());
                return Err(Error::Cycle(cycle));
            }
            chain.push(name.to_string());

            let dependencies = catalog.themes[idx].dependencies.clone();
            for (dep_name, overrides) in &dependencies {
                let Some(dep) = catalog.position(dep_name) else {
                    debug!(theme = %name, dependency = %dep_name, "dependency not installed");
                    continue;
                };
                if catalog.themes[dep].enabled {
                    catalog.themes[dep].remove(transport).await?;
                }
                catalog.themes[dep].apply_overrides(overrides);
                for patch in &catalog.themes[dep].patches {
                    patch.sync_components().await;
                }
                self.apply_state(catalog, dep_name, true, chain).await?;
            }
            chain.pop();

            catalog.themes[idx].inject(transport).await
        }
        .boxed()
    }

    /// Selects a patch option and swaps its stylesheets in if the theme is on.
    pub async fn set_patch_value(&self, theme: &str, patch: &str, value: &str) -> Result<()> {
        let mut catalog = self.catalog.write().await;
        let transport = &*self.transport;
        let target = catalog.theme_mut(theme)?;
        let live = target.enabled;
        let Some(selected) = target.patch_mut(patch) else {
            return Err(Error::not_found(format!(
                "Did not find patch '{patch}' for theme '{theme}'"
            )));
        };
        if selected.value() == value {
            debug!(theme = %theme, patch = %patch, value = %value, "Already injected");
            return Ok(());
        }
        selected.set_value(value);

        let mut result = Ok(());
        if live {
            selected.remove(transport).await;
            result = selected.inject(transport).await;
        }
        target.save()?;
        catalog.rebuild();
        result
    }

    pub async fn set_component_value(
        &self,
        theme: &str,
        patch: &str,
        component: &str,
        value: &str,
    ) -> Result<()> {
        let mut catalog = self.catalog.write().await;
        let transport = &*self.transport;
        let target = catalog.theme_mut(theme)?;
        let enabled = target.enabled;
        let Some(selected) = target.patch_mut(patch) else {
            return Err(Error::not_found(format!(
                "Did not find patch '{patch}' for theme '{theme}'"
            )));
        };
        let option = selected.value().to_string();
        let Some(component) = selected.component_mut(component) else {
            return Err(Error::not_found(format!(
                "Failed to find component '{component}'"
            )));
        };

        component.set_value(value);
        let live = enabled && component.on == option;
        component.generate_and_reinject(transport, live).await?;
        target.save()
    }

    /// Removes a theme's injections, its directory, and finally the theme itself.
    pub async fn delete_theme(&self, name: &str) -> Result<()> {
        let mut catalog = self.catalog.write().await;
        let idx = catalog
            .position(name)
            .ok_or_else(|| Error::not_found(format!("Could not find theme {name}")))?;
        catalog.themes[idx].delete(&*self.transport).await?;
        catalog.themes.remove(idx);
        catalog.rebuild();
        Ok(())
    }

    /// Drops every injection, rereads all theme directories and applies them again.
    pub async fn reset(&self) -> Result<()> {
        let _busy = BusyGuard::set(&self.busy);
        let mut catalog = self.catalog.write().await;
        info!("Reloading themes");

        for unit in &catalog.injects {
            unit.remove(&*self.transport, None).await;
        }
        self.parse_all(&mut catalog);
        self.load_stage_two(&mut catalog, true).await;
        Ok(())
    }

    /// Startup: parse, wait for the primary tab to come up, then arm enabled themes.
    /// Nothing is injected here; the watchdog's first pass does that.
    pub async fn start(&self, marker_attempts: u32, time_unit: Duration) {
        {
            let _busy = BusyGuard::set(&self.busy);
            let mut catalog = self.catalog.write().await;
            self.parse_all(&mut catalog);
        }

        if let Err(e) = inject_test_element(
            &*self.transport,
            &self.settings.primary_tab,
            marker_attempts,
            UI_MARKER,
            time_unit,
        )
        .await
        {
            error!(error = %e, "primary tab never came up");
        }

        let _busy = BusyGuard::set(&self.busy);
        let mut catalog = self.catalog.write().await;
        self.load_stage_two(&mut catalog, false).await;

        info!(
            themes = catalog.themes.len(),
            tabs = ?catalog.tabs,
            injects = catalog.injects.len(),
            "Initialized css loader"
        );
    }

    fn parse_all(&self, catalog: &mut Catalog) {
        info!("Loading themes...");
        catalog.themes.clear();

        let themes_dir = &self.settings.themes_dir;
        if !themes_dir.exists() {
            if let Err(e) = std::fs::create_dir_all(themes_dir) {
                warn!(path = %themes_dir.display(), error = %e, "could not create themes dir");
            }
        }
        self.parse_themes(catalog, themes_dir, themes_dir);
        if let Some(defaults) = &self.settings.default_themes_dir {
            if defaults.exists() {
                self.parse_themes(catalog, defaults, themes_dir);
            }
        }
    }

    fn parse_themes(&self, catalog: &mut Catalog, themes_dir: &Path, config_dir: &Path) {
        let entries = WalkDir::new(themes_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir());

        for entry in entries {
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            let theme_config = config_dir.join(&dir_name);
            match Theme::parse_dir(entry.path(), &theme_config, &self.settings.primary_tab) {
                Ok(Some(theme)) => {
                    debug!(dir = %dir_name, "Analyzing theme");
                    if catalog.position(&theme.name).is_none() {
                        info!(theme = %theme.name, "Adding theme");
                        catalog.themes.push(theme);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(dir = %dir_name, error = %e, "Exception while parsing a theme"),
            }
        }
    }

    /// Loads themes in dependency order, optionally injects the enabled ones in the
    /// same order, then rebuilds the caches and sorts themes by name.
    async fn load_stage_two(&self, catalog: &mut Catalog, inject_now: bool) {
        let graph = DependencyGraph::new(
            catalog
                .themes
                .iter()
                .map(|t| (t.name.as_str(), t.dependencies.keys().map(String::as_str))),
        );
        match graph.load_order() {
            Ok(order) => {
                debug!(?order, "theme load order");
                catalog
                    .themes
                    .sort_by_key(|t| order.iter().position(|n| *n == t.name).unwrap_or(usize::MAX));
            }
            Err(e) => {
                error!(error = %e, "falling back to name order");
                catalog.themes.sort_by(|a, b| a.name.cmp(&b.name));
            }
        }

        let transport = &*self.transport;
        for theme in &mut catalog.themes {
            info!(theme = %theme.name, "Loading theme");
            if let Err(e) = theme.load(transport, false).await {
                warn!(theme = %theme.name, error = %e, "could not restore theme state");
            }
        }
        if inject_now {
            for theme in catalog.themes.iter().filter(|t| t.enabled) {
                if let Err(e) = theme.inject_units(transport).await {
                    warn!(theme = %theme.name, error = %e, "injection failed");
                }
            }
        }

        catalog.rebuild();
        catalog.themes.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{self, ThemeState};
    use crate::test_utils::{Call, MockTransport, write_theme};
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        transport: Arc<MockTransport>,
        registry: ThemeRegistry<MockTransport>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("themes");
        std::fs::create_dir_all(&root).unwrap();
        let transport = Arc::new(MockTransport::default());
        let registry = ThemeRegistry::new(
            transport.clone(),
            RegistrySettings {
                themes_dir: root.clone(),
                default_themes_dir: None,
                primary_tab: "SP".to_string(),
            },
        );
        Fixture {
            _dir: dir,
            root,
            transport,
            registry,
        }
    }

    fn enable_on_disk(root: &Path, dir: &str) {
        let state = ThemeState {
            active: true,
            ..ThemeState::default()
        };
        store::save_state(&root.join(dir), &state).unwrap();
    }

    fn injected_css(transport: &MockTransport) -> Vec<String> {
        transport
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Inject(_, css) => Some(css),
                _ => None,
            })
            .collect()
    }

    fn write_abc(root: &Path) {
        write_theme(
            root,
            "A",
            &json!({ "name": "A", "inject": { "a.css": ["SP"] },
                     "dependencies": { "B": { "patch1": { "optX": "red" } } } }),
            &[("a.css", ".a {}")],
        );
        write_theme(
            root,
            "B",
            &json!({ "name": "B", "inject": { "b.css": ["SP"] },
                     "patches": { "patch1": { "default": "blue",
                                              "red": { "red.css": ["SP"] },
                                              "blue": { "blue.css": ["SP"] } } } }),
            &[("b.css", ".b {}"), ("red.css", ".red {}"), ("blue.css", ".blue {}")],
        );
        write_theme(
            root,
            "C",
            &json!({ "name": "C", "inject": { "c.css": ["QuickAccess"] } }),
            &[("c.css", ".c {}")],
        );
    }

    #[tokio::test]
    async fn enabling_a_theme_reapplies_its_dependency_with_overrides() {
        let f = fixture();
        write_abc(&f.root);
        f.registry.reset().await.unwrap();
        f.registry.set_theme_state("B", true).await.unwrap();
        assert_eq!(f.transport.live_css("SP"), vec![".b {}", ".blue {}"]);
        f.transport.clear_calls();

        f.registry.set_theme_state("A", true).await.unwrap();

        let calls = f.transport.calls();
        let first_inject = calls.iter().position(|c| matches!(c, Call::Inject(..))).unwrap();
        assert!(calls[..first_inject].iter().all(|c| matches!(c, Call::Remove(..))));
        assert_eq!(calls[..first_inject].len(), 2);
        assert_eq!(injected_css(&f.transport), vec![".b {}", ".red {}", ".a {}"]);
        assert!(f.transport.live_css("QuickAccess").is_empty());

        let themes = f.registry.get_themes().await;
        let by_name = |n: &str| themes.iter().find(|t| t.name == n).unwrap().clone();
        assert!(by_name("A").enabled);
        assert!(by_name("B").enabled);
        assert!(!by_name("C").enabled);
        assert_eq!(by_name("B").patches[0].value, "red");
    }

    #[tokio::test]
    async fn unknown_theme_is_not_found() {
        let f = fixture();
        let err = f.registry.set_theme_state("Nope", true).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(err.to_string(), "Did not find theme Nope");
    }

    #[tokio::test]
    async fn reset_injects_dependencies_before_dependents() {
        let f = fixture();
        write_theme(
            &f.root,
            "1-A",
            &json!({ "name": "A", "inject": { "a.css": ["SP"] }, "dependencies": { "B": {} } }),
            &[("a.css", ".a {}")],
        );
        write_theme(
            &f.root,
            "2-B",
            &json!({ "name": "B", "inject": { "b.css": ["SP"] }, "dependencies": { "C": {} } }),
            &[("b.css", ".b {}")],
        );
        write_theme(
            &f.root,
            "3-C",
            &json!({ "name": "C", "inject": { "c.css": ["SP"] } }),
            &[("c.css", ".c {}")],
        );
        for dir in ["1-A", "2-B", "3-C"] {
            enable_on_disk(&f.root, dir);
        }

        f.registry.reset().await.unwrap();

        assert_eq!(injected_css(&f.transport), vec![".c {}", ".b {}", ".a {}"]);
        let names: Vec<_> = f.registry.get_themes().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, ["A", "B", "C"]);
        assert!(!f.registry.is_busy());
    }

    #[tokio::test]
    async fn reset_replaces_previous_injections() {
        let f = fixture();
        write_abc(&f.root);
        enable_on_disk(&f.root, "C");
        f.registry.reset().await.unwrap();
        f.registry.reset().await.unwrap();
        assert_eq!(f.transport.live_css("QuickAccess"), vec![".c {}"]);
    }

    #[tokio::test]
    async fn dependency_cycle_fails_instead_of_looping() {
        let f = fixture();
        write_theme(
            &f.root,
            "A",
            &json!({ "name": "A", "inject": { "a.css": ["SP"] }, "dependencies": { "B": {} } }),
            &[("a.css", ".a {}")],
        );
        write_theme(
            &f.root,
            "B",
            &json!({ "name": "B", "inject": { "b.css": ["SP"] }, "dependencies": { "A": {} } }),
            &[("b.css", ".b {}")],
        );
        f.registry.reset().await.unwrap();
        assert_eq!(f.registry.get_themes().await.len(), 2);

        let err = f.registry.set_theme_state("A", true).await.unwrap_err();
        assert!(matches!(err, Error::Cycle(_)));
    }

    #[tokio::test]
    async fn first_theme_with_a_name_wins() {
        let f = fixture();
        write_theme(&f.root, "one", &json!({ "name": "Same" }), &[]);
        write_theme(&f.root, "two", &json!({ "name": "Same", "author": "other" }), &[]);
        f.registry.reset().await.unwrap();
        let themes = f.registry.get_themes().await;
        assert_eq!(themes.len(), 1);
        assert_eq!(themes[0].author, "");
    }

    #[tokio::test]
    async fn patch_value_swaps_stylesheets_of_enabled_theme() {
        let f = fixture();
        write_abc(&f.root);
        f.registry.reset().await.unwrap();
        f.registry.set_theme_state("B", true).await.unwrap();

        f.registry.set_patch_value("B", "patch1", "red").await.unwrap();
        assert_eq!(f.transport.live_css("SP"), vec![".b {}", ".red {}"]);

        f.registry.set_patch_value("B", "patch1", "green").await.unwrap();
        assert_eq!(f.registry.get_themes().await[1].patches[0].value, "red");

        let err = f.registry.set_patch_value("B", "missing", "red").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let saved = store::load_state(&f.root.join("B")).unwrap().unwrap();
        assert_eq!(saved.patches["patch1"], "red");
    }

    #[tokio::test]
    async fn component_value_is_generated_and_persisted() {
        let f = fixture();
        write_theme(
            &f.root,
            "Colors",
            &json!({ "name": "Colors", "patches": { "Accent": {
                "default": "Custom", "Custom": {},
                "components": [{ "name": "Color", "on": "Custom", "default": "#fff",
                                 "css_variable": "accent", "tabs": ["SP"] }] } } }),
            &[],
        );
        f.registry.reset().await.unwrap();
        f.registry.set_theme_state("Colors", true).await.unwrap();

        f.registry
            .set_component_value("Colors", "Accent", "Color", "#abc")
            .await
            .unwrap();
        assert_eq!(f.transport.live_css("SP"), vec![":root { --accent: #abc; }"]);

        let err = f
            .registry
            .set_component_value("Colors", "Accent", "Nope", "#abc")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to find component 'Nope'");

        f.registry.reset().await.unwrap();
        assert_eq!(f.transport.live_css("SP"), vec![":root { --accent: #abc; }"]);
    }

    #[tokio::test]
    async fn delete_forgets_theme_and_its_tabs() {
        let f = fixture();
        write_abc(&f.root);
        f.registry.reset().await.unwrap();
        f.registry.set_theme_state("C", true).await.unwrap();

        f.registry.delete_theme("C").await.unwrap();
        assert!(f.transport.live_css("QuickAccess").is_empty());
        assert!(!f.root.join("C").exists());
        let (_, tabs) = f.registry.snapshot().await;
        assert_eq!(tabs, ["SP"]);
        assert!(matches!(
            f.registry.delete_theme("C").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn bundled_themes_keep_state_in_the_user_dir() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("themes");
        let bundled = dir.path().join("bundled");
        write_theme(
            &bundled,
            "Stock",
            &json!({ "name": "Stock", "inject": { "s.css": ["SP"] } }),
            &[("s.css", ".s {}")],
        );
        let transport = Arc::new(MockTransport::default());
        let registry = ThemeRegistry::new(
            transport.clone(),
            RegistrySettings {
                themes_dir: user.clone(),
                default_themes_dir: Some(bundled),
                primary_tab: "SP".to_string(),
            },
        );
        registry.reset().await.unwrap();
        registry.set_theme_state("Stock", true).await.unwrap();
        assert!(store::load_state(&user.join("Stock")).unwrap().unwrap().active);
    }

    #[tokio::test(start_paused = true)]
    async fn start_arms_enabled_themes_without_injecting() {
        let f = fixture();
        write_abc(&f.root);
        enable_on_disk(&f.root, "C");
        f.transport.set_marker("SP", UI_MARKER);

        f.registry.start(5, Duration::from_secs(1)).await;

        assert!(injected_css(&f.transport).is_empty());
        let status = f.registry.status().await;
        assert_eq!(status.themes, 3);
        assert_eq!(status.injected, 1);
        assert_eq!(status.tabs, ["SP", "QuickAccess"]);
    }
}
