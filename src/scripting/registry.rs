//! Map id to live script context.
//!
//! Create and remove for one map run under that map's guard, so a reload
//! racing a level-load never leaves two contexts alive. Readers never block on
//! a rebuild: they see the old context, no context, or the new one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

use crate::error::RegistryError;
use crate::host::map_id;
use crate::scripting::context::{ContextDeps, ScriptContext};
use crate::scripting::ScriptProfile;
use crate::store::{ScriptStore, StaffMaps};

pub struct ContextRegistry {
    contexts: RwLock<HashMap<String, Arc<ScriptContext>>>,
    guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    store: Arc<ScriptStore>,
    staff: Arc<StaffMaps>,
    deps: ContextDeps,
}

impl ContextRegistry {
    pub fn new(store: Arc<ScriptStore>, staff: Arc<StaffMaps>, deps: ContextDeps) -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            guards: Mutex::new(HashMap::new()),
            store,
            staff,
            deps,
        }
    }

    pub fn store(&self) -> &Arc<ScriptStore> {
        &self.store
    }

    pub fn has_context(&self, map: &str) -> bool {
        self.contexts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&map_id(map))
    }

    pub fn get_context(&self, map: &str) -> Option<Arc<ScriptContext>> {
        self.contexts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&map_id(map))
            .cloned()
    }

    pub fn profile_for(&self, map: &str) -> ScriptProfile {
        if self.staff.contains(map) {
            ScriptProfile::Staff
        } else {
            ScriptProfile::Standard
        }
    }

    /// Builds a context from the live script, replacing any existing one.
    ///
    /// The previous context is stopped before the new script runs. If loading
    /// fails the map is left without a context.
    pub fn create_context(&self, map: &str) -> Result<Arc<ScriptContext>, RegistryError> {
        let id = map_id(map);
        self.with_guard(&id, || self.create_locked(&id))
    }

    /// The map's context, built from the live script when it has none. The
    /// flag is true when this call built it.
    pub fn ensure_context(&self, map: &str) -> Result<(Arc<ScriptContext>, bool), RegistryError> {
        let id = map_id(map);
        self.with_guard(&id, || match self.get_context(&id) {
            Some(ctx) => Ok((ctx, false)),
            None => self.create_locked(&id).map(|ctx| (ctx, true)),
        })
    }

    /// Stops and forgets the map's context. Returns false when there was none.
    pub fn remove_context(&self, map: &str) -> bool {
        let id = map_id(map);
        self.with_guard(&id, || self.remove_locked(&id))
    }

    /// Remove followed by create, as one step for this map. Rejected while a
    /// download for the map is still in flight.
    pub fn rebuild(&self, map: &str) -> Result<Arc<ScriptContext>, RegistryError> {
        let id = map_id(map);
        if self.store.is_downloading(&id) {
            return Err(RegistryError::Busy);
        }
        self.with_guard(&id, || {
            self.remove_locked(&id);
            self.create_locked(&id)
        })
    }

    /// Ids of maps with a context whose script file is `file_name`.
    /// File names are sanitized, so several level names can share one.
    pub fn maps_for_script_file(&self, file_name: &str) -> Vec<String> {
        let file_name = file_name.to_lowercase();
        self.map_ids()
            .into_iter()
            .filter(|id| self.store.file_name(id) == file_name)
            .collect()
    }

    pub fn map_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .contexts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn stop_all(&self) {
        for id in self.map_ids() {
            self.remove_context(&id);
        }
    }

    /// Runs `f` holding the map's guard. The guard entry is dropped again
    /// once nobody else is waiting on it.
    fn with_guard<T>(&self, id: &str, f: impl FnOnce() -> T) -> T {
        let guard = self
            .guards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id.to_string())
            .or_default()
            .clone();
        let out = {
            let _held = guard.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };
        drop(guard);

        let mut guards = self.guards.lock().unwrap_or_else(|e| e.into_inner());
        if guards.get(id).is_some_and(|g| Arc::strong_count(g) == 1) {
            guards.remove(id);
        }
        out
    }

    fn create_locked(&self, id: &str) -> Result<Arc<ScriptContext>, RegistryError> {
        let Some(source) = self.store.read_live(id)? else {
            return Err(RegistryError::NoScriptFile);
        };
        self.remove_locked(id);

        let profile = self.profile_for(id);
        match ScriptContext::load(id, &source, profile, self.deps.clone()) {
            Ok(ctx) => {
                self.contexts
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id.to_string(), ctx.clone());
                info!("[Lua scripts] Context ready for '{id}'");
                Ok(ctx)
            }
            Err(err) => {
                warn!("[Lua scripts] Could not load script for '{id}': {err}");
                Err(err)
            }
        }
    }

    fn remove_locked(&self, id: &str) -> bool {
        let previous = self
            .contexts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match previous {
            Some(ctx) => {
                ctx.stop();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;
    use crate::scripting::dispatcher::HostValue;
    use crate::testing::{context_deps, RecordingHost};
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<ContextRegistry>,
        store: Arc<ScriptStore>,
    }

    fn fixture_with_staff(staff_maps: &str) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = PluginConfig {
            base_dir: dir.path().to_path_buf(),
            ..PluginConfig::default()
        };
        let host = Arc::new(RecordingHost::with_levels(&["arena", "town", "hub"]));
        std::fs::write(config.staff_maps_path(), staff_maps).expect("staff list");
        let store = Arc::new(ScriptStore::open(&config).expect("store"));
        let staff = Arc::new(StaffMaps::load(config.staff_maps_path(), host.as_ref()).expect("staff"));
        let deps = context_deps(&host, Some(Duration::from_millis(500)));
        let registry = Arc::new(ContextRegistry::new(store.clone(), staff, deps));
        Fixture {
            _dir: dir,
            registry,
            store,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_staff("")
    }

    fn write_live(store: &ScriptStore, map: &str, source: &str) {
        std::fs::write(store.live_path(map), source).expect("write live script");
    }

    #[test]
    fn missing_script_file_leaves_map_without_context() {
        let f = fixture();
        let result = f.registry.create_context("town");
        assert!(matches!(result, Err(RegistryError::NoScriptFile)));
        assert!(!f.registry.has_context("town"));
        assert!(f.registry.get_context("town").is_none());
    }

    #[test]
    fn rebuild_reflects_the_newest_live_script() {
        let f = fixture();
        write_live(&f.store, "arena", "function version() return 1 end");
        let first = f.registry.create_context("Arena").expect("create");

        write_live(&f.store, "arena", "function version() return 2 end");
        let second = f.registry.rebuild("arena").expect("rebuild");

        assert!(first.is_stopped());
        assert_eq!(second.call("version", vec![]).expect("call"), HostValue::Int(2));
        let current = f.registry.get_context("arena").expect("context");
        assert!(Arc::ptr_eq(&current, &second));
    }

    #[test]
    fn failed_load_drops_previous_context() {
        let f = fixture();
        write_live(&f.store, "arena", "function onLevelLoad() end");
        let old = f.registry.create_context("arena").expect("create");

        write_live(&f.store, "arena", "function onLevelLoad(");
        let result = f.registry.rebuild("arena");

        assert!(matches!(result, Err(RegistryError::ScriptLoad(_))));
        assert!(old.is_stopped());
        assert!(!f.registry.has_context("arena"));
    }

    #[test]
    fn rebuild_is_rejected_while_downloading() {
        let f = fixture();
        write_live(&f.store, "arena", "function onLevelLoad() end");
        f.registry.create_context("arena").expect("create");
        let _staging = f.store.begin_download("arena").expect("begin");

        assert!(matches!(f.registry.rebuild("arena"), Err(RegistryError::Busy)));
        assert!(f.registry.has_context("arena"));
    }

    #[test]
    fn concurrent_rebuilds_leave_exactly_one_live_context() {
        let f = fixture();
        write_live(&f.store, "arena", "function onLevelLoad() end");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = f.registry.clone();
                std::thread::spawn(move || registry.rebuild("arena").expect("rebuild"))
            })
            .collect();
        let built: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();

        let current = f.registry.get_context("arena").expect("context");
        let live: Vec<_> = built.iter().filter(|c| !c.is_stopped()).collect();
        assert_eq!(live.len(), 1);
        assert!(Arc::ptr_eq(live[0], &current));
        assert_eq!(f.registry.map_ids(), vec!["arena".to_string()]);
    }

    #[test]
    fn remove_and_stop_all_release_contexts() {
        let f = fixture();
        write_live(&f.store, "arena", "x = 1");
        write_live(&f.store, "town", "x = 2");
        let arena = f.registry.create_context("arena").expect("arena");
        let town = f.registry.create_context("town").expect("town");

        assert!(f.registry.remove_context("arena"));
        assert!(!f.registry.remove_context("arena"));
        assert!(arena.is_stopped());

        f.registry.stop_all();
        assert!(town.is_stopped());
        assert!(f.registry.map_ids().is_empty());
    }

    #[test]
    fn guards_are_released_after_use() {
        let f = fixture();
        write_live(&f.store, "arena", "x = 1");
        for map in ["arena", "town", "hub"] {
            let _ = f.registry.create_context(map);
            f.registry.remove_context(map);
        }
        f.registry.rebuild("arena").expect("rebuild");
        f.registry.stop_all();

        assert!(f.registry.guards.lock().unwrap().is_empty());
    }

    #[test]
    fn concurrent_ensure_builds_one_context() {
        let f = fixture();
        write_live(&f.store, "arena", "function onLevelLoad() end");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = f.registry.clone();
                std::thread::spawn(move || registry.ensure_context("arena").expect("ensure"))
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();

        assert_eq!(results.iter().filter(|(_, built)| *built).count(), 1);
        let current = f.registry.get_context("arena").expect("context");
        assert!(results.iter().all(|(ctx, _)| Arc::ptr_eq(ctx, &current)));
        assert!(!current.is_stopped());
    }

    #[test]
    fn script_files_map_back_to_levels_with_unsafe_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = PluginConfig {
            base_dir: dir.path().to_path_buf(),
            ..PluginConfig::default()
        };
        let host = Arc::new(RecordingHost::with_levels(&["a b", "arena"]));
        let store = Arc::new(ScriptStore::open(&config).expect("store"));
        let staff = Arc::new(StaffMaps::load(config.staff_maps_path(), host.as_ref()).expect("staff"));
        let registry = ContextRegistry::new(store.clone(), staff, context_deps(&host, None));
        write_live(&store, "a b", "x = 1");
        write_live(&store, "arena", "x = 1");
        registry.create_context("A B").expect("create");
        registry.create_context("arena").expect("create");

        assert_eq!(store.file_name("a b"), "a_b.lua");
        assert_eq!(registry.maps_for_script_file("a_b.lua"), vec!["a b".to_string()]);
        assert_eq!(registry.maps_for_script_file("Arena.lua"), vec!["arena".to_string()]);
        assert!(registry.maps_for_script_file("town.lua").is_empty());
    }

    #[test]
    fn staff_maps_get_the_staff_profile() {
        let f = fixture_with_staff("hub\n");
        write_live(&f.store, "hub", "x = 1");
        write_live(&f.store, "arena", "x = 1");

        let hub = f.registry.create_context("hub").expect("hub");
        let arena = f.registry.create_context("arena").expect("arena");
        assert_eq!(hub.profile(), ScriptProfile::Staff);
        assert_eq!(arena.profile(), ScriptProfile::Standard);
    }
}
