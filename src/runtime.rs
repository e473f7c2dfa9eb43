//! The process-wide scripting state, built once at startup.

use std::sync::Arc;

use anyhow::Context as _;
use tokio::runtime::{Handle, Runtime};
use tracing::{info, warn};

use crate::bridge::EventBridge;
use crate::commands::CommandSurface;
use crate::config::PluginConfig;
use crate::download::Downloader;
use crate::events::EntryPoint;
use crate::file_watcher::ScriptWatcher;
use crate::host::Host;
use crate::scripting::context::{ContextDeps, ExecutionLimits};
use crate::scripting::dispatcher::{
    register_builtin_operations, FailureReporter, HostDispatcher, UsernameMap,
};
use crate::scripting::registry::ContextRegistry;
use crate::store::{ScriptStore, StaffMaps};

pub struct LuaRuntime {
    config: PluginConfig,
    dispatcher: Arc<HostDispatcher>,
    registry: Arc<ContextRegistry>,
    bridge: EventBridge,
    commands: CommandSurface,
    watcher: Option<ScriptWatcher>,
    tokio: Option<Runtime>,
}

impl LuaRuntime {
    /// Prepares the script directories and wires every component to `host`.
    /// No context is created until the host reports a level load.
    pub fn start(mut config: PluginConfig, host: Arc<dyn Host>) -> anyhow::Result<Self> {
        config.normalize();
        let tokio = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("lua-download")
            .enable_all()
            .build()
            .context("failed to start the download runtime")?;

        let store = Arc::new(ScriptStore::open(&config).with_context(|| {
            format!("failed to prepare script directories under {}", config.base_dir.display())
        })?);
        let staff = Arc::new(
            StaffMaps::load(config.staff_maps_path(), host.as_ref())
                .context("failed to load the staff map list")?,
        );

        let usernames = Arc::new(UsernameMap::default());
        let reporter = Arc::new(FailureReporter::new(
            host.clone(),
            usernames.clone(),
            config.detail_rank,
        ));
        let dispatcher = Arc::new(HostDispatcher::new(reporter.clone()));
        register_builtin_operations(&dispatcher, host.clone());

        let deps = ContextDeps {
            dispatcher: dispatcher.clone(),
            reporter: reporter.clone(),
            usernames: usernames.clone(),
            limits: ExecutionLimits {
                budget: config.call_budget(),
                instruction_interval: config.hook_instruction_interval,
            },
        };
        let registry = Arc::new(ContextRegistry::new(store.clone(), staff.clone(), deps));
        let bridge = EventBridge::new(registry.clone(), usernames);

        let downloader = Arc::new(
            Downloader::new(&config, store.clone(), tokio.handle().clone())
                .context("failed to build the HTTP client")?,
        );
        let commands = CommandSurface::new(
            &config,
            host.clone(),
            registry.clone(),
            downloader,
            staff,
            reporter,
        );

        let watcher = if config.watch_scripts {
            let registry = registry.clone();
            let host = host.clone();
            match ScriptWatcher::start(store.scripts_dir(), move |file| {
                for map in registry.maps_for_script_file(file) {
                    hot_reload(&registry, host.as_ref(), &map);
                }
            }) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!("[Lua watcher] Failed to watch {}: {e}", store.scripts_dir().display());
                    None
                }
            }
        } else {
            None
        };

        info!(
            "[Lua scripts] Ready: scripts in {}, {} host operation(s)",
            store.scripts_dir().display(),
            dispatcher.operation_names().len()
        );
        Ok(Self {
            config,
            dispatcher,
            registry,
            bridge,
            commands,
            watcher,
            tokio: Some(tokio),
        })
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Register host operations here before levels load.
    pub fn dispatcher(&self) -> &Arc<HostDispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBridge {
        &self.bridge
    }

    pub fn commands(&self) -> &CommandSurface {
        &self.commands
    }

    /// Handle of the runtime downloads run on.
    pub fn handle(&self) -> Option<Handle> {
        self.tokio.as_ref().map(|rt| rt.handle().clone())
    }

    /// Stops every context and the watcher. Downloads still in flight are
    /// abandoned; their staging files are cleared on the next start.
    pub fn shutdown(mut self) {
        self.shutdown_in_place();
    }

    fn shutdown_in_place(&mut self) {
        self.watcher.take();
        self.registry.stop_all();
        if let Some(rt) = self.tokio.take() {
            rt.shutdown_background();
        }
        info!("[Lua scripts] Shut down");
    }
}

impl Drop for LuaRuntime {
    fn drop(&mut self) {
        if self.tokio.is_some() {
            self.shutdown_in_place();
        }
    }
}

/// Rebuilds a map's context after its script changed on disk, if the map
/// currently runs one.
fn hot_reload(registry: &ContextRegistry, host: &dyn Host, map: &str) {
    if !registry.has_context(map) {
        return;
    }
    match registry.rebuild(map) {
        Ok(ctx) => {
            info!("[Lua watcher] Reloaded script for '{map}'");
            ctx.dispatch(EntryPoint::LevelLoad, None, vec![]);
            for player in host.level_players(map) {
                ctx.dispatch(EntryPoint::PlayerJoin, Some(&player), vec![(&player).into()]);
            }
        }
        Err(e) => warn!("[Lua watcher] Could not reload '{map}': {e}"),
    }
}
