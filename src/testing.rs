use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::PluginConfig;
use crate::host::{map_id, Host, PlayerInfo, Rank};
use crate::scripting::context::{ContextDeps, ExecutionLimits};
use crate::scripting::dispatcher::{
    register_builtin_operations, FailureReporter, HostDispatcher, UsernameMap,
};
use crate::scripting::registry::ContextRegistry;
use crate::store::{ScriptStore, StaffMaps};

/// In-memory host that records every message sent through it.
#[derive(Default)]
pub(crate) struct RecordingHost {
    levels: Mutex<HashSet<String>>,
    players: Mutex<Vec<PlayerInfo>>,
    owners: Mutex<HashMap<String, String>>,
    blocks: Mutex<HashMap<(String, i32, i32, i32), u16>>,
    messages: Mutex<Vec<(String, String)>>,
    temp_blocks: Mutex<Vec<(String, i32, i32, i32, u16)>>,
}

impl RecordingHost {
    pub(crate) fn with_levels(levels: &[&str]) -> Self {
        let host = Self::default();
        host.levels
            .lock()
            .unwrap()
            .extend(levels.iter().map(|l| map_id(l)));
        host
    }

    pub(crate) fn add_player(&self, name: &str, rank: Rank, level: &str) -> PlayerInfo {
        let info = PlayerInfo {
            name: name.to_string(),
            truename: name.to_string(),
            rank,
            level: level.to_string(),
        };
        self.players.lock().unwrap().push(info.clone());
        info
    }

    pub(crate) fn set_owner(&self, level: &str, player: &str) {
        self.owners
            .lock()
            .unwrap()
            .insert(map_id(level), player.to_string());
    }

    pub(crate) fn messages_for(&self, player: &str) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to == player)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub(crate) fn all_messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }

    /// Temporary blocks sent to `player`, in send order.
    pub(crate) fn temp_blocks_for(&self, player: &str) -> Vec<(i32, i32, i32, u16)> {
        self.temp_blocks
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, ..)| to == player)
            .map(|&(_, x, y, z, block)| (x, y, z, block))
            .collect()
    }
}

impl Host for RecordingHost {
    fn find_player(&self, name: &str) -> Option<PlayerInfo> {
        self.players
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    fn message(&self, player: &str, message: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((player.to_string(), message.to_string()));
    }

    fn level_players(&self, level: &str) -> Vec<PlayerInfo> {
        let level = map_id(level);
        self.players
            .lock()
            .unwrap()
            .iter()
            .filter(|p| map_id(&p.level) == level)
            .cloned()
            .collect()
    }

    fn level_exists(&self, level: &str) -> bool {
        self.levels.lock().unwrap().contains(&map_id(level))
    }

    fn is_realm_owner(&self, level: &str, player: &str) -> bool {
        self.owners.lock().unwrap().get(&map_id(level)).map(String::as_str) == Some(player)
    }

    fn set_block(&self, level: &str, x: i32, y: i32, z: i32, block: u16) -> bool {
        if x < 0 || y < 0 || z < 0 || !self.level_exists(level) {
            return false;
        }
        self.blocks
            .lock()
            .unwrap()
            .insert((map_id(level), x, y, z), block);
        true
    }

    fn get_block(&self, level: &str, x: i32, y: i32, z: i32) -> Option<u16> {
        if x < 0 || y < 0 || z < 0 || !self.level_exists(level) {
            return None;
        }
        Some(
            self.blocks
                .lock()
                .unwrap()
                .get(&(map_id(level), x, y, z))
                .copied()
                .unwrap_or(0),
        )
    }

    fn send_temp_block(&self, player: &str, x: i32, y: i32, z: i32, block: u16) -> bool {
        let Some(info) = self.find_player(player) else {
            return false;
        };
        if x < 0 || y < 0 || z < 0 || !self.level_exists(&info.level) {
            return false;
        }
        self.temp_blocks
            .lock()
            .unwrap()
            .push((player.to_string(), x, y, z, block));
        true
    }
}

pub(crate) fn context_deps(host: &Arc<RecordingHost>, budget: Option<Duration>) -> ContextDeps {
    let usernames = Arc::new(UsernameMap::default());
    let reporter = Arc::new(FailureReporter::new(
        host.clone(),
        usernames.clone(),
        Rank::ADV_BUILDER,
    ));
    let dispatcher = Arc::new(HostDispatcher::new(reporter.clone()));
    register_builtin_operations(&dispatcher, host.clone());
    ContextDeps {
        dispatcher,
        reporter,
        usernames,
        limits: ExecutionLimits {
            budget,
            instruction_interval: 1_000,
        },
    }
}

/// A registry over a temporary script directory, wired to a [`RecordingHost`].
pub(crate) struct Harness {
    _dir: tempfile::TempDir,
    pub config: PluginConfig,
    pub host: Arc<RecordingHost>,
    pub store: Arc<ScriptStore>,
    pub staff: Arc<StaffMaps>,
    pub deps: ContextDeps,
    pub registry: Arc<ContextRegistry>,
}

impl Harness {
    pub(crate) fn new(levels: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = PluginConfig {
            base_dir: dir.path().to_path_buf(),
            ..PluginConfig::default()
        };
        let host = Arc::new(RecordingHost::with_levels(levels));
        let store = Arc::new(ScriptStore::open(&config).unwrap());
        let staff = Arc::new(StaffMaps::load(config.staff_maps_path(), host.as_ref()).unwrap());
        let deps = context_deps(&host, Some(Duration::from_millis(500)));
        let registry = Arc::new(ContextRegistry::new(
            store.clone(),
            staff.clone(),
            deps.clone(),
        ));
        Self {
            _dir: dir,
            config,
            host,
            store,
            staff,
            deps,
            registry,
        }
    }

    pub(crate) fn write_live(&self, map: &str, source: &str) {
        std::fs::write(self.store.live_path(map), source).unwrap();
    }
}
