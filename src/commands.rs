//! `/lua`, `/stafflua` and `/input`.
//!
//! Permission checks run here against the host's rank and realm-ownership
//! answers; everything else is delegated to the store, the downloader and the
//! registry.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::PluginConfig;
use crate::download::{filter_url, Downloader};
use crate::error::{CallError, RegistryError, StoreError};
use crate::events::EntryPoint;
use crate::host::{CommandOrigin, Host, PlayerInfo, Rank};
use crate::scripting::api::ScriptArg;
use crate::scripting::dispatcher::{FailureReporter, PlayerHandle};
use crate::scripting::registry::ContextRegistry;
use crate::store::StaffMaps;

const LUA_HELP: [&str; 6] = [
    "&T/Lua upload [url]",
    "&HUploads a .lua script file to your map.",
    "&T/Lua reload",
    "&HReloads and restarts the lua script of the current map.",
    "&T/Lua call [function] [args]",
    "&HCalls a lua function with optional arguments.",
];

const STAFF_HELP: [&str; 4] = [
    "&T/StaffLua add [map]",
    "&HLets the map's lua script use staff-only features.",
    "&T/StaffLua list",
    "&HLists maps whose scripts run with staff features.",
];

/// Result of handing a command line to [`CommandSurface::handle`].
#[derive(Debug)]
pub enum CommandOutcome {
    /// Not one of this crate's commands.
    NotOurs,
    Done,
    /// An upload was started; the handle resolves once the player has been told the result.
    Downloading(JoinHandle<()>),
}

pub struct CommandSurface {
    host: Arc<dyn Host>,
    registry: Arc<ContextRegistry>,
    downloader: Arc<Downloader>,
    staff: Arc<StaffMaps>,
    reporter: Arc<FailureReporter>,
    manage_any_rank: Rank,
    staff_rank: Rank,
}

impl CommandSurface {
    pub fn new(
        config: &PluginConfig,
        host: Arc<dyn Host>,
        registry: Arc<ContextRegistry>,
        downloader: Arc<Downloader>,
        staff: Arc<StaffMaps>,
        reporter: Arc<FailureReporter>,
    ) -> Self {
        Self {
            host,
            registry,
            downloader,
            staff,
            reporter,
            manage_any_rank: config.manage_any_rank,
            staff_rank: config.staff_rank,
        }
    }

    /// Routes `/lua`, its aliases `/lup` and `/call`, `/stafflua` and `/input`.
    pub fn handle(
        &self,
        player: &PlayerInfo,
        command: &str,
        args: &str,
        origin: CommandOrigin,
    ) -> CommandOutcome {
        match command.to_ascii_lowercase().as_str() {
            "lua" => self.lua(player, args, origin),
            "lup" => self.lua(player, &format!("upload {args}"), origin),
            "call" => self.lua(player, &format!("call {args}"), origin),
            "stafflua" => {
                self.staff_lua(player, args);
                CommandOutcome::Done
            }
            "input" => {
                self.input(player, args);
                CommandOutcome::Done
            }
            _ => CommandOutcome::NotOurs,
        }
    }

    pub fn lua(&self, player: &PlayerInfo, message: &str, origin: CommandOrigin) -> CommandOutcome {
        let args: Vec<&str> = message.split_whitespace().collect();
        let sub = args.first().map(|s| s.to_ascii_lowercase());
        match sub.as_deref() {
            Some("upload") => match self.upload(player, args.get(1).copied(), origin) {
                Some(handle) => CommandOutcome::Downloading(handle),
                None => CommandOutcome::Done,
            },
            Some("reload") => {
                self.reload(player);
                CommandOutcome::Done
            }
            Some("call") => {
                self.call(player, &args[1..], origin);
                CommandOutcome::Done
            }
            _ => {
                self.help(player, &LUA_HELP);
                CommandOutcome::Done
            }
        }
    }

    fn tell(&self, player: &PlayerInfo, message: &str) {
        self.host.message(&player.name, message);
    }

    fn help(&self, player: &PlayerInfo, lines: &[&str]) {
        for line in lines {
            self.tell(player, line);
        }
    }

    fn can_manage(&self, player: &PlayerInfo) -> bool {
        player.rank >= self.manage_any_rank || self.host.is_realm_owner(&player.level, &player.name)
    }

    fn upload(
        &self,
        player: &PlayerInfo,
        url: Option<&str>,
        origin: CommandOrigin,
    ) -> Option<JoinHandle<()>> {
        if let CommandOrigin::MessageBlock { .. } = origin {
            self.tell(player, "&cYou cannot run /lua upload in message blocks!");
            return None;
        }
        if !self.can_manage(player) {
            self.tell(player, "&cYou can only upload scripts to maps that you own.");
            return None;
        }
        let Some(url) = url else {
            self.tell(player, "&cYou need to specify the URL of a .lua script for this map.");
            return None;
        };
        let url = match filter_url(url) {
            Ok(url) => url,
            Err(_) => {
                self.tell(player, "&cThat URL cannot be used to download a script.");
                return None;
            }
        };

        let store = self.registry.store();
        let staging = match store.begin_download(&player.level) {
            Ok(staging) => staging,
            Err(StoreError::AlreadyInProgress) => {
                self.tell(
                    player,
                    "&cScript file is not accessible! Is there already a download in progress?",
                );
                return None;
            }
            Err(err) => {
                self.reporter.report(
                    Some(&player.truename),
                    "&cCould not prepare the script file.",
                    &err,
                );
                return None;
            }
        };

        self.tell(player, "Downloading the script file...");
        let host = self.host.clone();
        let name = player.name.clone();
        let file_name = store.file_name(&player.level);
        let shown_url = url.to_string();
        let handle = self.downloader.spawn(staging, url, move |outcome| match outcome {
            Ok(_) => {
                host.message(&name, &format!("Done! Uploaded %b{file_name} %Sfrom URL {shown_url}"));
                host.message(&name, "Type %a/lua reload%S to load the script.");
            }
            Err(StoreError::TooLarge { .. }) => {
                host.message(&name, "&cScript file is too large! Aborting download.");
            }
            Err(err) => {
                host.message(
                    &name,
                    &format!("&cError while downloading the script file! ({})", download_failure(&err)),
                );
            }
        });
        Some(handle)
    }

    fn reload(&self, player: &PlayerInfo) {
        if !self.can_manage(player) {
            self.tell(player, "&cYou may only perform this command on maps that you own.");
            return;
        }
        let level = player.level.as_str();
        self.tell(player, &format!("Reloading lua scripts for map %b{level}%S..."));

        let ctx = match self.registry.rebuild(level) {
            Ok(ctx) => ctx,
            Err(RegistryError::Busy) => {
                self.tell(
                    player,
                    "&cScript file is not accessible! The script file may still be in downloading.",
                );
                return;
            }
            Err(RegistryError::NoScriptFile) => {
                self.tell(player, "&cLua script in this map was not found.");
                return;
            }
            Err(err) => {
                self.reporter.report(
                    Some(&player.truename),
                    "&cThe lua script of this map failed to load.",
                    &err,
                );
                return;
            }
        };

        self.tell(player, "Reload completed!");
        info!("[Lua scripts] {} reloaded the script for '{level}'", player.name);
        ctx.dispatch(EntryPoint::LevelLoad, None, vec![]);
        for present in self.host.level_players(level) {
            ctx.dispatch(EntryPoint::PlayerJoin, Some(&present), vec![(&present).into()]);
        }
    }

    fn call(&self, player: &PlayerInfo, args: &[&str], origin: CommandOrigin) {
        let from_block = match origin {
            CommandOrigin::MessageBlock { x, y, z } => Some((x, y, z)),
            CommandOrigin::Chat => None,
        };
        if from_block.is_none() && !self.can_manage(player) {
            self.tell(
                player,
                "&cYou can only use &b/lua call&c if it is in a message block or you are the map owner.",
            );
            return;
        }
        let Some(ctx) = self.registry.get_context(&player.level) else {
            self.tell(player, "&cThis map doesn't have a lua script!");
            return;
        };
        let Some((function, rest)) = args.split_first() else {
            self.tell(player, "&cYou need to specify the function name to call.");
            return;
        };

        let mut call_args = vec![ScriptArg::CallEvent {
            player: PlayerHandle::from(player),
            block: from_block,
        }];
        call_args.extend(rest.iter().map(|a| ScriptArg::from(*a)));

        match ctx.call_by_player(function, player, call_args) {
            Ok(_) => {}
            Err(CallError::NotFound(_)) => {
                self.tell(player, &format!("&cFunction %b{function}&c is not defined in this map's script."));
            }
            Err(CallError::Stopped) => self.tell(player, "&cThis map doesn't have a lua script!"),
            Err(err) => ctx.report_failure(function, Some(&player.truename), &err),
        }
    }

    /// Hands free text to the script's `onPlayerInput` on the player's level.
    pub fn input(&self, player: &PlayerInfo, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            self.tell(player, "&cYou need to specify some input.");
            return;
        }
        let Some(ctx) = self.registry.get_context(&player.level) else {
            self.tell(player, "&cThis map doesn't have a lua script!");
            return;
        };
        if !ctx.has_function(EntryPoint::PlayerInput.function_name()) {
            self.tell(player, "&cThe script of this map does not accept input.");
            return;
        }
        ctx.dispatch(EntryPoint::PlayerInput, Some(player), vec![player.into(), text.into()]);
    }

    pub fn staff_lua(&self, player: &PlayerInfo, message: &str) {
        let args: Vec<&str> = message.split_whitespace().collect();
        let sub = args.first().map(|s| s.to_ascii_lowercase());
        match sub.as_deref() {
            Some("add") => self.staff_add(player, args.get(1).copied()),
            Some("list") => {
                let maps = self.staff.list();
                if maps.is_empty() {
                    self.tell(player, "No maps use staff lua scripts.");
                } else {
                    self.tell(player, &format!("Staff lua maps: %b{}", maps.join("%S, %b")));
                }
            }
            _ => self.help(player, &STAFF_HELP),
        }
    }

    fn staff_add(&self, player: &PlayerInfo, map: Option<&str>) {
        if player.rank < self.staff_rank {
            self.tell(player, "&cOnly staff can grant staff lua features to a map.");
            return;
        }
        let Some(map) = map else {
            self.tell(player, "&cYou need to specify a map name.");
            return;
        };
        if !self.host.level_exists(map) {
            self.tell(player, &format!("&cMap %b{map}&c does not exist."));
            return;
        }
        match self.staff.add(map) {
            Ok(true) => {
                info!("[Lua store] {} added '{map}' to the staff maps", player.name);
                self.tell(
                    player,
                    &format!("Map %b{map}%S can now use staff lua features. Reload its script to apply."),
                );
            }
            Ok(false) => self.tell(player, &format!("&cMap %b{map}&c is already a staff map.")),
            Err(e) => {
                warn!("[Lua store] Could not save staff map '{map}': {e}");
                self.tell(player, "&cCould not save the staff map list.");
            }
        }
    }
}

/// Short reason for a failed download, without internal detail.
fn download_failure(err: &StoreError) -> String {
    match err {
        StoreError::HttpStatus(code) => format!("HTTP {code}"),
        StoreError::Network(_) => "could not reach the server".to_string(),
        StoreError::InvalidUrl(_) => "invalid URL".to_string(),
        StoreError::TooLarge { .. } => "file too large".to_string(),
        StoreError::AlreadyInProgress => "download already in progress".to_string(),
        StoreError::Io(_) => "could not write the script file".to_string(),
    }
}
