//! Host game events to script entry points.
//!
//! Every delivery is best effort: a map without a context, a script without
//! the entry point, or a script that fails all fall back to the host's default
//! behavior.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::events::{BlockChangeEvent, ChatOutcome, ClickEvent, CommandEvent, EntryPoint, MoveEvent};
use crate::host::PlayerInfo;
use crate::scripting::api::ScriptArg;
use crate::scripting::context::ScriptContext;
use crate::scripting::dispatcher::{HostValue, UsernameMap};
use crate::scripting::registry::ContextRegistry;

pub struct EventBridge {
    registry: Arc<ContextRegistry>,
    usernames: Arc<UsernameMap>,
}

impl EventBridge {
    pub fn new(registry: Arc<ContextRegistry>, usernames: Arc<UsernameMap>) -> Self {
        Self {
            registry,
            usernames,
        }
    }

    fn deliver(
        &self,
        level: &str,
        entry: EntryPoint,
        player: Option<&PlayerInfo>,
        args: Vec<ScriptArg>,
    ) -> Option<HostValue> {
        let ctx = self.registry.get_context(level)?;
        ctx.dispatch(entry, player, args)
    }

    /// Builds the level's context when it has none yet, then runs `onLevelLoad`.
    pub fn level_loaded(&self, level: &str) {
        let ctx = match self.registry.ensure_context(level) {
            Ok((ctx, _)) => ctx,
            Err(RegistryError::NoScriptFile) => return,
            Err(e) => {
                warn!("[Lua scripts] Level '{level}' loaded without its script: {e}");
                return;
            }
        };
        ctx.dispatch(EntryPoint::LevelLoad, None, vec![]);
    }

    /// Runs `onLevelUnload`, then releases the context. The script file stays.
    pub fn level_unload(&self, level: &str) {
        let Some(ctx) = self.registry.get_context(level) else {
            return;
        };
        ctx.dispatch(EntryPoint::LevelUnload, None, vec![]);
        self.registry.remove_context(level);
    }

    pub fn player_joined_level(&self, player: &PlayerInfo, level: &str) {
        self.deliver(level, EntryPoint::PlayerJoin, Some(player), vec![player.into()]);
    }

    /// Returns false when the script vetoes the join.
    pub fn player_joining_level(&self, player: &PlayerInfo, level: &str) -> bool {
        let outcome = self.deliver(level, EntryPoint::PlayerJoining, Some(player), vec![player.into()]);
        outcome != Some(HostValue::Bool(false))
    }

    pub fn player_connected(&self, player: &PlayerInfo) {
        self.usernames.record(player);
        self.deliver(&player.level, EntryPoint::PlayerConnect, Some(player), vec![player.into()]);
    }

    pub fn player_disconnected(&self, player: &PlayerInfo, reason: &str) {
        self.deliver(
            &player.level,
            EntryPoint::PlayerDisconnect,
            Some(player),
            vec![player.into(), reason.into()],
        );
    }

    pub fn player_moved(&self, player: &PlayerInfo, movement: &MoveEvent) {
        self.deliver(
            &player.level,
            EntryPoint::PlayerMove,
            Some(player),
            vec![player.into(), payload(movement)],
        );
    }

    pub fn player_clicked(&self, player: &PlayerInfo, click: &ClickEvent) {
        self.deliver(
            &player.level,
            EntryPoint::PlayerClick,
            Some(player),
            vec![player.into(), payload(click)],
        );
    }

    /// `false` suppresses the message; a string replaces it.
    pub fn chat(&self, player: &PlayerInfo, message: &str) -> ChatOutcome {
        match self.deliver(
            &player.level,
            EntryPoint::PlayerChat,
            Some(player),
            vec![player.into(), message.into()],
        ) {
            Some(HostValue::Bool(false)) => ChatOutcome::Suppressed,
            Some(HostValue::Text(text)) if text != message => ChatOutcome::Replaced(text),
            _ => ChatOutcome::Unchanged,
        }
    }

    /// Returns false when the script cancels the change.
    pub fn block_changing(&self, player: &PlayerInfo, change: &BlockChangeEvent) -> bool {
        let outcome = self.deliver(
            &player.level,
            EntryPoint::BlockChange,
            Some(player),
            vec![player.into(), payload(change)],
        );
        outcome != Some(HostValue::Bool(false))
    }

    /// Returns true when the script intercepted the command.
    pub fn command(&self, player: &PlayerInfo, command: &CommandEvent) -> bool {
        let outcome = self.deliver(
            &player.level,
            EntryPoint::PlayerCommand,
            Some(player),
            vec![player.into(), payload(command)],
        );
        outcome == Some(HostValue::Bool(true))
    }

    /// Context for `level`, for callers that drive entry points directly.
    pub fn context(&self, level: &str) -> Option<Arc<ScriptContext>> {
        self.registry.get_context(level)
    }
}

fn payload<T: Serialize>(event: &T) -> ScriptArg {
    match serde_json::to_value(event) {
        Ok(json) => ScriptArg::Payload(json),
        Err(e) => {
            debug!("[Lua scripts] Could not serialize event payload: {e}");
            ScriptArg::Value(HostValue::Nil)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MouseAction, MouseButton, Position};
    use crate::host::Rank;
    use crate::testing::Harness;

    const COUNTING_SCRIPT: &str = r#"
        loads = 0
        function onLevelLoad() loads = loads + 1 end
        function loadCount() return loads end
    "#;

    fn bridge(h: &Harness) -> EventBridge {
        EventBridge::new(h.registry.clone(), h.deps.usernames.clone())
    }

    #[test]
    fn level_load_invokes_on_level_load_exactly_once() {
        let h = Harness::new(&["arena"]);
        h.write_live("arena", COUNTING_SCRIPT);
        h.registry.create_context("arena").expect("create");
        let bridge = bridge(&h);

        bridge.level_loaded("arena");

        let ctx = h.registry.get_context("arena").expect("context");
        assert_eq!(ctx.call("loadCount", vec![]).expect("count"), HostValue::Int(1));
    }

    #[test]
    fn level_load_builds_a_missing_context() {
        let h = Harness::new(&["arena", "town"]);
        h.write_live("arena", COUNTING_SCRIPT);
        let bridge = bridge(&h);

        bridge.level_loaded("arena");
        bridge.level_loaded("town");

        assert!(!h.registry.has_context("town"));
        let ctx = h.registry.get_context("arena").expect("context");
        assert_eq!(ctx.call("loadCount", vec![]).expect("count"), HostValue::Int(1));
    }

    #[test]
    fn concurrent_level_loads_share_one_context() {
        let h = Harness::new(&["arena"]);
        h.write_live("arena", COUNTING_SCRIPT);
        let bridge = Arc::new(bridge(&h));

        let loaders: Vec<_> = (0..6)
            .map(|_| {
                let bridge = bridge.clone();
                std::thread::spawn(move || bridge.level_loaded("arena"))
            })
            .collect();
        for loader in loaders {
            loader.join().expect("loader");
        }

        let ctx = h.registry.get_context("arena").expect("context");
        assert_eq!(ctx.call("loadCount", vec![]).expect("count"), HostValue::Int(6));
    }

    #[test]
    fn level_unload_notifies_script_and_keeps_the_file() {
        let h = Harness::new(&["arena"]);
        h.host.add_player("bob", Rank::GUEST, "arena");
        h.write_live(
            "arena",
            r#"function onLevelUnload() host.call("Level", "Message", "bye") end"#,
        );
        let bridge = bridge(&h);
        bridge.level_loaded("arena");

        bridge.level_unload("arena");

        assert_eq!(h.host.messages_for("bob"), vec!["bye".to_string()]);
        assert!(!h.registry.has_context("arena"));
        assert!(h.store.has_live("arena"));
    }

    #[test]
    fn events_without_a_context_use_host_defaults() {
        let h = Harness::new(&["arena"]);
        let bob = h.host.add_player("bob", Rank::GUEST, "arena");
        let bridge = bridge(&h);

        assert!(bridge.player_joining_level(&bob, "arena"));
        assert_eq!(bridge.chat(&bob, "hi"), ChatOutcome::Unchanged);
        let change = BlockChangeEvent {
            x: 1,
            y: 2,
            z: 3,
            block: 1,
            placing: true,
        };
        assert!(bridge.block_changing(&bob, &change));
        let cmd = CommandEvent {
            command: "spawn".to_string(),
            args: String::new(),
        };
        assert!(!bridge.command(&bob, &cmd));
        assert!(h.host.all_messages().is_empty());
    }

    #[test]
    fn scripts_can_veto_and_rewrite_events() {
        let h = Harness::new(&["arena"]);
        let bob = h.host.add_player("bob", Rank::GUEST, "arena");
        h.write_live(
            "arena",
            r#"
            function onPlayerJoining(p) return p.name ~= "bob" end
            function onBlockChange(p, e) return not (e.placing and e.block == 7) end
            function onPlayerChat(p, msg)
                if msg == "hush" then return false end
                if msg == "loud" then return "LOUD" end
            end
            function onPlayerCommand(p, e) return e.command == "spawn" end
            "#,
        );
        let bridge = bridge(&h);
        bridge.level_loaded("arena");

        assert!(!bridge.player_joining_level(&bob, "arena"));
        let lava = BlockChangeEvent {
            x: 1,
            y: 2,
            z: 3,
            block: 7,
            placing: true,
        };
        assert!(!bridge.block_changing(&bob, &lava));
        assert!(bridge.block_changing(&bob, &BlockChangeEvent { block: 1, ..lava }));
        assert_eq!(bridge.chat(&bob, "hush"), ChatOutcome::Suppressed);
        assert_eq!(bridge.chat(&bob, "loud"), ChatOutcome::Replaced("LOUD".to_string()));
        assert_eq!(bridge.chat(&bob, "hello"), ChatOutcome::Unchanged);
        let spawn = CommandEvent {
            command: "spawn".to_string(),
            args: String::new(),
        };
        assert!(bridge.command(&bob, &spawn));
    }

    #[test]
    fn event_payloads_reach_the_script_as_tables() {
        let h = Harness::new(&["arena"]);
        let bob = h.host.add_player("bob", Rank::GUEST, "arena");
        h.write_live(
            "arena",
            r#"
            seen = {}
            function onPlayerMove(p, m) seen.move = m.to.x .. "," .. m.to.y .. "," .. m.to.z end
            function onPlayerClick(p, c) seen.click = c.button .. ":" .. tostring(c.target == nil) end
            function onPlayerDisconnect(p, reason) seen.left = p.name .. ":" .. reason end
            function report(key) return seen[key] end
            "#,
        );
        let bridge = bridge(&h);
        bridge.level_loaded("arena");

        let origin = Position { x: 0, y: 0, z: 0 };
        bridge.player_moved(
            &bob,
            &MoveEvent {
                from: origin,
                to: Position { x: 4, y: 5, z: 6 },
                yaw: 0,
                pitch: 0,
            },
        );
        bridge.player_clicked(
            &bob,
            &ClickEvent {
                button: MouseButton::Left,
                action: MouseAction::Pressed,
                yaw: 0,
                pitch: 0,
                target: None,
            },
        );
        bridge.player_disconnected(&bob, "quit");

        let ctx = bridge.context("arena").expect("context");
        let report = |key: &str| ctx.call("report", vec![key.into()]).expect("report");
        assert_eq!(report("move"), HostValue::Text("4,5,6".to_string()));
        assert_eq!(report("click"), HostValue::Text("left:true".to_string()));
        assert_eq!(report("left"), HostValue::Text("bob:quit".to_string()));
    }

    #[test]
    fn failing_handler_falls_back_and_notifies_the_player() {
        let h = Harness::new(&["arena"]);
        let bob = h.host.add_player("bob", Rank::GUEST, "arena");
        h.write_live("arena", "function onPlayerChat(p, msg) error('oops') end");
        let bridge = bridge(&h);
        bridge.level_loaded("arena");

        assert_eq!(bridge.chat(&bob, "hi"), ChatOutcome::Unchanged);
        assert_eq!(
            h.host.messages_for("bob"),
            vec!["&cError: the map script failed in onPlayerChat.".to_string()]
        );
    }

    #[test]
    fn connect_records_the_username_mapping() {
        let h = Harness::new(&["arena"]);
        let mut bob = h.host.add_player("Bob+", Rank::GUEST, "arena");
        bob.truename = "bob".to_string();
        let bridge = bridge(&h);

        bridge.player_connected(&bob);

        assert_eq!(h.deps.usernames.resolve("bob"), Some("Bob+".to_string()));
    }
}
