//! Interface to the game server that embeds the scripting core.
//!
//! Everything the core needs from players, levels and chat goes through
//! [`Host`]. The server implements it once and hands an `Arc<dyn Host>` to
//! [`crate::LuaRuntime::start`].

use serde::{Deserialize, Serialize};

/// Permission level of a player. Higher values outrank lower ones.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Rank(pub i32);

impl Rank {
    pub const BANNED: Rank = Rank(-20);
    pub const GUEST: Rank = Rank(0);
    pub const BUILDER: Rank = Rank(30);
    pub const ADV_BUILDER: Rank = Rank(50);
    pub const OPERATOR: Rank = Rank(80);
    pub const ADMIN: Rank = Rank(100);
    pub const OWNER: Rank = Rank(120);
}

impl Default for Rank {
    fn default() -> Self {
        Rank::GUEST
    }
}

/// Snapshot of an online player as the host sees it.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PlayerInfo {
    /// Display/account name used for lookups and messaging.
    pub name: String,
    /// Stable identity used for attribution.
    pub truename: String,
    pub rank: Rank,
    /// Level the player is currently on.
    pub level: String,
}

/// How a command reached the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CommandOrigin {
    #[default]
    Chat,
    /// Triggered by a message block at the given block coordinates.
    MessageBlock { x: i32, y: i32, z: i32 },
}

pub trait Host: Send + Sync {
    /// Exact-name lookup of an online player.
    fn find_player(&self, name: &str) -> Option<PlayerInfo>;

    /// Send a chat line to one player. Unknown names are ignored.
    fn message(&self, player: &str, message: &str);

    fn level_players(&self, level: &str) -> Vec<PlayerInfo>;

    fn level_exists(&self, level: &str) -> bool;

    fn is_realm_owner(&self, level: &str, player: &str) -> bool;

    /// Returns false when the level is not loaded or the coordinates are outside it.
    fn set_block(&self, level: &str, x: i32, y: i32, z: i32, block: u16) -> bool;

    fn get_block(&self, level: &str, x: i32, y: i32, z: i32) -> Option<u16>;

    /// Shows `block` to one player only; the level itself is unchanged.
    /// Returns false when the player is offline or the coordinates are
    /// outside their level.
    fn send_temp_block(&self, player: &str, x: i32, y: i32, z: i32, block: u16) -> bool;
}

/// Case-normalized map identifier.
pub fn map_id(level_name: &str) -> String {
    level_name.trim().to_lowercase()
}
