use serde::Serialize;

/// Script functions the host's event feed is delivered to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    LevelLoad,
    LevelUnload,
    PlayerJoin,
    PlayerJoining,
    PlayerConnect,
    PlayerDisconnect,
    PlayerMove,
    PlayerClick,
    PlayerChat,
    BlockChange,
    PlayerCommand,
    PlayerInput,
}

impl EntryPoint {
    pub const ALL: [EntryPoint; 12] = [
        EntryPoint::LevelLoad,
        EntryPoint::LevelUnload,
        EntryPoint::PlayerJoin,
        EntryPoint::PlayerJoining,
        EntryPoint::PlayerConnect,
        EntryPoint::PlayerDisconnect,
        EntryPoint::PlayerMove,
        EntryPoint::PlayerClick,
        EntryPoint::PlayerChat,
        EntryPoint::BlockChange,
        EntryPoint::PlayerCommand,
        EntryPoint::PlayerInput,
    ];

    pub fn function_name(self) -> &'static str {
        match self {
            EntryPoint::LevelLoad => "onLevelLoad",
            EntryPoint::LevelUnload => "onLevelUnload",
            EntryPoint::PlayerJoin => "onPlayerJoin",
            EntryPoint::PlayerJoining => "onPlayerJoining",
            EntryPoint::PlayerConnect => "onPlayerConnect",
            EntryPoint::PlayerDisconnect => "onPlayerDisconnect",
            EntryPoint::PlayerMove => "onPlayerMove",
            EntryPoint::PlayerClick => "onPlayerClick",
            EntryPoint::PlayerChat => "onPlayerChat",
            EntryPoint::BlockChange => "onBlockChange",
            EntryPoint::PlayerCommand => "onPlayerCommand",
            EntryPoint::PlayerInput => "onPlayerInput",
        }
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct MoveEvent {
    pub from: Position,
    pub to: Position,
    pub yaw: u8,
    pub pitch: u8,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MouseAction {
    Pressed,
    Released,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct ClickEvent {
    pub button: MouseButton,
    pub action: MouseAction,
    pub yaw: u16,
    pub pitch: u16,
    /// Clicked block, when the player was pointing at one.
    pub target: Option<Position>,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct BlockChangeEvent {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub block: u16,
    /// True when placing, false when deleting.
    pub placing: bool,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CommandEvent {
    pub command: String,
    pub args: String,
}

/// What a script decided about a chat message.
#[derive(Clone, Debug, PartialEq)]
pub enum ChatOutcome {
    Unchanged,
    Suppressed,
    Replaced(String),
}
