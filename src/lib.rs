//! Per-level Lua scripting for a multiplayer block-game server.
//!
//! The host links this crate, implements [`Host`], forwards level and player
//! events to [`EventBridge`] and the `/lua` family of commands to
//! [`CommandSurface`]. [`LuaRuntime`] wires everything together.

pub mod bridge;
pub mod commands;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod file_watcher;
pub mod host;
pub mod runtime;
pub mod scripting;
pub mod store;

#[cfg(test)]
mod testing;

pub use bridge::EventBridge;
pub use commands::{CommandOutcome, CommandSurface};
pub use config::PluginConfig;
pub use error::{CallError, DispatchError, OperationError, RegistryError, StoreError};
pub use events::{ChatOutcome, EntryPoint};
pub use host::{map_id, CommandOrigin, Host, PlayerInfo, Rank};
pub use runtime::LuaRuntime;
pub use scripting::{ContextRegistry, HostDispatcher, HostValue, ScriptContext, ScriptProfile};
