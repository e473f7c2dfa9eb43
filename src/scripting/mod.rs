pub mod api;
pub mod context;
pub mod dispatcher;
pub mod registry;

use mlua::StdLib;

pub use api::ScriptArg;
pub use context::{CallFrames, ContextDeps, ExecutionLimits, ScriptContext};
pub use dispatcher::{
    register_builtin_operations, FailureReporter, HostDispatcher, HostValue, InvokeScope,
    OperationCall, PlayerHandle, UsernameMap, LOGGED_NOTICE,
};
pub use registry::ContextRegistry;

/// Which standard libraries a map's Lua state gets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptProfile {
    Standard,
    /// Maps on the staff allow-list.
    Staff,
}

impl ScriptProfile {
    /// `jit` is never opened, which keeps LuaJIT interpreting so the
    /// instruction-count hook fires inside loops.
    pub fn libraries(self) -> StdLib {
        let base = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::BIT;
        match self {
            ScriptProfile::Standard => base,
            ScriptProfile::Staff => base | StdLib::OS,
        }
    }
}
