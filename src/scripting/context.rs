use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use mlua::{Function, HookTriggers, Lua, LuaOptions, MultiValue, Value, VmState};
use tracing::{debug, warn};

use crate::error::{CallError, RegistryError};
use crate::events::EntryPoint;
use crate::host::PlayerInfo;
use crate::scripting::api::{install_host_api, lua_to_host_value, script_arg_to_lua, HostBinding, ScriptArg};
use crate::scripting::dispatcher::{FailureReporter, HostDispatcher, HostValue, UsernameMap};
use crate::scripting::ScriptProfile;

/// Per-thread stack of in-progress entry-point calls and who they were made for.
///
/// Calls that re-enter the same context (script → host → script) push onto
/// the calling thread's stack; the innermost attributed player wins.
#[derive(Default)]
pub struct CallFrames {
    threads: Mutex<HashMap<ThreadId, Vec<Option<String>>>>,
}

pub(crate) struct FrameGuard<'a> {
    frames: &'a CallFrames,
}

impl CallFrames {
    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, Vec<Option<String>>>> {
        self.threads.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn enter(&self, acting: Option<String>) -> FrameGuard<'_> {
        self.lock()
            .entry(std::thread::current().id())
            .or_default()
            .push(acting);
        FrameGuard { frames: self }
    }

    pub fn depth(&self) -> usize {
        self.lock()
            .get(&std::thread::current().id())
            .map_or(0, Vec::len)
    }

    /// Innermost attributed identity on the current thread.
    pub fn acting(&self) -> Option<String> {
        self.lock()
            .get(&std::thread::current().id())
            .and_then(|stack| stack.iter().rev().find_map(Clone::clone))
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let mut threads = self.frames.lock();
        let id = std::thread::current().id();
        if let Some(stack) = threads.get_mut(&id) {
            stack.pop();
            if stack.is_empty() {
                threads.remove(&id);
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ExecutionLimits {
    /// `None` disables the wall-clock budget; stop requests are honoured regardless.
    pub budget: Option<Duration>,
    pub instruction_interval: u32,
}

/// Shared services every context is wired to.
#[derive(Clone)]
pub struct ContextDeps {
    pub dispatcher: Arc<HostDispatcher>,
    pub reporter: Arc<FailureReporter>,
    pub usernames: Arc<UsernameMap>,
    pub limits: ExecutionLimits,
}

/// One map's loaded script.
pub struct ScriptContext {
    map_id: String,
    profile: ScriptProfile,
    engine: RwLock<Option<Arc<Lua>>>,
    stopped: Arc<AtomicBool>,
    budget_tripped: Arc<AtomicBool>,
    frames: Arc<CallFrames>,
    exec: Mutex<()>,
    deps: ContextDeps,
}

impl ScriptContext {
    /// Creates a Lua state for `map_id`, installs the host API and runs the
    /// script's top-level chunk.
    pub fn load(
        map_id: &str,
        source: &str,
        profile: ScriptProfile,
        deps: ContextDeps,
    ) -> Result<Arc<Self>, RegistryError> {
        let lua = Lua::new_with(profile.libraries(), LuaOptions::default())
            .map_err(|e| RegistryError::ScriptLoad(e.to_string()))?;
        let frames = Arc::new(CallFrames::default());
        install_host_api(
            &lua,
            HostBinding {
                map: map_id.to_string(),
                staff: profile == ScriptProfile::Staff,
                dispatcher: deps.dispatcher.clone(),
                frames: frames.clone(),
            },
        )
        .map_err(|e| RegistryError::ScriptLoad(e.to_string()))?;

        let ctx = Self {
            map_id: map_id.to_string(),
            profile,
            engine: RwLock::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
            budget_tripped: Arc::new(AtomicBool::new(false)),
            frames,
            exec: Mutex::new(()),
            deps,
        };

        let chunk_name = format!("{map_id}.lua");
        ctx.with_budget(&lua, || lua.load(source).set_name(chunk_name).exec())
            .map_err(|e| match ctx.classify(e) {
                CallError::Timeout(d) => {
                    RegistryError::ScriptLoad(format!("top-level code exceeded its budget ({d:?})"))
                }
                other => RegistryError::ScriptLoad(other.to_string()),
            })?;

        *ctx.engine.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(lua));
        debug!("[Lua scripts] Loaded script for '{map_id}' ({profile:?})");
        Ok(Arc::new(ctx))
    }

    pub fn map_id(&self) -> &str {
        &self.map_id
    }

    pub fn profile(&self) -> ScriptProfile {
        self.profile
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Identity the innermost in-progress call on this thread was made for.
    pub fn acting_player(&self) -> Option<String> {
        self.frames.acting()
    }

    /// Whether the script defines a global function named `function`.
    pub fn has_function(&self, function: &str) -> bool {
        let Some(lua) = self.engine() else {
            return false;
        };
        matches!(lua.globals().get::<Value>(function), Ok(Value::Function(_)))
    }

    /// Invokes a global function. A missing function is `NotFound`.
    pub fn call(&self, function: &str, args: Vec<ScriptArg>) -> Result<HostValue, CallError> {
        self.invoke(function, None, args)
    }

    /// Like [`call`](Self::call), attributing the call to `player` until it returns.
    pub fn call_by_player(
        &self,
        function: &str,
        player: &PlayerInfo,
        args: Vec<ScriptArg>,
    ) -> Result<HostValue, CallError> {
        self.deps.usernames.record(player);
        self.invoke(function, Some(player.truename.clone()), args)
    }

    /// Best-effort delivery of a host event. Missing entry points and stopped
    /// contexts yield `None`; script failures are reported and yield `None`.
    pub fn dispatch(
        &self,
        entry: EntryPoint,
        player: Option<&PlayerInfo>,
        args: Vec<ScriptArg>,
    ) -> Option<HostValue> {
        let result = match player {
            Some(p) => self.call_by_player(entry.function_name(), p, args),
            None => self.call(entry.function_name(), args),
        };
        match result {
            Ok(value) => Some(value),
            Err(CallError::NotFound(_)) | Err(CallError::Stopped) => None,
            Err(err) => {
                let identity = player
                    .map(|p| p.truename.clone())
                    .or_else(|| self.frames.acting());
                self.report_failure(entry.function_name(), identity.as_deref(), &err);
                None
            }
        }
    }

    /// Routes a script failure through the dispatcher's reporting path.
    pub fn report_failure(&self, function: &str, identity: Option<&str>, err: &CallError) {
        warn!("[Lua scripts] {}: {function} failed: {err}", self.map_id);
        let notice = match err {
            CallError::Timeout(_) => format!("&cError: {function} took too long and was stopped."),
            _ => format!("&cError: the map script failed in {function}."),
        };
        self.deps.reporter.report(identity, &notice, err);
    }

    /// Releases the Lua state. Waits for an in-flight call on another thread,
    /// which the instruction hook aborts at its next check.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let engine = self
            .engine
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if self.frames.depth() == 0 {
            let _idle = self.exec.lock().unwrap_or_else(|e| e.into_inner());
        }
        drop(engine);
        debug!("[Lua scripts] Stopped script for '{}'", self.map_id);
    }

    fn engine(&self) -> Option<Arc<Lua>> {
        if self.is_stopped() {
            return None;
        }
        self.engine.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn invoke(
        &self,
        function: &str,
        acting: Option<String>,
        args: Vec<ScriptArg>,
    ) -> Result<HostValue, CallError> {
        let lua = self.engine().ok_or(CallError::Stopped)?;
        let outermost = self.frames.depth() == 0;
        let _exec = outermost.then(|| self.exec.lock().unwrap_or_else(|e| e.into_inner()));
        if self.is_stopped() {
            return Err(CallError::Stopped);
        }
        let _frame = self.frames.enter(acting);

        let func = match lua.globals().get::<Value>(function) {
            Ok(Value::Function(f)) => f,
            Ok(_) => return Err(CallError::NotFound(function.to_string())),
            Err(e) => return Err(CallError::Runtime(e.to_string())),
        };
        let args = args
            .into_iter()
            .map(|arg| script_arg_to_lua(&lua, arg))
            .collect::<mlua::Result<Vec<_>>>()
            .map_err(|e| CallError::Runtime(e.to_string()))?;

        let run = |f: &Function| f.call::<Value>(MultiValue::from_vec(args));
        let result = if outermost {
            self.with_budget(&lua, || run(&func))
        } else {
            run(&func)
        };
        match result {
            Ok(value) => Ok(lua_to_host_value(&value)),
            Err(e) => Err(self.classify(e)),
        }
    }

    fn classify(&self, err: mlua::Error) -> CallError {
        if self.is_stopped() {
            CallError::Stopped
        } else if self.budget_tripped.load(Ordering::SeqCst) {
            CallError::Timeout(self.deps.limits.budget.unwrap_or_default())
        } else {
            CallError::Runtime(err.to_string())
        }
    }

    fn with_budget<T, F>(&self, lua: &Lua, f: F) -> mlua::Result<T>
    where
        F: FnOnce() -> mlua::Result<T>,
    {
        let started = Instant::now();
        let limits = self.deps.limits;
        let stopped = self.stopped.clone();
        let tripped = self.budget_tripped.clone();
        tripped.store(false, Ordering::SeqCst);
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(limits.instruction_interval.max(1)),
            move |_lua, _debug| {
                if stopped.load(Ordering::SeqCst) {
                    return Err(mlua::Error::RuntimeError(
                        "script context was stopped".to_string(),
                    ));
                }
                if let Some(max) = limits.budget {
                    if started.elapsed() >= max {
                        tripped.store(true, Ordering::SeqCst);
                        return Err(mlua::Error::RuntimeError(format!(
                            "Script execution budget exceeded ({:.1}ms)",
                            max.as_secs_f64() * 1000.0
                        )));
                    }
                }
                Ok(VmState::Continue)
            },
        );
        let out = f();
        lua.remove_hook();
        out
    }
}

impl Drop for ScriptContext {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
