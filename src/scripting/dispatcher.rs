//! Name-based call-through from scripts to host operations.
//!
//! Operations are registered at startup under a `(target, method)` pair. Every
//! failure is caught here: the script gets `nil` back and, when the call can be
//! attributed to a player, that player gets a short notice.

use std::collections::HashMap;
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tracing::{debug, error, info};

use crate::error::{DispatchError, OperationError};
use crate::host::{Host, PlayerInfo, Rank};

pub const LOGGED_NOTICE: &str = "&cThe error has been logged in the console.";

/// Largest box `Player.TempChunk` sends in one call.
const MAX_TEMP_CHUNK_BLOCKS: u64 = 4096;

/// A player as scripts see it. Passed to Lua as userdata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerHandle {
    pub name: String,
    pub truename: String,
    pub rank: Rank,
}

impl From<&PlayerInfo> for PlayerHandle {
    fn from(p: &PlayerInfo) -> Self {
        Self {
            name: p.name.clone(),
            truename: p.truename.clone(),
            rank: p.rank,
        }
    }
}

/// Host-side value crossing the dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub enum HostValue {
    Nil,
    Bool(bool),
    Int(i64),
    Number(f64),
    Text(String),
    Player(PlayerHandle),
    /// A script value with no host representation; carries the Lua type name.
    Unsupported(&'static str),
}

/// Arguments and scope of one dispatched call.
pub struct OperationCall<'a> {
    pub map: &'a str,
    pub args: &'a [HostValue],
}

impl<'a> OperationCall<'a> {
    fn arg(&self, index: usize) -> Result<&'a HostValue, OperationError> {
        self.args
            .get(index)
            .ok_or_else(|| OperationError::InvalidArguments(format!("missing argument #{}", index + 1)))
    }

    pub fn text(&self, index: usize) -> Result<String, OperationError> {
        match self.arg(index)? {
            HostValue::Text(s) => Ok(s.clone()),
            HostValue::Int(i) => Ok(i.to_string()),
            HostValue::Number(n) => Ok(n.to_string()),
            other => Err(mismatch(index, "string", other)),
        }
    }

    pub fn int(&self, index: usize) -> Result<i64, OperationError> {
        match self.arg(index)? {
            HostValue::Int(i) => Ok(*i),
            HostValue::Number(n) if n.fract() == 0.0 => Ok(*n as i64),
            HostValue::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| mismatch(index, "integer", &HostValue::Text(s.clone()))),
            other => Err(mismatch(index, "integer", other)),
        }
    }

    pub fn player(&self, index: usize) -> Result<&'a PlayerHandle, OperationError> {
        match self.arg(index)? {
            HostValue::Player(p) => Ok(p),
            other => Err(mismatch(index, "player", other)),
        }
    }
}

fn mismatch(index: usize, expected: &str, got: &HostValue) -> OperationError {
    let got = match got {
        HostValue::Nil => "nil",
        HostValue::Bool(_) => "boolean",
        HostValue::Int(_) | HostValue::Number(_) => "number",
        HostValue::Text(_) => "string",
        HostValue::Player(_) => "player",
        HostValue::Unsupported(name) => name,
    };
    OperationError::InvalidArguments(format!(
        "argument #{} should be a {expected}, got {got}",
        index + 1
    ))
}

pub type Operation =
    Arc<dyn Fn(&OperationCall<'_>) -> Result<HostValue, OperationError> + Send + Sync>;

struct Registered {
    op: Operation,
    staff_only: bool,
}

/// Who and where a dispatched call runs for.
pub struct InvokeScope<'a> {
    pub map: &'a str,
    pub staff: bool,
    /// Identity of the player the surrounding entry-point call was made for.
    pub acting: Option<String>,
}

/// Identity (`truename`) to canonical player name.
///
/// Filled when calls are attributed to players; never expired here.
#[derive(Default)]
pub struct UsernameMap {
    names: RwLock<HashMap<String, String>>,
}

impl UsernameMap {
    pub fn record(&self, player: &PlayerInfo) {
        let mut names = self.names.write().unwrap_or_else(|e| e.into_inner());
        if names.get(&player.truename) != Some(&player.name) {
            names.insert(player.truename.clone(), player.name.clone());
        }
    }

    pub fn resolve(&self, identity: &str) -> Option<String> {
        self.names
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(identity)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.names.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Delivers sanitized failure notices to the attributed player.
pub struct FailureReporter {
    host: Arc<dyn Host>,
    usernames: Arc<UsernameMap>,
    detail_rank: Rank,
}

impl FailureReporter {
    pub fn new(host: Arc<dyn Host>, usernames: Arc<UsernameMap>, detail_rank: Rank) -> Self {
        Self {
            host,
            usernames,
            detail_rank,
        }
    }

    /// Sends `notice` to the player behind `identity`. Players above the
    /// detail rank also get the full error in the server log. Returns false
    /// when nobody could be notified.
    pub fn report(&self, identity: Option<&str>, notice: &str, error: &dyn Display) -> bool {
        let Some(identity) = identity else {
            debug!("[Lua dispatch] Unattributed failure: {error}");
            return false;
        };
        let name = self
            .usernames
            .resolve(identity)
            .unwrap_or_else(|| identity.to_string());
        let Some(player) = self.host.find_player(&name) else {
            debug!("[Lua dispatch] Failure for offline player {name}: {error}");
            return false;
        };

        self.host.message(&player.name, notice);
        if player.rank > self.detail_rank {
            error!("[Lua dispatch] {} ({}): {error}", notice, player.name);
            self.host.message(&player.name, LOGGED_NOTICE);
        } else {
            debug!("[Lua dispatch] {} ({}): {error}", notice, player.name);
        }
        true
    }
}

pub struct HostDispatcher {
    operations: RwLock<HashMap<(String, String), Registered>>,
    reporter: Arc<FailureReporter>,
}

impl HostDispatcher {
    pub fn new(reporter: Arc<FailureReporter>) -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            reporter,
        }
    }

    pub fn reporter(&self) -> &Arc<FailureReporter> {
        &self.reporter
    }

    pub fn register<F>(&self, target: &str, method: &str, op: F)
    where
        F: Fn(&OperationCall<'_>) -> Result<HostValue, OperationError> + Send + Sync + 'static,
    {
        self.insert(target, method, Arc::new(op), false);
    }

    /// Registers an operation only maps on the staff allow-list may call.
    pub fn register_staff<F>(&self, target: &str, method: &str, op: F)
    where
        F: Fn(&OperationCall<'_>) -> Result<HostValue, OperationError> + Send + Sync + 'static,
    {
        self.insert(target, method, Arc::new(op), true);
    }

    fn insert(&self, target: &str, method: &str, op: Operation, staff_only: bool) {
        self.operations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((target.to_string(), method.to_string()), Registered { op, staff_only });
    }

    pub fn operation_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .operations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .map(|(t, m)| format!("{t}.{m}"))
            .collect();
        names.sort();
        names
    }

    /// Resolves and runs an operation, returning `Nil` on any failure.
    pub fn invoke(
        &self,
        scope: &InvokeScope<'_>,
        target: &str,
        method: &str,
        args: Vec<HostValue>,
    ) -> HostValue {
        let identity = match args.first() {
            Some(HostValue::Player(p)) => Some(p.truename.clone()),
            _ => scope.acting.clone(),
        };

        match self.try_invoke(scope, target, method, &args) {
            Ok(value) => value,
            Err(err) => {
                let notice = usage_notice(method, err.public_detail());
                self.reporter.report(identity.as_deref(), &notice, &err);
                HostValue::Nil
            }
        }
    }

    pub fn try_invoke(
        &self,
        scope: &InvokeScope<'_>,
        target: &str,
        method: &str,
        args: &[HostValue],
    ) -> Result<HostValue, DispatchError> {
        let op = {
            let operations = self.operations.read().unwrap_or_else(|e| e.into_inner());
            match operations.get(&(target.to_string(), method.to_string())) {
                Some(reg) if !reg.staff_only || scope.staff => reg.op.clone(),
                _ => {
                    return Err(DispatchError::UnknownOperation {
                        target: target.to_string(),
                        method: method.to_string(),
                    })
                }
            }
        };

        let call = OperationCall {
            map: scope.map,
            args,
        };
        match catch_unwind(AssertUnwindSafe(|| op(&call))) {
            Ok(result) => result.map_err(DispatchError::from),
            Err(_) => Err(DispatchError::Panicked),
        }
    }
}

fn usage_notice(method: &str, detail: Option<&str>) -> String {
    let mut chars = method.chars();
    let method = match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    };
    match detail {
        Some(detail) => format!("&cError: Invalid usage of {method} ({detail})"),
        None => format!("&cError: Invalid usage of {method}"),
    }
}

/// Registers the operations every map can use, plus the staff-only ones.
pub fn register_builtin_operations(dispatcher: &HostDispatcher, host: Arc<dyn Host>) {
    let h = host.clone();
    dispatcher.register("Player", "Message", move |call| {
        let player = call.player(0)?;
        let text = call.text(1)?;
        if h.find_player(&player.name).is_none() {
            return Err(OperationError::Rule(format!("{} is offline", player.name)));
        }
        h.message(&player.name, &text);
        Ok(HostValue::Nil)
    });

    let h = host.clone();
    dispatcher.register("Level", "Message", move |call| {
        let text = call.text(0)?;
        for player in h.level_players(call.map) {
            h.message(&player.name, &text);
        }
        Ok(HostValue::Nil)
    });

    let h = host.clone();
    dispatcher.register("Level", "SetBlock", move |call| {
        let (x, y, z) = (coord(call, 0)?, coord(call, 1)?, coord(call, 2)?);
        let block = block_id(call, 3)?;
        if !h.set_block(call.map, x, y, z, block) {
            return Err(OperationError::Rule("coordinates are outside the level".to_string()));
        }
        Ok(HostValue::Nil)
    });

    let h = host.clone();
    dispatcher.register("Level", "GetBlock", move |call| {
        let (x, y, z) = (coord(call, 0)?, coord(call, 1)?, coord(call, 2)?);
        h.get_block(call.map, x, y, z)
            .map(|b| HostValue::Int(b as i64))
            .ok_or_else(|| OperationError::Rule("coordinates are outside the level".to_string()))
    });

    let h = host.clone();
    dispatcher.register("Level", "Players", move |call| {
        Ok(HostValue::Int(h.level_players(call.map).len() as i64))
    });

    let h = host.clone();
    dispatcher.register("Player", "TempBlock", move |call| {
        let player = call.player(0)?;
        let (x, y, z) = (coord(call, 1)?, coord(call, 2)?, coord(call, 3)?);
        let block = block_id(call, 4)?;
        if h.find_player(&player.name).is_none() {
            return Err(OperationError::Rule(format!("{} is offline", player.name)));
        }
        if !h.send_temp_block(&player.name, x, y, z, block) {
            return Err(OperationError::Rule("coordinates are outside the level".to_string()));
        }
        Ok(HostValue::Nil)
    });

    let h = host;
    dispatcher.register("Player", "TempChunk", move |call| {
        let player = call.player(0)?;
        let from = (coord(call, 1)?, coord(call, 2)?, coord(call, 3)?);
        let to = (coord(call, 4)?, coord(call, 5)?, coord(call, 6)?);
        let block = block_id(call, 7)?;
        let span = |a: i32, b: i32| (i64::from(a) - i64::from(b)).unsigned_abs() + 1;
        let volume = span(from.0, to.0)
            .saturating_mul(span(from.1, to.1))
            .saturating_mul(span(from.2, to.2));
        if volume > MAX_TEMP_CHUNK_BLOCKS {
            return Err(OperationError::Rule(format!(
                "at most {MAX_TEMP_CHUNK_BLOCKS} blocks can be sent at once"
            )));
        }
        if h.find_player(&player.name).is_none() {
            return Err(OperationError::Rule(format!("{} is offline", player.name)));
        }
        let mut sent = 0i64;
        for x in from.0.min(to.0)..=from.0.max(to.0) {
            for y in from.1.min(to.1)..=from.1.max(to.1) {
                for z in from.2.min(to.2)..=from.2.max(to.2) {
                    if h.send_temp_block(&player.name, x, y, z, block) {
                        sent += 1;
                    }
                }
            }
        }
        Ok(HostValue::Int(sent))
    });

    dispatcher.register_staff("Server", "Log", |call| {
        info!("[Lua {}] {}", call.map, call.text(0)?);
        Ok(HostValue::Nil)
    });
}

fn block_id(call: &OperationCall<'_>, index: usize) -> Result<u16, OperationError> {
    u16::try_from(call.int(index)?)
        .map_err(|_| OperationError::InvalidArguments("block id out of range".to_string()))
}

fn coord(call: &OperationCall<'_>, index: usize) -> Result<i32, OperationError> {
    i32::try_from(call.int(index)?)
        .map_err(|_| OperationError::InvalidArguments(format!("argument #{} out of range", index + 1)))
}
