//! Lua-facing surface: the `host` table, the player userdata and value
//! conversion between Lua and the dispatcher.

use std::sync::Arc;

use mlua::{
    Lua, LuaSerdeExt, MetaMethod, MultiValue, SerializeOptions, UserData, UserDataFields,
    UserDataMethods, Value,
};
use tracing::info;

use crate::host::PlayerInfo;
use crate::scripting::context::CallFrames;
use crate::scripting::dispatcher::{HostDispatcher, HostValue, InvokeScope, PlayerHandle};

impl UserData for PlayerHandle {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("name", |_, this| Ok(this.name.clone()));
        fields.add_field_method_get("truename", |_, this| Ok(this.truename.clone()));
        fields.add_field_method_get("rank", |_, this| Ok(this.rank.0));
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.name.clone()));
    }
}

/// Argument handed to a script entry point.
#[derive(Clone, Debug)]
pub enum ScriptArg {
    Value(HostValue),
    /// Event payload, converted to a Lua table.
    Payload(serde_json::Value),
    /// First argument of `/lua call`: the caller and, from a message block, its coordinates.
    CallEvent {
        player: PlayerHandle,
        block: Option<(i32, i32, i32)>,
    },
}

impl From<HostValue> for ScriptArg {
    fn from(value: HostValue) -> Self {
        ScriptArg::Value(value)
    }
}

impl From<&PlayerInfo> for ScriptArg {
    fn from(player: &PlayerInfo) -> Self {
        ScriptArg::Value(HostValue::Player(PlayerHandle::from(player)))
    }
}

impl From<&str> for ScriptArg {
    fn from(text: &str) -> Self {
        ScriptArg::Value(HostValue::Text(text.to_string()))
    }
}

pub(crate) fn script_arg_to_lua(lua: &Lua, arg: ScriptArg) -> mlua::Result<Value> {
    match arg {
        ScriptArg::Value(value) => host_value_to_lua(lua, value),
        // Absent fields stay nil instead of becoming the `null` sentinel.
        ScriptArg::Payload(json) => lua.to_value_with(
            &json,
            SerializeOptions::new()
                .serialize_none_to_null(false)
                .serialize_unit_to_null(false),
        ),
        ScriptArg::CallEvent { player, block } => {
            let table = lua.create_table()?;
            table.set("player", lua.create_userdata(player)?)?;
            if let Some((x, y, z)) = block {
                table.set("x", x)?;
                table.set("y", y)?;
                table.set("z", z)?;
            }
            Ok(Value::Table(table))
        }
    }
}

pub(crate) fn host_value_to_lua(lua: &Lua, value: HostValue) -> mlua::Result<Value> {
    Ok(match value {
        HostValue::Nil | HostValue::Unsupported(_) => Value::Nil,
        HostValue::Bool(b) => Value::Boolean(b),
        HostValue::Int(i) => Value::Integer(i as mlua::Integer),
        HostValue::Number(n) => Value::Number(n),
        HostValue::Text(s) => Value::String(lua.create_string(&s)?),
        HostValue::Player(p) => Value::UserData(lua.create_userdata(p)?),
    })
}

pub(crate) fn lua_to_host_value(value: &Value) -> HostValue {
    match value {
        Value::Nil => HostValue::Nil,
        Value::Boolean(b) => HostValue::Bool(*b),
        Value::Integer(i) => HostValue::Int(*i as i64),
        // LuaJIT numbers are all doubles.
        Value::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => HostValue::Int(*n as i64),
        Value::Number(n) => HostValue::Number(*n),
        Value::String(s) => HostValue::Text(s.to_string_lossy().to_string()),
        Value::UserData(ud) => match ud.borrow::<PlayerHandle>() {
            Ok(p) => HostValue::Player((*p).clone()),
            Err(_) => HostValue::Unsupported("userdata"),
        },
        other => HostValue::Unsupported(other.type_name()),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy().to_string(),
        Value::UserData(ud) => match ud.borrow::<PlayerHandle>() {
            Ok(p) => p.name.clone(),
            Err(_) => "userdata".to_string(),
        },
        other => other.type_name().to_string(),
    }
}

pub(crate) struct HostBinding {
    pub map: String,
    pub staff: bool,
    pub dispatcher: Arc<HostDispatcher>,
    pub frames: Arc<CallFrames>,
}

/// Installs `host.call`, `host.map` and a `print` that writes to the server log.
pub(crate) fn install_host_api(lua: &Lua, binding: HostBinding) -> mlua::Result<()> {
    let HostBinding {
        map,
        staff,
        dispatcher,
        frames,
    } = binding;
    let globals = lua.globals();
    let host_tbl = lua.create_table()?;
    host_tbl.set("map", map.as_str())?;

    let call_map = map.clone();
    let call_fn = lua.create_function(move |lua, args: MultiValue| {
        let mut args = args.into_iter();
        let mut name = || match args.next() {
            Some(Value::String(s)) => s.to_string_lossy().to_string(),
            _ => String::new(),
        };
        let target = name();
        let method = name();
        let values = args.map(|v| lua_to_host_value(&v)).collect();
        let scope = InvokeScope {
            map: &call_map,
            staff,
            acting: frames.acting(),
        };
        let result = dispatcher.invoke(&scope, &target, &method, values);
        host_value_to_lua(lua, result)
    })?;
    host_tbl.set("call", call_fn)?;
    globals.set("host", host_tbl)?;

    let print_map = map;
    let print_fn = lua.create_function(move |_, args: MultiValue| {
        let line = args.iter().map(display_value).collect::<Vec<_>>().join("\t");
        info!("[Lua {print_map}] {line}");
        Ok(())
    })?;
    globals.set("print", print_fn)?;
    Ok(())
}
