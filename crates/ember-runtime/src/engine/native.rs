//! Code that runs inside a scope, on the blocking worker holding the gate.

use crate::convert::{json_to_lua, lua_to_json};
use crate::coordinator::{ScopeContext, CANCELLED_MESSAGE};
use mlua::{Function, MultiValue, ThreadStatus, Value};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// What a native call produced, plus measurements.
pub(crate) struct NativeRun {
    pub result: mlua::Result<Option<serde_json::Value>>,
    pub output: String,
    pub run: Duration,
    pub memory_before: usize,
    pub memory_after: usize,
    pub cancelled: bool,
}

/// Runs `f`, then drains the scope's output.
pub(crate) fn measured<F>(ctx: &ScopeContext<'_>, f: F) -> NativeRun
where
    F: FnOnce(&ScopeContext<'_>) -> mlua::Result<Option<serde_json::Value>>,
{
    let memory_before = ctx.lua().used_memory();
    let started = Instant::now();
    let result = f(ctx);
    let run = started.elapsed();
    NativeRun {
        result,
        output: ctx.take_output(),
        run,
        memory_before,
        memory_after: ctx.lua().used_memory(),
        cancelled: ctx.cancel_requested(),
    }
}

/// Runs `code` as a block; `return` values become the result.
pub(crate) fn run_chunk(
    ctx: &ScopeContext<'_>,
    code: &str,
    name: &str,
) -> mlua::Result<Option<serde_json::Value>> {
    let values: MultiValue = ctx
        .lua()
        .load(code)
        .set_name(name)
        .set_environment(ctx.env().clone())
        .call(())?;
    first_value(values)
}

/// REPL semantics: `command` as an expression first, as a statement otherwise.
pub(crate) fn run_command(
    ctx: &ScopeContext<'_>,
    command: &str,
) -> mlua::Result<Option<serde_json::Value>> {
    let lua = ctx.lua();
    let expression = lua
        .load(format!("return {command}"))
        .set_name("=command")
        .set_environment(ctx.env().clone())
        .into_function();
    let function: Function = match expression {
        Ok(f) => f,
        Err(_) => lua
            .load(command)
            .set_name("=command")
            .set_environment(ctx.env().clone())
            .into_function()?,
    };
    first_value(function.call(())?)
}

/// Runs `code` with `variables` bound for this call only.
///
/// The variables live in a per-call table layered over the scope: reads
/// fall through to the scope, new globals are written into it, but the
/// variables themselves (and assignments to them) vanish with the call.
pub(crate) fn run_with_variables(
    ctx: &ScopeContext<'_>,
    code: &str,
    variables: &serde_json::Map<String, serde_json::Value>,
) -> mlua::Result<Option<serde_json::Value>> {
    let lua = ctx.lua();
    let layer = lua.create_table()?;
    for (name, value) in variables {
        layer.raw_set(name.as_str(), json_to_lua(lua, value)?)?;
    }
    let meta = lua.create_table()?;
    meta.raw_set("__index", ctx.env().clone())?;
    meta.raw_set("__newindex", ctx.env().clone())?;
    layer.set_metatable(Some(meta));

    let values: MultiValue = lua
        .load(code)
        .set_name("=variables")
        .set_environment(layer)
        .call(())?;
    first_value(values)
}

/// Runs `code`, then drives `function_name` as a coroutine, sending each
/// yielded value through `items`.
///
/// `blocking_send` on a channel of capacity one keeps at most one item in
/// flight: the coroutine is not resumed until the previous item was taken.
/// Returns the function's final return value.
pub(crate) fn run_generator(
    ctx: &ScopeContext<'_>,
    code: &str,
    function_name: &str,
    items: mpsc::Sender<serde_json::Value>,
) -> mlua::Result<Option<serde_json::Value>> {
    let lua = ctx.lua();
    lua.load(code)
        .set_name("=generator")
        .set_environment(ctx.env().clone())
        .exec()?;

    let function = match ctx.env().get::<Value>(function_name)? {
        Value::Function(f) => f,
        other => {
            return Err(mlua::Error::RuntimeError(format!(
                "'{function_name}' is not a function (got {})",
                other.type_name()
            )))
        }
    };

    let thread = lua.create_thread(function)?;
    loop {
        let values: MultiValue = thread.resume(())?;
        if thread.status() != ThreadStatus::Resumable {
            return first_value(values);
        }
        let item = first_value(values)?.unwrap_or(serde_json::Value::Null);
        if items.blocking_send(item).is_err() {
            // Receiver dropped: nobody wants more items
            return Ok(None);
        }
        if ctx.cancel_requested() {
            return Err(mlua::Error::RuntimeError(CANCELLED_MESSAGE.into()));
        }
    }
}

fn first_value(values: MultiValue) -> mlua::Result<Option<serde_json::Value>> {
    match values.into_iter().next() {
        None | Some(Value::Nil) => Ok(None),
        Some(value) => lua_to_json(&value).map(Some),
    }
}

/// Formats an mlua error for callers, keeping Lua's own message intact.
pub(crate) fn format_lua_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::CallbackError { cause, .. } => format_lua_error(cause),
        mlua::Error::SyntaxError { message, .. } => format!("syntax error: {message}"),
        mlua::Error::MemoryError(msg) => format!("out of memory: {msg}"),
        mlua::Error::WithContext { context, cause } => {
            format!("{context}: {}", format_lua_error(cause))
        }
        _ => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_errors_keep_lua_message() {
        let lua = mlua::Lua::new();
        let err = lua.load("error('boom')").exec().unwrap_err();
        assert!(format_lua_error(&err).contains("boom"));
    }

    #[test]
    fn syntax_errors_are_labelled() {
        let lua = mlua::Lua::new();
        let err = lua.load("local = ").exec().unwrap_err();
        assert!(format_lua_error(&err).starts_with("syntax error:"));
    }

    #[test]
    fn callback_errors_unwrap_to_cause() {
        let lua = mlua::Lua::new();
        let f = lua
            .create_function(|_, ()| -> mlua::Result<()> {
                Err(mlua::Error::RuntimeError("from rust".into()))
            })
            .unwrap();
        lua.globals().set("fail", f).unwrap();
        let err = lua.load("fail()").exec().unwrap_err();
        assert!(format_lua_error(&err).contains("from rust"));
    }

    #[test]
    fn first_value_ignores_nil_and_extras() {
        let lua = mlua::Lua::new();
        let none: MultiValue = lua.load("return nil, 2").eval().unwrap();
        assert_eq!(first_value(none).unwrap(), None);
        let some: MultiValue = lua.load("return 'a', 'b'").eval().unwrap();
        assert_eq!(first_value(some).unwrap(), Some(serde_json::json!("a")));
        let empty: MultiValue = lua.load("local x = 1").eval().unwrap();
        assert_eq!(first_value(empty).unwrap(), None);
    }
}
