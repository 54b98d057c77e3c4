//! The Lua state behind the gate and the scopes living inside it.
//!
//! A scope is an `_ENV` table held in the Lua registry. Every chunk run
//! for a session is loaded with that table as its environment, so globals
//! a session defines land in its own table and never in another scope's.
//!
//! # Scope Contents
//!
//! ```text
//! _ENV
//! ├── assert error ipairs next pairs pcall select
//! │   tonumber tostring type xpcall rawget rawset
//! │   rawequal rawlen setmetatable getmetatable
//! ├── math string table utf8 coroutine   (per-scope copies)
//! ├── os { time clock date }
//! ├── print    → scope output buffer
//! ├── require  → <env>/share/lua/<ver>/{mod}.lua | {mod}/init.lua
//! ├── package  { loaded = {...} }        (per scope)
//! ├── sleep(seconds)
//! └── _G       → _ENV
//! ```
//!
//! Unsandboxed scopes additionally fall through to the real globals via
//! an `__index` metatable.
//!
//! Strings share one metatable per Lua state. It is sealed when the state
//! is built, so `getmetatable('')` returns `false` and no scope can reach
//! the global `string` table through it.

use super::cancel::CancelState;
use crate::convert::lua_display;
use crate::environment::Environment;
use ember_types::{EnvironmentId, ScopeId};
use mlua::{Function, HookTriggers, Lua, MultiValue, RegistryKey, Table, Value, VmState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Base functions copied into every scope.
const SAFE_GLOBALS: &[&str] = &[
    "assert",
    "error",
    "ipairs",
    "next",
    "pairs",
    "pcall",
    "select",
    "tonumber",
    "tostring",
    "type",
    "xpcall",
    "rawget",
    "rawset",
    "rawequal",
    "rawlen",
    "setmetatable",
    "getmetatable",
];

/// Libraries copied (shallowly) into every scope.
const SAFE_LIBRARIES: &[&str] = &["math", "string", "table", "utf8", "coroutine"];

/// `os` functions exposed to sandboxed scopes.
const SAFE_OS: &[&str] = &["time", "clock", "date"];

/// Cap on output captured by `print` in one scope between two takes.
pub(crate) const MAX_CAPTURED_OUTPUT: usize = 1 << 20;
const TRUNCATION_MARKER: &str = "...[output truncated]\n";

/// Longest single `sleep` call.
const MAX_SLEEP_SECS: f64 = 86_400.0;

/// Message raised inside Lua when the running call is cancelled.
pub(crate) const CANCELLED_MESSAGE: &str = "execution cancelled";

/// Settings applied to every Lua state the coordinator builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmOptions {
    /// Restrict scopes to the safe library subset.
    pub sandboxed: bool,
    /// Instructions between cancellation checks.
    pub cancel_check_instructions: u32,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            sandboxed: true,
            cancel_check_instructions: 1_000,
        }
    }
}

/// What a scope needs to know about its environment.
#[derive(Debug, Clone)]
pub(crate) struct ScopeTarget {
    pub environment: EnvironmentId,
    pub search_paths: Vec<PathBuf>,
}

impl From<&Environment> for ScopeTarget {
    fn from(env: &Environment) -> Self {
        Self {
            environment: env.id,
            search_paths: vec![env.module_dir()],
        }
    }
}

struct ScopeState {
    env: RegistryKey,
    output: Arc<Mutex<String>>,
    environment: EnvironmentId,
}

/// Borrowed pieces of one scope, handed to native calls.
pub(crate) struct ScopeParts {
    pub env: Table,
    pub output: Arc<Mutex<String>>,
    pub environment: EnvironmentId,
}

/// One Lua state plus its scope arena.
pub(crate) struct LuaVm {
    lua: Lua,
    options: VmOptions,
    scopes: HashMap<u64, ScopeState>,
    next_index: u64,
    generation: u64,
    shared: Option<ScopeId>,
}

impl std::fmt::Debug for LuaVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaVm")
            .field("generation", &self.generation)
            .field("scopes", &self.scopes.len())
            .field("shared", &self.shared)
            .finish()
    }
}

impl LuaVm {
    /// Builds a fresh Lua state for `generation` with the cancellation hook installed.
    pub fn new(generation: u64, options: VmOptions, cancel: CancelState) -> mlua::Result<Self> {
        let lua = Lua::new();
        seal_string_metatable(&lua)?;
        install_cancel_hook(&lua, options.cancel_check_instructions, cancel);
        Ok(Self {
            lua,
            options,
            scopes: HashMap::new(),
            next_index: 0,
            generation,
            shared: None,
        })
    }

    /// Builds a state whose single shared scope targets `target`.
    pub fn with_shared_scope(
        generation: u64,
        options: VmOptions,
        cancel: CancelState,
        target: &ScopeTarget,
    ) -> mlua::Result<Self> {
        let mut vm = Self::new(generation, options, cancel)?;
        let scope = vm.create_scope(target)?;
        vm.shared = Some(scope);
        Ok(vm)
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn shared_scope(&self) -> Option<ScopeId> {
        self.shared
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    /// Creates a new scope and returns its handle.
    pub fn create_scope(&mut self, target: &ScopeTarget) -> mlua::Result<ScopeId> {
        let output = Arc::new(Mutex::new(String::new()));
        let env = build_scope_env(&self.lua, target, Arc::clone(&output), self.options.sandboxed)?;
        let key = self.lua.create_registry_value(env)?;

        let index = self.next_index;
        self.next_index += 1;
        self.scopes.insert(
            index,
            ScopeState {
                env: key,
                output,
                environment: target.environment,
            },
        );
        Ok(ScopeId::new(index, self.generation))
    }

    /// Drops a scope. Returns `false` for unknown, stale or shared handles.
    pub fn destroy_scope(&mut self, scope: ScopeId) -> bool {
        if scope.generation() != self.generation || Some(scope) == self.shared {
            return false;
        }
        let Some(state) = self.scopes.remove(&scope.index()) else {
            return false;
        };
        // Removal only fails for keys from another state, which cannot happen here.
        let _ = self.lua.remove_registry_value(state.env);
        self.lua.expire_registry_values();
        true
    }

    /// Resolves a handle of the current generation.
    pub fn parts(&self, scope: ScopeId) -> mlua::Result<Option<ScopeParts>> {
        if scope.generation() != self.generation {
            return Ok(None);
        }
        let Some(state) = self.scopes.get(&scope.index()) else {
            return Ok(None);
        };
        let env: Table = self.lua.registry_value(&state.env)?;
        Ok(Some(ScopeParts {
            env,
            output: Arc::clone(&state.output),
            environment: state.environment,
        }))
    }
}

/// Hides the shared string metatable behind `__metatable`.
fn seal_string_metatable(lua: &Lua) -> mlua::Result<()> {
    lua.load("getmetatable('').__metatable = false")
        .set_name("=seal")
        .exec()
}

fn install_cancel_hook(lua: &Lua, every: u32, cancel: CancelState) {
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(every.max(1)),
        move |_lua, _debug| {
            if cancel.current_is_cancelled() {
                Err(mlua::Error::RuntimeError(CANCELLED_MESSAGE.into()))
            } else {
                Ok(VmState::Continue)
            }
        },
    );
}

/// Builds the `_ENV` table for one scope.
fn build_scope_env(
    lua: &Lua,
    target: &ScopeTarget,
    output: Arc<Mutex<String>>,
    sandboxed: bool,
) -> mlua::Result<Table> {
    let env = lua.create_table()?;
    let globals = lua.globals();
    let loaded = lua.create_table()?;

    for name in SAFE_GLOBALS {
        let value: Value = globals.raw_get(*name)?;
        if !value.is_nil() {
            env.raw_set(*name, value)?;
        }
    }

    for lib in SAFE_LIBRARIES {
        if let Value::Table(table) = globals.raw_get::<Value>(*lib)? {
            let copy = shallow_copy(lua, &table)?;
            env.raw_set(*lib, copy.clone())?;
            loaded.raw_set(*lib, copy)?;
        }
    }

    if sandboxed {
        if let Value::Table(os) = globals.raw_get::<Value>("os")? {
            let safe_os = lua.create_table()?;
            for name in SAFE_OS {
                safe_os.raw_set(*name, os.raw_get::<Value>(*name)?)?;
            }
            env.raw_set("os", safe_os.clone())?;
            loaded.raw_set("os", safe_os)?;
        }
    }

    env.raw_set("print", make_print(lua, output)?)?;
    env.raw_set("sleep", make_sleep(lua)?)?;

    let package = lua.create_table()?;
    package.raw_set("loaded", loaded)?;
    env.raw_set("package", package)?;
    env.raw_set("require", make_require(lua, &env, target.search_paths.clone())?)?;
    env.raw_set("_G", env.clone())?;

    if !sandboxed {
        let meta = lua.create_table()?;
        meta.raw_set("__index", globals)?;
        env.set_metatable(Some(meta));
    }

    Ok(env)
}

fn shallow_copy(lua: &Lua, source: &Table) -> mlua::Result<Table> {
    let copy = lua.create_table()?;
    for pair in source.pairs::<Value, Value>() {
        let (k, v) = pair?;
        copy.raw_set(k, v)?;
    }
    Ok(copy)
}

/// `print` writing tab-separated `tostring` renderings into the scope buffer.
fn make_print(lua: &Lua, output: Arc<Mutex<String>>) -> mlua::Result<Function> {
    lua.create_function(move |lua, args: MultiValue| {
        let line = args
            .iter()
            .map(|v| lua_display(lua, v))
            .collect::<Vec<_>>()
            .join("\t");

        let mut buf = output.lock();
        if buf.len() + line.len() < MAX_CAPTURED_OUTPUT {
            buf.push_str(&line);
            buf.push('\n');
        } else if !buf.ends_with(TRUNCATION_MARKER) {
            buf.push_str(TRUNCATION_MARKER);
        }
        Ok(())
    })
}

/// `sleep(seconds)`: a blocking native call, not interruptible by cancellation.
fn make_sleep(lua: &Lua) -> mlua::Result<Function> {
    lua.create_function(|_, seconds: f64| {
        if seconds.is_finite() && seconds > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(seconds.min(MAX_SLEEP_SECS)));
        }
        Ok(())
    })
}

/// Scope-private `require`.
///
/// The Rust loader captures only the search paths; the Lua wrapper
/// closes over the scope table, so nothing outside the Lua heap keeps the
/// scope alive.
fn make_require(lua: &Lua, env: &Table, search_paths: Vec<PathBuf>) -> mlua::Result<Function> {
    let load_module = lua.create_function(move |lua, (env, name): (Table, String)| {
        require_in(lua, &env, &name, &search_paths)
    })?;

    lua.load("local load_module, env = ...\nreturn function(name) return load_module(env, name) end")
        .set_name("=require")
        .call((load_module, env.clone()))
}

fn require_in(lua: &Lua, env: &Table, name: &str, search_paths: &[PathBuf]) -> mlua::Result<Value> {
    let package: Table = env
        .raw_get("package")
        .map_err(|e| mlua::Error::RuntimeError(format!("package table missing: {e}")))?;
    let loaded: Table = package
        .raw_get("loaded")
        .map_err(|e| mlua::Error::RuntimeError(format!("package.loaded missing: {e}")))?;

    let cached: Value = loaded.raw_get(name)?;
    if !cached.is_nil() {
        return Ok(cached);
    }

    let module_rel = name.replace('.', "/");
    let mut searched = Vec::new();
    for base in search_paths {
        for candidate in [
            base.join(format!("{module_rel}.lua")),
            base.join(&module_rel).join("init.lua"),
        ] {
            if let Some(source) = try_read_within_base(&candidate, base) {
                let value: Value = lua
                    .load(source)
                    .set_name(format!("@{}", candidate.display()))
                    .set_environment(env.clone())
                    .call((name, candidate.display().to_string()))
                    .map_err(|e| {
                        mlua::Error::RuntimeError(format!(
                            "error loading module '{name}' from {}: {e}",
                            candidate.display()
                        ))
                    })?;
                // A module returning nothing is recorded as loaded, like stock `require`.
                let value = if value.is_nil() {
                    Value::Boolean(true)
                } else {
                    value
                };
                loaded.raw_set(name, value.clone())?;
                return Ok(value);
            }
            searched.push(candidate.display().to_string());
        }
    }

    Err(mlua::Error::RuntimeError(format!(
        "module '{name}' not found (searched: {})",
        searched.join(", ")
    )))
}

/// Reads `path` only if it resolves inside `base` (no `..` or symlink escape).
fn try_read_within_base(path: &Path, base: &Path) -> Option<String> {
    let canonical = path.canonicalize().ok()?;
    let base_canonical = base.canonicalize().ok()?;
    if !canonical.starts_with(&base_canonical) || !canonical.is_file() {
        return None;
    }
    std::fs::read_to_string(&canonical).ok()
}
