//! Conversions between Lua values and JSON.
//!
//! JSON is the only shape values take outside the coordinator: variables
//! injected by callers, results returned from executions, and items
//! yielded by generators.

use mlua::{Lua, Table, Value};

/// Nesting depth at which conversion gives up (guards self-referencing tables).
const MAX_DEPTH: usize = 64;

/// Converts JSON into a Lua value owned by `lua`.
///
/// Arrays become sequences starting at index 1; `null` becomes `nil`
/// (leaving a hole when inside an array).
pub(crate) fn json_to_lua(lua: &Lua, value: &serde_json::Value) -> mlua::Result<Value> {
    Ok(match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::String(lua.create_string(s)?),
        serde_json::Value::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, json_to_lua(lua, item)?)?;
            }
            Value::Table(table)
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (k, v) in map {
                table.raw_set(k.as_str(), json_to_lua(lua, v)?)?;
            }
            Value::Table(table)
        }
    })
}

/// Converts a Lua value into JSON.
///
/// Tables with a non-empty sequence part become arrays, other tables
/// objects with stringified keys. Functions, threads and userdata become
/// descriptive strings such as `"<function>"`.
///
/// # Errors
///
/// Fails on tables nested deeper than 64 levels (including cycles).
pub(crate) fn lua_to_json(value: &Value) -> mlua::Result<serde_json::Value> {
    to_json(value, 0)
}

fn to_json(value: &Value, depth: usize) -> mlua::Result<serde_json::Value> {
    match value {
        Value::Nil => Ok(serde_json::Value::Null),
        Value::Boolean(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Integer(i) => Ok(serde_json::Value::Number((*i).into())),
        Value::Number(n) => Ok(serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        Value::String(s) => Ok(serde_json::Value::String(s.to_string_lossy())),
        Value::Table(table) => {
            if depth >= MAX_DEPTH {
                return Err(mlua::Error::SerializeError(format!(
                    "table nesting exceeds {MAX_DEPTH} levels"
                )));
            }
            table_to_json(table, depth + 1)
        }
        other => Ok(serde_json::Value::String(format!("<{}>", other.type_name()))),
    }
}

fn table_to_json(table: &Table, depth: usize) -> mlua::Result<serde_json::Value> {
    let len = table.raw_len();
    if len > 0 {
        let mut items = Vec::with_capacity(len);
        for i in 1..=len {
            let v: Value = table.raw_get(i)?;
            items.push(to_json(&v, depth)?);
        }
        return Ok(serde_json::Value::Array(items));
    }

    let mut map = serde_json::Map::new();
    for pair in table.pairs::<Value, Value>() {
        let (k, v) = pair?;
        let key = match &k {
            Value::String(s) => s.to_string_lossy(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Boolean(b) => b.to_string(),
            other => format!("<{}>", other.type_name()),
        };
        map.insert(key, to_json(&v, depth)?);
    }
    Ok(serde_json::Value::Object(map))
}

/// Renders a value the way Lua's `tostring` would, falling back to the
/// type name when `tostring` is unavailable or fails.
pub(crate) fn lua_display(lua: &Lua, value: &Value) -> String {
    let rendered = lua
        .globals()
        .raw_get::<mlua::Function>("tostring")
        .and_then(|f| f.call::<mlua::String>(value.clone()));
    match rendered {
        Ok(s) => s.to_string_lossy(),
        Err(_) => format!("<{}>", value.type_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_convert_both_ways() {
        let lua = Lua::new();
        for value in [json!(null), json!(true), json!(42), json!(1.5), json!("hi")] {
            let lua_value = json_to_lua(&lua, &value).unwrap();
            assert_eq!(lua_to_json(&lua_value).unwrap(), value);
        }
    }

    #[test]
    fn nested_structures_survive() {
        let lua = Lua::new();
        let value = json!({"name": "ember", "tags": ["a", "b"], "meta": {"n": 3}});
        let lua_value = json_to_lua(&lua, &value).unwrap();
        assert_eq!(lua_to_json(&lua_value).unwrap(), value);
    }

    #[test]
    fn lua_tables_map_to_arrays_and_objects() {
        let lua = Lua::new();
        let seq: Value = lua.load("return {10, 20, 30}").eval().unwrap();
        assert_eq!(lua_to_json(&seq).unwrap(), json!([10, 20, 30]));

        let obj: Value = lua.load("return {x = 1, [2] = 'two'}").eval().unwrap();
        assert_eq!(lua_to_json(&obj).unwrap(), json!({"x": 1, "2": "two"}));
    }

    #[test]
    fn functions_become_descriptive_strings() {
        let lua = Lua::new();
        let f: Value = lua.load("return print").eval().unwrap();
        assert_eq!(lua_to_json(&f).unwrap(), json!("<function>"));
    }

    #[test]
    fn self_referencing_table_is_an_error() {
        let lua = Lua::new();
        let cyclic: Value = lua.load("local t = {}; t.self = t; return t").eval().unwrap();
        assert!(lua_to_json(&cyclic).is_err());
    }

    #[test]
    fn non_finite_numbers_become_null() {
        let lua = Lua::new();
        let inf: Value = lua.load("return math.huge").eval().unwrap();
        assert_eq!(lua_to_json(&inf).unwrap(), json!(null));
    }

    #[test]
    fn display_matches_tostring() {
        let lua = Lua::new();
        assert_eq!(lua_display(&lua, &Value::Integer(7)), "7");
        assert_eq!(lua_display(&lua, &Value::Number(2.0)), "2.0");
        assert_eq!(lua_display(&lua, &Value::Nil), "nil");
        let custom: Value = lua
            .load("return setmetatable({}, {__tostring = function() return 'custom' end})")
            .eval()
            .unwrap();
        assert_eq!(lua_display(&lua, &custom), "custom");
    }
}
