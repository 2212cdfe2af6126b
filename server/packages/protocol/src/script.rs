//! Console scripts understood by the runtime's script host.

use std::fmt::Write as _;

use serde_json::Value;

use crate::input::InputEvent;

/// Renders a JSON value as a Lua table constructor.
///
/// Arrays become positional tables and objects become `["key"] = value`
/// tables in key order. `null` is `nil`.
pub fn to_lua(value: &Value) -> String {
    let mut out = String::new();
    write_lua(&mut out, value);
    out
}

fn write_lua(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("nil"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => {
            let _ = write!(out, "{number}");
        }
        Value::String(text) => write_quoted(out, text),
        Value::Array(items) => {
            out.push('{');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_lua(out, item);
            }
            out.push('}');
        }
        Value::Object(map) => {
            out.push('{');
            for (index, (key, item)) in map.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push('[');
                write_quoted(out, key);
                out.push_str("] = ");
                write_lua(out, item);
            }
            out.push('}');
        }
    }
}

fn write_quoted(out: &mut String, text: &str) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
}

/// `<ns>.Input.add_remote_events({...})` for one batch of input events.
pub fn add_remote_events(namespace: &str, events: &[InputEvent]) -> Result<String, serde_json::Error> {
    let batch = serde_json::to_value(events)?;
    Ok(format!("{namespace}.Input.add_remote_events({})", to_lua(&batch)))
}

pub fn set_resolution(namespace: &str, width: u32, height: u32) -> String {
    format!("{namespace}.Window.set_resolution({width}, {height})")
}
