//! Value formatter: turns a captured sandbox value into display text.
//!
//! Rendering follows `JSON.stringify(value, replacer, 2)` as the script
//! would see it, with one difference at the top level: plain strings are
//! returned raw (no quotes), and values JSON has no text for (functions,
//! symbols, `undefined`) fall back to their textual coercion.
//!
//! Cycle policy: a set of object identities is kept for the duration of a
//! single `format` call. Reaching an identity a second time, or any `ref`
//! node, renders the [`CIRCULAR`] placeholder instead of descending.

use std::collections::HashSet;

use serde_json::Value;

use crate::value::{OpaqueKind, RemoteValue};

/// Placeholder substituted for an already-visited object.
pub const CIRCULAR: &str = "[Circular]";

/// Coercion used when a failed value carries no text of its own.
const FALLBACK_TEXT: &str = "[object Object]";

/// A node whose presence makes structured rendering impossible
/// (the equivalent of `JSON.stringify` throwing).
#[derive(Debug)]
struct Unserializable;

#[derive(Debug, Clone)]
pub struct ValueFormatter {
    indent: usize,
}

impl Default for ValueFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueFormatter {
    pub fn new() -> Self {
        Self { indent: 2 }
    }

    /// Formats one value. Never fails: any serialization failure is
    /// replaced by the value's textual coercion.
    pub fn format(&self, value: &RemoteValue) -> String {
        match value {
            RemoteValue::String { v } => v.clone(),
            RemoteValue::Undefined => "undefined".to_string(),
            RemoteValue::Opaque { text, .. } => text.clone(),
            _ => {
                // Fresh per call: two independent values never share markers.
                let mut visited = HashSet::new();
                match self.render(value, 0, &mut visited) {
                    Ok(Some(text)) => text,
                    Ok(None) | Err(Unserializable) => value
                        .coerced_text()
                        .unwrap_or(FALLBACK_TEXT)
                        .to_string(),
                }
            }
        }
    }

    /// Formats every argument of a console call and joins them with a space.
    pub fn format_args(&self, args: &[RemoteValue]) -> String {
        args.iter()
            .map(|arg| self.format(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// `Ok(None)` means "no JSON text": the value is skipped inside
    /// objects and becomes `null` inside arrays.
    fn render(
        &self,
        value: &RemoteValue,
        depth: usize,
        visited: &mut HashSet<u32>,
    ) -> Result<Option<String>, Unserializable> {
        let text = match value {
            RemoteValue::Undefined => return Ok(None),
            RemoteValue::Null => "null".to_string(),
            RemoteValue::Bool { v } => v.to_string(),
            RemoteValue::Number { v: None, .. } => "null".to_string(),
            RemoteValue::Number { v: Some(n), text } => match text {
                Some(text) => text.clone(),
                None => js_number(*n),
            },
            RemoteValue::String { v } => quote(v),
            RemoteValue::Ref { .. } => quote(CIRCULAR),
            RemoteValue::Opaque { kind, text } => match kind {
                OpaqueKind::Function | OpaqueKind::Symbol => return Ok(None),
                OpaqueKind::Error | OpaqueKind::Truncated => quote(text),
                OpaqueKind::Json => text.clone(),
                OpaqueKind::Bigint | OpaqueKind::Unserializable => return Err(Unserializable),
            },
            RemoteValue::Array { id, items, .. } => {
                if !visited.insert(*id) {
                    return Ok(Some(quote(CIRCULAR)));
                }
                let mut rendered = Vec::with_capacity(items.len());
                for item in items {
                    let text = self.render(item, depth + 1, visited)?;
                    rendered.push(text.unwrap_or_else(|| "null".to_string()));
                }
                self.block('[', ']', rendered, depth)
            }
            RemoteValue::Object { id, entries, .. } => {
                if !visited.insert(*id) {
                    return Ok(Some(quote(CIRCULAR)));
                }
                let mut rendered = Vec::with_capacity(entries.len());
                for (key, item) in entries {
                    if let Some(text) = self.render(item, depth + 1, visited)? {
                        rendered.push(format!("{}: {text}", quote(key)));
                    }
                }
                self.block('{', '}', rendered, depth)
            }
        };
        Ok(Some(text))
    }

    fn block(&self, open: char, close: char, members: Vec<String>, depth: usize) -> String {
        if members.is_empty() {
            return format!("{open}{close}");
        }
        let inner = " ".repeat(self.indent * (depth + 1));
        let outer = " ".repeat(self.indent * depth);
        let body = members
            .iter()
            .map(|m| format!("{inner}{m}"))
            .collect::<Vec<_>>()
            .join(",\n");
        format!("{open}\n{body}\n{outer}{close}")
    }
}

/// JSON string literal (same escaping rules as `JSON.stringify`).
fn quote(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

/// Number text for values that arrived without the engine's own rendering.
fn js_number(n: f64) -> String {
    if n == 0.0 {
        // Also covers -0, which JSON prints as 0
        return "0".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e21 {
        return format!("{n:.0}");
    }
    n.to_string()
}
