//! Transport form of a value captured inside a sandbox.
//!
//! JS objects cannot leave their context, so the bootstrap program walks
//! every console argument and emits a structured clone of it. Arrays and
//! objects carry an `id` assigned in depth-first order; the second time the
//! walk reaches the same object it emits a `ref` to that id instead of
//! descending again. That is how cyclic (and shared) graphs cross the
//! boundary in finite size.

use serde::{Deserialize, Serialize};

/// What a non-serializable leaf was in the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpaqueKind {
    Function,
    Symbol,
    Error,
    Bigint,
    /// Reading the value threw (throwing getter, `toJSON` failure, …).
    Unserializable,
    /// `text` is already JSON: a top-level `toJSON()` that returned a string.
    Json,
    /// Nested past the capture depth; `text` is `[Object]` or `[Array]`.
    Truncated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "k", rename_all = "snake_case")]
pub enum RemoteValue {
    Undefined,
    Null,
    Bool {
        v: bool,
    },
    /// `v` is `None` for NaN and the infinities. `text` is the engine's
    /// own `String(n)`, so numbers print exactly as the script sees them.
    Number {
        v: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    String {
        v: String,
    },
    Array {
        id: u32,
        items: Vec<RemoteValue>,
        /// `String(value)` (cycle-safe), only present on top-level arguments.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Object {
        id: u32,
        entries: Vec<(String, RemoteValue)>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Back-reference to an array/object already emitted earlier in the walk.
    Ref {
        id: u32,
    },
    Opaque {
        kind: OpaqueKind,
        text: String,
    },
}

impl RemoteValue {
    /// The best-effort textual coercion of this value, used when
    /// structured rendering is impossible.
    pub fn coerced_text(&self) -> Option<&str> {
        match self {
            RemoteValue::Array { text, .. } | RemoteValue::Object { text, .. } => text.as_deref(),
            RemoteValue::Opaque { text, .. } => Some(text),
            RemoteValue::String { v } => Some(v),
            _ => None,
        }
    }
}
