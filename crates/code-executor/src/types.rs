use std::fmt;

use rustpython_parser::{Mode, parse};
use sandbox::{ResourceLimits, Submission};
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::LimitPolicy;

/// Filename reported in syntax errors, matching the worker's.
const SOURCE_NAME: &str = "<submission>";

/// Largest accepted source, in bytes.
pub const MAX_CODE_BYTES: usize = 1024 * 1024;

/// Names a binding may not take: they would shadow the interpreter's own
/// exit and import hooks.
const RESERVED_NAMES: [&str; 4] = ["exit", "quit", "__builtins__", "__import__"];

const PYTHON_KEYWORDS: [&str; 35] = [
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// Body of `POST /execute`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    #[serde(alias = "source_code")]
    pub code: String,
    #[serde(default, alias = "params", deserialize_with = "unique_bindings")]
    pub bindings: Option<Map<String, Value>>,
    #[serde(default)]
    pub time_limit_ms: Option<u64>,
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,
    #[serde(default)]
    pub output_limit_bytes: Option<u64>,
}

/// Why a request was turned away before reaching the pool.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    /// Malformed request: reported as `invalid_request`.
    #[error("{0}")]
    Invalid(String),
    /// The code does not parse: reported as an execution `SyntaxError`.
    #[error("{0}")]
    Syntax(String),
}

/// A request that passed validation. Immutable from here on.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub submission: Submission,
    pub limits: ResourceLimits,
}

impl ExecuteRequest {
    /// Check code, binding names and limits before any slot is acquired.
    pub fn validate(self, policy: &LimitPolicy) -> Result<ExecutionRequest, Rejection> {
        if self.code.trim().is_empty() {
            return Err(Rejection::Invalid("code must not be empty".into()));
        }
        if self.code.len() > MAX_CODE_BYTES {
            return Err(Rejection::Invalid(format!("code exceeds {MAX_CODE_BYTES} bytes")));
        }
        let bindings = self.bindings.unwrap_or_default();
        for name in bindings.keys() {
            check_binding_name(name).map_err(Rejection::Invalid)?;
        }
        let limits = policy
            .resolve(
                self.time_limit_ms,
                self.memory_limit_bytes,
                self.output_limit_bytes,
            )
            .map_err(Rejection::Invalid)?;
        check_syntax(&self.code).map_err(Rejection::Syntax)?;
        Ok(ExecutionRequest {
            id: Uuid::new_v4(),
            submission: Submission {
                code: self.code,
                bindings,
            },
            limits,
        })
    }
}

fn check_binding_name(name: &str) -> Result<(), String> {
    if !is_identifier(name) || PYTHON_KEYWORDS.contains(&name) {
        return Err(format!("binding {name:?} is not a valid identifier"));
    }
    let dunder = name.len() > 4 && name.starts_with("__") && name.ends_with("__");
    if RESERVED_NAMES.contains(&name) || dunder {
        return Err(format!("binding {name:?} is reserved"));
    }
    Ok(())
}

/// Parse the code as a module, reporting failures the way the interpreter
/// words them.
fn check_syntax(code: &str) -> Result<(), String> {
    let Err(err) = parse(code, Mode::Module, SOURCE_NAME) else {
        return Ok(());
    };
    let offset = u32::from(err.offset) as usize;
    let line = code.bytes().take(offset).filter(|b| *b == b'\n').count() + 1;
    Err(format!("{} ({SOURCE_NAME}, line {line})", err.error))
}

/// `bindings` as a JSON object whose keys appear once. A repeated key
/// would otherwise silently keep the last value.
#[derive(Debug, Default)]
pub struct Bindings(pub Map<String, Value>);

impl<'de> Deserialize<'de> for Bindings {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(BindingsVisitor)
    }
}

struct BindingsVisitor;

impl<'de> Visitor<'de> for BindingsVisitor {
    type Value = Bindings;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an object of bindings")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Bindings, A::Error> {
        let mut bindings = Map::new();
        while let Some(key) = access.next_key::<String>()? {
            if bindings.contains_key(&key) {
                return Err(de::Error::custom(format_args!("duplicate binding {key:?}")));
            }
            let value = access.next_value()?;
            bindings.insert(key, value);
        }
        Ok(Bindings(bindings))
    }
}

fn unique_bindings<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Map<String, Value>>, D::Error> {
    Ok(Option::<Bindings>::deserialize(deserializer)?.map(|b| b.0))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_alphanumeric())
}
