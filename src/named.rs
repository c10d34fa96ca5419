//! Named-parameter binding.
//!
//! Statements may reference parameters as `:name`. Before execution the statement is
//! rewritten to the backend's positional placeholders and the values are laid out in
//! the order they appear. String literals, quoted identifiers, comments and
//! PostgreSQL `::type` casts are left untouched.

use crate::error::{Error, Result};
use crate::value::Value;
use serde::Serialize;
use std::collections::BTreeMap;

/// Positional placeholder syntax of the target backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// `?` (MySQL, SQLite)
    Question,
    /// `$1`, `$2`, ... (PostgreSQL)
    Dollar,
}

impl Placeholder {
    pub fn for_url(url: &str) -> Self {
        if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Placeholder::Dollar
        } else {
            Placeholder::Question
        }
    }
}

/// Name-keyed statement arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamedArgs {
    values: BTreeMap<String, Value>,
}

impl NamedArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces `name`. A leading `:` is ignored.
    pub fn set(mut self, name: impl AsRef<str>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<Value>) {
        let name = name.as_ref().trim_start_matches(':').to_string();
        self.values.insert(name, value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Takes every field of a serializable struct (or map) as an argument, using its
    /// serde field names, so `#[serde(rename = "...")]` tags decide the parameter names.
    ///
    /// # Errors
    ///
    /// Fails if `value` does not serialize to a JSON object.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        match serde_json::to_value(value)? {
            serde_json::Value::Object(map) => Ok(Self {
                values: map
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            }),
            other => Err(Error::NamedParameter(format!(
                "expected a struct or map, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Rewrites `sql` to positional form and returns it with the ordered values.
    pub fn bind(&self, sql: &str, style: Placeholder) -> Result<(String, Vec<Value>)> {
        let mut out = String::with_capacity(sql.len());
        let mut values = Vec::new();
        let mut seen: Vec<&str> = Vec::new();

        let bytes = sql.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            match c {
                b'\'' | b'"' | b'`' => {
                    let end = skip_quoted(bytes, i, c);
                    out.push_str(&sql[i..end]);
                    i = end;
                }
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    let end = sql[i..].find('\n').map_or(bytes.len(), |n| i + n);
                    out.push_str(&sql[i..end]);
                    i = end;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    let end = sql[i + 2..].find("*/").map_or(bytes.len(), |n| i + 2 + n + 2);
                    out.push_str(&sql[i..end]);
                    i = end;
                }
                b':' if bytes.get(i + 1) == Some(&b':') => {
                    out.push_str("::");
                    i += 2;
                }
                b':' if bytes.get(i + 1).is_some_and(|b| is_ident_start(*b)) => {
                    let start = i + 1;
                    let mut end = start;
                    while end < bytes.len() && is_ident(bytes[end]) {
                        end += 1;
                    }
                    let name = &sql[start..end];
                    let value = self.values.get(name).ok_or_else(|| {
                        Error::NamedParameter(format!("missing value for :{name}"))
                    })?;

                    match style {
                        // untyped NULL goes in as a literal so the backend types it from context
                        _ if *value == Value::Null => out.push_str("NULL"),
                        Placeholder::Question => {
                            out.push('?');
                            values.push(value.clone());
                        }
                        Placeholder::Dollar => {
                            let pos = match seen.iter().position(|n| *n == name) {
                                Some(pos) => pos,
                                None => {
                                    seen.push(name);
                                    values.push(value.clone());
                                    seen.len() - 1
                                }
                            };
                            out.push('$');
                            out.push_str(&(pos + 1).to_string());
                        }
                    }
                    i = end;
                }
                _ => {
                    let len = utf8_len(c);
                    out.push_str(&sql[i..i + len]);
                    i += len;
                }
            }
        }

        Ok((out, values))
    }
}

impl<K: AsRef<str>, V: Into<Value>> FromIterator<(K, V)> for NamedArgs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut args = NamedArgs::new();
        for (k, v) in iter {
            args.insert(k, v);
        }
        args
    }
}

fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            // doubled quote is an escaped quote
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        if bytes[i] == b'\\' && quote != b'`' {
            i += 2;
            continue;
        }
        i += 1;
    }
    bytes.len()
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn utf8_len(first: u8) -> usize {
    match first {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
