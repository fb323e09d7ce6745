//! GDB/MI types and data structures
//!
//! This module defines the data structures used to represent GDB/MI protocol messages.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::parser::{parse_c_string, parse_results};

/// Classifier character that opens every MI output line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    Result,      // ^ prefix
    ExecAsync,   // * prefix
    StatusAsync, // + prefix
    Notify,      // = prefix
    Console,     // ~ prefix
    Target,      // @ prefix
    Log,         // & prefix
}

impl RecordKind {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '^' => Some(RecordKind::Result),
            '*' => Some(RecordKind::ExecAsync),
            '+' => Some(RecordKind::StatusAsync),
            '=' => Some(RecordKind::Notify),
            '~' => Some(RecordKind::Console),
            '@' => Some(RecordKind::Target),
            '&' => Some(RecordKind::Log),
            _ => None,
        }
    }

    /// Stream records are the human readable "comment" lines.
    pub fn is_stream(&self) -> bool {
        matches!(self, RecordKind::Console | RecordKind::Target | RecordKind::Log)
    }
}

/// One complete MI message: every line up to the prompt, or a lone exit line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Token of the result record, 0 when absent.
    pub id: u32,
    /// Result class (`done`, `error`, `running`, ...) or `None` without a result record.
    pub record_name: Option<String>,
    /// Everything after the first comma of the result record.
    pub record_args: String,
    /// `*` and `+` lines, plus every stream line.
    pub async_outputs: Vec<String>,
    /// `=` lines.
    pub notifications: Vec<String>,
    /// `~`, `@` and `&` lines.
    pub comments: Vec<String>,
}

impl Response {
    /// Whether the message carried a result record at all.
    pub fn has_record(&self) -> bool {
        self.record_name.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.record_name.as_deref() == Some("error")
    }

    pub fn is_exit(&self) -> bool {
        self.record_name.as_deref() == Some("exit")
    }

    /// Parse the record arguments into MI values.
    pub fn results(&self) -> Result<HashMap<String, Value>, String> {
        if self.record_args.is_empty() {
            return Ok(HashMap::new());
        }
        parse_results(&self.record_args)
    }

    /// The `msg` field of an `^error` record.
    pub fn error_message(&self) -> Option<String> {
        if !self.is_error() {
            return None;
        }
        self.results()
            .ok()
            .and_then(|r| r.get("msg").and_then(|v| v.as_string()).map(str::to_string))
    }

    /// Concatenated, unescaped text of all console stream lines.
    pub fn console_text(&self) -> String {
        self.comments
            .iter()
            .filter(|line| line.starts_with('~'))
            .map(|line| {
                let content = &line[1..];
                parse_c_string(content).unwrap_or_else(|| content.to_string())
            })
            .collect()
    }
}

/// A completed message offered to subscribers.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    /// Id and command of the request this message finally completed, if any.
    pub request: Option<(u32, String)>,
    pub response: Response,
}

/// Represents values in GDB/MI output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    List(Vec<Value>),
    Tuple(HashMap<String, Value>),
}

impl Value {
    /// Get the value as a string, if possible
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a list, if possible
    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    /// Get the value as a tuple, if possible
    pub fn as_tuple(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Tuple(tuple) => Some(tuple),
            _ => None,
        }
    }

    /// Follow a dotted path (`bkpt.number`) through nested tuples.
    pub fn lookup<'a>(results: &'a HashMap<String, Value>, path: &str) -> Option<&'a Value> {
        let mut parts = path.split('.');
        let mut current = results.get(parts.next()?)?;
        for part in parts {
            current = current.as_tuple()?.get(part)?;
        }
        Some(current)
    }
}
