//! GDB/MI output parser
//!
//! This module assembles the lines of one MI message into a [`Response`] and
//! parses result-record arguments into structured data.

use crate::types::*;
use crate::{GdbError, Result};
use std::collections::HashMap;

/// Split a line into its numeric token and its classifier.
///
/// Returns the byte offset of the classifier character as well.
pub fn classify_line(line: &str) -> Result<(Option<&str>, RecordKind, usize)> {
    let pos = line
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| GdbError::Format { line: line.to_string() })?;

    let kind = line[pos..]
        .chars()
        .next()
        .and_then(RecordKind::from_char)
        .ok_or_else(|| GdbError::Format { line: line.to_string() })?;

    let token = if pos == 0 { None } else { Some(&line[..pos]) };
    Ok((token, kind, pos))
}

/// Assemble one message from the lines collected since the previous prompt.
pub fn parse_response<S: AsRef<str>>(lines: &[S]) -> Result<Response> {
    let mut record: Option<(u32, String, String)> = None;
    let mut async_outputs = Vec::new();
    let mut notifications = Vec::new();
    let mut comments = Vec::new();

    for line in lines {
        let line = line.as_ref();
        let (token, kind, pos) = classify_line(line)?;

        match kind {
            RecordKind::Result => {
                if record.is_some() {
                    return Err(GdbError::Format { line: line.to_string() });
                }
                let mut body = &line[pos + 1..];
                // the token may also trail the classifier (`^1done`)
                let token = token.or_else(|| {
                    let digits = body.find(|c: char| !c.is_ascii_digit()).unwrap_or(body.len());
                    let (token, rest) = body.split_at(digits);
                    body = rest;
                    (!token.is_empty()).then_some(token)
                });
                let id = match token {
                    Some(token) => token
                        .parse::<u32>()
                        .map_err(|_| GdbError::Format { line: line.to_string() })?,
                    None => 0,
                };
                let (name, args) = match body.split_once(',') {
                    Some((name, args)) => (name, args),
                    None => (body, ""),
                };
                record = Some((id, name.to_string(), args.to_string()));
            }
            RecordKind::Notify => {
                notifications.push(line.to_string());
            }
            kind => {
                if kind.is_stream() {
                    comments.push(line.to_string());
                }
                async_outputs.push(line.to_string());
            }
        }
    }

    let (id, record_name, record_args) = match record {
        Some((id, name, args)) => (id, Some(name), args),
        None => (0, None, String::new()),
    };

    Ok(Response {
        id,
        record_name,
        record_args,
        async_outputs,
        notifications,
        comments,
    })
}

/// Parse result key-value pairs
pub fn parse_results(input: &str) -> std::result::Result<HashMap<String, Value>, String> {
    let mut results = HashMap::new();
    let mut chars = input.chars().peekable();

    while chars.peek().is_some() {
        // Skip whitespace
        while chars.peek() == Some(&' ') {
            chars.next();
        }

        if chars.peek().is_none() {
            break;
        }

        let key = parse_identifier(&mut chars)?;

        if chars.next() != Some('=') {
            return Err(format!("Expected '=' after key '{}'", key));
        }

        let value = parse_value(&mut chars)?;
        results.insert(key, value);

        if chars.peek() == Some(&',') {
            chars.next();
        }
    }

    Ok(results)
}

/// Parse an identifier (key name)
fn parse_identifier(chars: &mut std::iter::Peekable<std::str::Chars>) -> std::result::Result<String, String> {
    let mut identifier = String::new();

    while let Some(&ch) = chars.peek() {
        if ch.is_alphanumeric() || ch == '_' || ch == '-' {
            identifier.push(ch);
            chars.next();
        } else {
            break;
        }
    }

    if identifier.is_empty() {
        return Err("Empty identifier".into());
    }

    Ok(identifier)
}

/// Parse a value (string, list, or tuple)
fn parse_value(chars: &mut std::iter::Peekable<std::str::Chars>) -> std::result::Result<Value, String> {
    match chars.peek() {
        Some('"') => {
            chars.next();
            let mut string_val = String::new();
            let mut escaped = false;
            let mut closed = false;

            for ch in chars.by_ref() {
                if escaped {
                    push_escaped(&mut string_val, ch);
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '"' {
                    closed = true;
                    break;
                } else {
                    string_val.push(ch);
                }
            }

            if !closed {
                return Err("Unterminated string".into());
            }
            Ok(Value::String(string_val))
        }
        Some('[') => {
            chars.next();
            let mut list = Vec::new();

            while chars.peek() != Some(&']') && chars.peek().is_some() {
                // lists may hold bare values or key=value results
                let value = if matches!(chars.peek(), Some('"') | Some('[') | Some('{')) {
                    parse_value(chars)?
                } else {
                    let key = parse_identifier(chars)?;
                    if chars.next() != Some('=') {
                        return Err("Expected '=' in list".into());
                    }
                    let mut single = HashMap::new();
                    single.insert(key, parse_value(chars)?);
                    Value::Tuple(single)
                };
                list.push(value);

                if chars.peek() == Some(&',') {
                    chars.next();
                }
            }

            if chars.next() != Some(']') {
                return Err("Expected closing bracket".into());
            }

            Ok(Value::List(list))
        }
        Some('{') => {
            chars.next();
            let mut tuple = HashMap::new();

            while chars.peek() != Some(&'}') && chars.peek().is_some() {
                let key = parse_identifier(chars)?;

                if chars.next() != Some('=') {
                    return Err("Expected '=' in tuple".into());
                }

                let value = parse_value(chars)?;
                tuple.insert(key, value);

                if chars.peek() == Some(&',') {
                    chars.next();
                }
            }

            if chars.next() != Some('}') {
                return Err("Expected closing brace".into());
            }

            Ok(Value::Tuple(tuple))
        }
        _ => {
            // unquoted value runs until a separator
            let mut string_val = String::new();

            while let Some(&ch) = chars.peek() {
                if ch == ',' || ch == ']' || ch == '}' || ch == ' ' {
                    break;
                }
                string_val.push(ch);
                chars.next();
            }

            if string_val.is_empty() {
                return Err("Empty value".into());
            }

            Ok(Value::String(string_val))
        }
    }
}

fn push_escaped(out: &mut String, ch: char) {
    match ch {
        'n' => out.push('\n'),
        't' => out.push('\t'),
        'r' => out.push('\r'),
        '\\' => out.push('\\'),
        '"' => out.push('"'),
        other => {
            out.push('\\');
            out.push(other);
        }
    }
}

/// Parse a C-style string (removes quotes and handles escape sequences)
pub fn parse_c_string(input: &str) -> Option<String> {
    if input.len() < 2 || !input.starts_with('"') || !input.ends_with('"') {
        return None;
    }

    let content = &input[1..input.len() - 1];
    let mut result = String::new();
    let mut chars = content.chars();

    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some(next) => push_escaped(&mut result, next),
                None => result.push('\\'),
            }
        } else {
            result.push(ch);
        }
    }

    Some(result)
}
