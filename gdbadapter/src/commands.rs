/// GDB command construction and reply decoding
///
/// [`Commands`] builds requests for the operations a target debugging session
/// needs, checking each against the instruction table before it can be sent.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::instructions::InstructionTable;
use crate::parser::parse_c_string;
use crate::request::{Request, RequestGroup, RequestIds};
use crate::types::{Response, Value as GdbValue};
use crate::{GdbError, Result};

/// Request factory bound to one session's id source
#[derive(Debug, Clone)]
pub struct Commands {
    ids: RequestIds,
    table: &'static InstructionTable,
}

impl Commands {
    pub fn new(ids: RequestIds) -> Self {
        Self {
            ids,
            table: InstructionTable::builtin(),
        }
    }

    /// Build a request for any command the table recognizes.
    pub fn command(&self, command: &str) -> Result<Request> {
        self.table.lookup(command)?;
        Ok(Request::new(&self.ids, command.trim()))
    }

    /// Read the fields the table's recipe names from the reply to `command`.
    pub fn extract(&self, command: &str, response: &Response) -> Result<Vec<String>> {
        let lookup = self.table.lookup(command)?;
        lookup.instruction.extract(response, lookup.parameter.as_deref())
    }

    pub fn version(&self) -> Result<Request> {
        self.command("gdb-version")
    }

    pub fn exit(&self) -> Result<Request> {
        self.command("gdb-exit")
    }

    /// Connect to the pdebug agent on the target.
    pub fn target_select_qnx(&self, host: &str, port: u16, retries: u32) -> Result<Request> {
        Ok(self
            .command(&format!("target-select qnx {}:{}", host, port))?
            .with_retries(retries))
    }

    pub fn break_insert(&self, location: &str) -> Result<Request> {
        self.command(&format!("break-insert {}", location))
    }

    pub fn break_delete(&self, number: u32) -> Result<Request> {
        self.command(&format!("break-delete {}", number))
    }

    pub fn exec_continue(&self) -> Result<Request> {
        self.command("exec-continue")
    }

    pub fn exec_interrupt(&self) -> Result<Request> {
        self.command("exec-interrupt")
    }

    /// `info pidlist` through the console interpreter; parse with [`ProcessInfo::parse_list`].
    pub fn process_list(&self) -> Result<Request> {
        self.command("interpreter-exec console \"info pidlist\"")
    }

    /// Load symbols for `executable`, then attach to `pid`.
    pub fn attach(&self, executable: &str, pid: u32) -> Result<RequestGroup> {
        RequestGroup::new(vec![
            self.command(&format!("file-exec-and-symbols \"{}\"", executable))?,
            self.command(&format!("target-attach {}", pid))?,
        ])
    }
}

/// A process running on the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub executable: String,
}

fn pidlist_line() -> Option<&'static Regex> {
    static LINE: OnceLock<Option<Regex>> = OnceLock::new();
    LINE.get_or_init(|| Regex::new(r"^(?P<path>.+) - (?P<pid>\d+)(?:/\d+)?\s*$").ok())
        .as_ref()
}

impl ProcessInfo {
    pub fn new(pid: u32, executable: impl Into<String>) -> Self {
        Self {
            pid,
            executable: executable.into(),
        }
    }

    /// Last path component, ignoring a trailing separator.
    pub fn name(&self) -> &str {
        let trimmed = self.executable.trim_end_matches(['/', '\\']);
        trimmed
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(trimmed)
    }

    /// Parse the console output of `info pidlist`: `path - pid/tid` per thread.
    ///
    /// Each pid is reported once, with the path of its first line.
    pub fn parse_list(response: &Response) -> Vec<ProcessInfo> {
        let mut processes: Vec<ProcessInfo> = Vec::new();
        let Some(pattern) = pidlist_line() else {
            return processes;
        };

        for comment in &response.comments {
            let text = match comment.strip_prefix('~') {
                Some(quoted) => parse_c_string(quoted).unwrap_or_else(|| quoted.to_string()),
                None => continue,
            };

            for line in text.lines() {
                let Some(captures) = pattern.captures(line) else {
                    continue;
                };
                let Ok(pid) = captures["pid"].parse::<u32>() else {
                    continue;
                };
                if processes.iter().any(|p| p.pid == pid) {
                    continue;
                }
                processes.push(ProcessInfo::new(pid, captures["path"].trim()));
            }
        }

        processes
    }

    /// Find by full path or by executable name.
    pub fn find<'a>(processes: &'a [ProcessInfo], executable: &str) -> Option<&'a ProcessInfo> {
        processes
            .iter()
            .find(|p| p.executable == executable)
            .or_else(|| processes.iter().find(|p| p.name() == executable))
    }
}

/// Represents a breakpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub number: u32,
    pub enabled: bool,
    pub addr: Option<String>,
    pub func: Option<String>,
    pub file: Option<String>,
    pub fullname: Option<String>,
    pub line: Option<u32>,
    pub times: u32,
}

impl Breakpoint {
    /// Decode the `bkpt` tuple of a `break-insert` reply.
    pub fn from_response(response: &Response) -> Result<Self> {
        let malformed = || GdbError::Format {
            line: response.record_args.clone(),
        };
        let results = response.results().map_err(|_| malformed())?;
        let tuple = results
            .get("bkpt")
            .and_then(GdbValue::as_tuple)
            .ok_or_else(malformed)?;
        Self::from_tuple(tuple).ok_or_else(malformed)
    }

    pub fn from_tuple(tuple: &HashMap<String, GdbValue>) -> Option<Self> {
        let field = |name: &str| tuple.get(name).and_then(|v| v.as_string());
        let owned = |name: &str| field(name).map(str::to_string);

        Some(Breakpoint {
            number: field("number")?.parse().ok()?,
            enabled: field("enabled").map_or(false, |s| s == "y"),
            addr: owned("addr"),
            func: owned("func"),
            file: owned("file"),
            fullname: owned("fullname"),
            line: field("line").and_then(|s| s.parse().ok()),
            times: field("times").and_then(|s| s.parse().ok()).unwrap_or(0),
        })
    }
}
