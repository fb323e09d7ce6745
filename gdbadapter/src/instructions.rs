//! Command-to-recipe lookup table
//!
//! Each line of the table has the form `[$]command:->:recipe`. A leading `$`
//! keeps the command's trailing parameters for the recipe. A recipe is a
//! `;`-separated list of dotted paths into the result record.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::types::{Response, Value};
use crate::{GdbError, Result};

const DEFAULT_INSTRUCTIONS: &str = include_str!("../resources/instructions.txt");
const SEPARATOR: &str = ":->:";

/// A single recognized command and how to read its reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub id: usize,
    pub command: String,
    pub expects_parameter: bool,
    pub recipe: String,
}

impl Instruction {
    /// Load an instruction from one table line.
    pub fn load(id: usize, line: &str) -> Option<Self> {
        let (head, recipe) = line.split_once(SEPARATOR)?;
        let (command, expects_parameter) = match head.strip_prefix('$') {
            Some(command) => (command, true),
            None => (head, false),
        };
        let command = command.trim();
        if command.is_empty() || command.contains(' ') {
            return None;
        }

        Some(Instruction {
            id,
            command: command.to_string(),
            expects_parameter,
            recipe: recipe.trim().to_string(),
        })
    }

    /// Evaluate the recipe against a response.
    ///
    /// Missing paths yield empty fields; a retained parameter is appended last.
    pub fn extract(&self, response: &Response, parameter: Option<&str>) -> Result<Vec<String>> {
        let results = response.results().map_err(|_| GdbError::Format {
            line: response.record_args.clone(),
        })?;

        let mut fields: Vec<String> = self
            .recipe
            .split(';')
            .filter(|path| !path.is_empty())
            .map(|path| match Value::lookup(&results, path) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::List(items)) => items.len().to_string(),
                Some(Value::Tuple(_)) => path.to_string(),
                None => String::new(),
            })
            .collect();

        if let Some(parameter) = parameter {
            fields.push(parameter.to_string());
        }
        Ok(fields)
    }
}

/// Result of a successful lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup<'a> {
    pub instruction: &'a Instruction,
    /// Trailing text with spaces replaced by `;`, kept only for `$` instructions.
    pub parameter: Option<String>,
}

/// Immutable command table, loaded once.
#[derive(Debug, Clone, Default)]
pub struct InstructionTable {
    items: Vec<Instruction>,
    by_command: HashMap<String, usize>,
}

impl InstructionTable {
    /// Build the table from text content, one instruction per line.
    pub fn load(content: &str) -> Self {
        let mut items = Vec::new();
        let mut by_command = HashMap::new();

        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match Instruction::load(items.len(), line) {
                Some(instruction) => {
                    by_command.insert(instruction.command.clone(), items.len());
                    items.push(instruction);
                }
                None => log::warn!("Unable to load instruction from line: \"{}\"", line),
            }
        }

        log::debug!("Loaded {} GDB instructions", items.len());
        Self { items, by_command }
    }

    /// The table shipped with the crate.
    pub fn builtin() -> &'static InstructionTable {
        static TABLE: OnceLock<InstructionTable> = OnceLock::new();
        TABLE.get_or_init(|| InstructionTable::load(DEFAULT_INSTRUCTIONS))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Find the instruction for a command, splitting off its parameters.
    pub fn lookup(&self, command: &str) -> Result<Lookup<'_>> {
        let command = command.trim();
        let (prefix, rest) = match command.split_once(' ') {
            Some((prefix, rest)) => (prefix, Some(rest)),
            None => (command, None),
        };

        let instruction = self
            .by_command
            .get(prefix)
            .map(|&index| &self.items[index])
            .ok_or_else(|| GdbError::UnrecognizedCommand(command.to_string()))?;

        let parameter = if instruction.expects_parameter {
            rest.map(|rest| rest.replace(' ', ";"))
        } else {
            None
        };

        Ok(Lookup { instruction, parameter })
    }
}
