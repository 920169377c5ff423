//! Repl - line-oriented command processor for the CLI.
//!
//! Supports:
//! - `load <file>` to load `.step` definitions
//! - `call <Task> [args...]` to run a task
//! - a direct definition line (`Head: body` or `Head args.`)
//! - `run <code>` to execute a body without naming a task
//! - `state` to show the accumulated dynamic state
//! - `list`, `help`, `quit`/`exit`

use crate::bindings::State;
use crate::module::Module;
use crate::term::{format_term, Term};
use std::path::Path;
use std::sync::Arc;

/// REPL state: a module plus the dynamic state carried across commands.
pub struct Repl {
    module: Arc<Module>,
    state: State,
    /// Task names defined through this REPL, for `list`.
    defined: Vec<String>,
}

impl Repl {
    pub fn new() -> Self {
        Self {
            module: Module::new(),
            state: State::empty(),
            defined: Vec::new(),
        }
    }

    /// Process one input line. `Ok(Some(text))` is output to display,
    /// `Ok(None)` is silence, and `Err("quit")` ends the session.
    pub fn process_input(&mut self, input: &str) -> Result<Option<String>, String> {
        let line = input.trim();

        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        if line == "help" {
            return Ok(Some(self.help_text()));
        }

        if line == "quit" || line == "exit" {
            return Err("quit".to_string());
        }

        if line == "list" {
            if self.defined.is_empty() {
                return Ok(Some("No tasks defined.".to_string()));
            }
            return Ok(Some(self.defined.join("\n")));
        }

        if line == "state" {
            return Ok(Some(self.render_state()));
        }

        if let Some(path) = line.strip_prefix("load ") {
            return self.load_file(path.trim());
        }

        if let Some(rest) = line.strip_prefix("call ") {
            return self.call_task(rest.trim());
        }

        if let Some(code) = line.strip_prefix("run ") {
            return match self.module.parse_and_execute(code) {
                Ok((Some(text), state)) => {
                    self.state = state;
                    Ok(Some(text))
                }
                Ok((None, _)) => Ok(Some("No.".to_string())),
                Err(e) => Err(e.to_string()),
            };
        }

        // Anything else is a definition.
        match self.module.add_definitions(&[line]) {
            Ok(()) => {
                if let Some(name) = line.split(|c| c == ' ' || c == ':' || c == '.').next() {
                    if !name.is_empty() && !self.defined.iter().any(|d| d == name) {
                        self.defined.push(name.to_string());
                    }
                }
                Ok(None)
            }
            Err(e) => Err(e.to_string()),
        }
    }

    fn load_file(&mut self, path: &str) -> Result<Option<String>, String> {
        self.module
            .load_definitions(Path::new(path))
            .map_err(|e| e.to_string())?;
        Ok(Some(format!("Loaded {}", path)))
    }

    fn call_task(&mut self, input: &str) -> Result<Option<String>, String> {
        let mut parts = input.split_whitespace();
        let Some(task) = parts.next() else {
            return Err("Usage: call <Task> [args...]".to_string());
        };
        let args: Vec<Term> = parts.map(parse_arg).collect();

        match self.module.call(&self.state, task, &args) {
            Ok((Some(text), state)) => {
                self.state = state;
                Ok(Some(text))
            }
            Ok((None, _)) => Ok(Some("No.".to_string())),
            Err(e) => Err(e.to_string()),
        }
    }

    fn render_state(&self) -> String {
        if self.state.is_empty() {
            return "State is empty.".to_string();
        }
        let names = self.module.names();
        self.state
            .effective()
            .iter()
            .map(|(sv, value)| {
                format!(
                    "{} = {}",
                    names.resolve(*sv).unwrap_or("?"),
                    format_term(value, names)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn help_text(&self) -> String {
        [
            "Commands:",
            "  load <file>          Load .step definitions",
            "  call <Task> [args]   Call a task with literal arguments",
            "  run <code>           Execute a body directly",
            "  <Head>: <body>       Define a method",
            "  list                 List tasks defined here",
            "  state                Show the dynamic state",
            "  quit / exit          Leave",
        ]
        .join("\n")
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a command-line argument the way the language would: numbers and
/// booleans become ground values, everything else is text.
fn parse_arg(word: &str) -> Term {
    if let Ok(n) = word.parse::<f64>() {
        if word.chars().next().is_some_and(|c| c.is_ascii_digit() || c == '-') {
            return Term::Number(n);
        }
    }
    match word {
        "true" => Term::Bool(true),
        "false" => Term::Bool(false),
        _ => Term::text(word),
    }
}
