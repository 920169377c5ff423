//! Front end: tokeniser, bracket parser, and method-definition builder.
//!
//! Syntax:
//! - `Head args... : body` - a method; ends at a newline outside brackets
//! - `Head args... .` - a fact (empty body)
//! - `?x` - local variable (scoped to the method)
//! - `Uppercase` - state-variable reference (tasks, globals)
//! - `lowercase`, numbers, punctuation - literal tokens / ground values
//! - `[Task args...]` - call
//! - `[= a b]` - unification
//! - `[set Name value]` - dynamic-state assignment
//! - `[first a | b | ...]` / `[random ...]` - branch (empty alternative ok)
//! - `[randomly] [deterministic] [fallible] [main] [weight N]` - leading
//!   method annotations
//! - `#` - comment to end of line
//!
//! Tokenisation: whitespace separates tokens; a newline is itself a token;
//! punctuation other than `?` is a single-character token; `?` may lead a
//! token; `[` and `]` bracket nested tuples.

use crate::error::{ErrorKind, EvalError};
use crate::step::{Link, Step};
use crate::symbol::{NameStore, StateVar};
use crate::task::TaskFlags;
use crate::term::Term;
use smallvec::SmallVec;
use std::sync::Arc;

/// One parsed method definition, ready to install into a module.
#[derive(Debug)]
pub struct Definition {
    pub task: String,
    pub pattern: SmallVec<[Term; 4]>,
    pub locals: Vec<StateVar>,
    pub chain: Link,
    pub flags: TaskFlags,
    pub weight: f64,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    Open,
    Close,
    Newline,
}

#[derive(Debug, Clone)]
struct Lexed {
    tok: Tok,
    line: u32,
}

/// Nested token tree produced by the bracket parser.
#[derive(Debug, Clone)]
enum Tree {
    Leaf(String, u32),
    List(Vec<Tree>, u32),
}

impl Tree {
    fn line(&self) -> u32 {
        match self {
            Tree::Leaf(_, line) | Tree::List(_, line) => *line,
        }
    }

    fn leaf(&self) -> Option<&str> {
        match self {
            Tree::Leaf(w, _) => Some(w.as_str()),
            Tree::List(..) => None,
        }
    }
}

fn syntax_error(message: impl Into<String>, path: &str, line: u32) -> EvalError {
    EvalError::new(ErrorKind::Syntax {
        message: message.into(),
        path: path.to_string(),
        line,
    })
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn tokenize(source: &str) -> Vec<Lexed> {
    let mut out = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1u32;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                chars.next();
                out.push(Lexed {
                    tok: Tok::Newline,
                    line,
                });
                line += 1;
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '[' => {
                chars.next();
                out.push(Lexed {
                    tok: Tok::Open,
                    line,
                });
            }
            ']' => {
                chars.next();
                out.push(Lexed {
                    tok: Tok::Close,
                    line,
                });
            }
            '?' => {
                chars.next();
                let mut word = String::from("?");
                while let Some(&c) = chars.peek() {
                    if is_word_char(c) {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push(Lexed {
                    tok: Tok::Word(word),
                    line,
                });
            }
            c if is_word_char(c) => {
                let numeric = c.is_ascii_digit();
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if is_word_char(c) {
                        word.push(c);
                        chars.next();
                    } else if numeric && c == '.' {
                        // One decimal point inside a digit run.
                        let mut ahead = chars.clone();
                        ahead.next();
                        if !word.contains('.')
                            && ahead.peek().is_some_and(|d| d.is_ascii_digit())
                        {
                            word.push('.');
                            chars.next();
                        } else {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                out.push(Lexed {
                    tok: Tok::Word(word),
                    line,
                });
            }
            _ => {
                chars.next();
                out.push(Lexed {
                    tok: Tok::Word(c.to_string()),
                    line,
                });
            }
        }
    }
    out
}

/// Group tokens into one tree-list per definition. A definition ends at a
/// newline outside brackets; blank lines between definitions are skipped.
fn parse_lines(tokens: &[Lexed], path: &str) -> Result<Vec<Vec<Tree>>, EvalError> {
    let mut lines = Vec::new();
    let mut pos = 0;

    while pos < tokens.len() {
        while pos < tokens.len() && tokens[pos].tok == Tok::Newline {
            pos += 1;
        }
        if pos >= tokens.len() {
            break;
        }

        let mut items = Vec::new();
        while pos < tokens.len() && tokens[pos].tok != Tok::Newline {
            items.push(parse_tree(tokens, &mut pos, path)?);
        }
        lines.push(items);
    }
    Ok(lines)
}

fn parse_tree(tokens: &[Lexed], pos: &mut usize, path: &str) -> Result<Tree, EvalError> {
    let lexed = &tokens[*pos];
    match &lexed.tok {
        Tok::Word(w) => {
            *pos += 1;
            Ok(Tree::Leaf(w.clone(), lexed.line))
        }
        Tok::Open => {
            let open_line = lexed.line;
            *pos += 1;
            let mut items = Vec::new();
            loop {
                // Newlines may appear freely inside brackets.
                while *pos < tokens.len() && tokens[*pos].tok == Tok::Newline {
                    *pos += 1;
                }
                if *pos >= tokens.len() {
                    return Err(syntax_error("unclosed bracket", path, open_line));
                }
                if tokens[*pos].tok == Tok::Close {
                    *pos += 1;
                    return Ok(Tree::List(items, open_line));
                }
                items.push(parse_tree(tokens, pos, path)?);
            }
        }
        Tok::Close => Err(syntax_error("unmatched closing bracket", path, lexed.line)),
        Tok::Newline => Err(syntax_error("unexpected newline", path, lexed.line)),
    }
}

/// Per-definition context: the local-variable slots seen so far.
struct MethodCtx<'a> {
    names: &'a NameStore,
    path: &'a str,
    locals: Vec<StateVar>,
    mention: StateVar,
}

impl<'a> MethodCtx<'a> {
    fn new(names: &'a NameStore, path: &'a str) -> Self {
        Self {
            names,
            path,
            locals: Vec::new(),
            mention: names.intern("Mention"),
        }
    }

    fn local(&mut self, name: &str) -> Term {
        let sv = self.names.intern(name);
        // A bare `?` is anonymous: every occurrence gets its own slot.
        let index = if name.is_empty() {
            self.locals.push(sv);
            self.locals.len() - 1
        } else {
            match self.locals.iter().position(|&n| n == sv) {
                Some(i) => i,
                None => {
                    self.locals.push(sv);
                    self.locals.len() - 1
                }
            }
        };
        Term::Local {
            index: index as u16,
            name: sv,
        }
    }

    /// A word token becomes a term: `?x` a local slot, a number a
    /// `Number`, `true`/`false` a `Bool`, an uppercase-initial identifier
    /// a state-variable reference, anything else a text token.
    fn term_of_word(&mut self, word: &str) -> Term {
        if let Some(name) = word.strip_prefix('?') {
            return self.local(name);
        }
        if let Ok(n) = word.parse::<f64>() {
            if word.chars().next().is_some_and(|c| c.is_ascii_digit() || c == '-') {
                return Term::Number(n);
            }
        }
        match word {
            "true" => return Term::Bool(true),
            "false" => return Term::Bool(false),
            _ => {}
        }
        if word.chars().next().is_some_and(char::is_uppercase) {
            Term::State(self.names.intern(word))
        } else {
            Term::text(word)
        }
    }

    fn term_of_tree(&mut self, tree: &Tree) -> Term {
        match tree {
            Tree::Leaf(w, _) => self.term_of_word(w),
            Tree::List(items, _) => {
                let elems: Vec<Term> = items.iter().map(|t| self.term_of_tree(t)).collect();
                Term::Tuple(elems.into())
            }
        }
    }

    /// Compile a body item list into a step chain, right-to-left.
    fn build_chain(&mut self, items: &[Tree]) -> Result<Link, EvalError> {
        let mut steps = Vec::new();
        for item in items {
            self.build_step(item, &mut steps)?;
        }

        let mut chain: Link = None;
        for step in steps.into_iter().rev() {
            chain = Some(Arc::new(step.into_step(chain)));
        }
        Ok(chain)
    }

    fn build_step(&mut self, item: &Tree, out: &mut Vec<Pending>) -> Result<(), EvalError> {
        match item {
            Tree::Leaf(w, _) => {
                // A variable or state reference in text position is a
                // mention; plain words emit themselves.
                if w.starts_with('?') || w.chars().next().is_some_and(char::is_uppercase) {
                    let arg = self.term_of_word(w);
                    out.push(Pending::Call {
                        task: Term::State(self.mention),
                        args: smallvec::smallvec![arg],
                    });
                } else {
                    let token: Arc<str> = Arc::from(w.as_str());
                    if let Some(Pending::Emit(tokens)) = out.last_mut() {
                        tokens.push(token);
                    } else {
                        out.push(Pending::Emit(smallvec::smallvec![token]));
                    }
                }
                Ok(())
            }
            Tree::List(items, line) => self.build_bracket(items, *line, out),
        }
    }

    fn build_bracket(
        &mut self,
        items: &[Tree],
        line: u32,
        out: &mut Vec<Pending>,
    ) -> Result<(), EvalError> {
        let head = match items.first() {
            Some(t) => t,
            None => return Err(syntax_error("empty brackets", self.path, line)),
        };

        match head.leaf() {
            Some("=") => {
                if items.len() != 3 {
                    return Err(syntax_error(
                        "unification needs exactly two operands",
                        self.path,
                        line,
                    ));
                }
                out.push(Pending::Unify {
                    left: self.term_of_tree(&items[1]),
                    right: self.term_of_tree(&items[2]),
                });
                Ok(())
            }
            Some("set") => {
                if items.len() != 3 {
                    return Err(syntax_error(
                        "set needs a state variable and a value",
                        self.path,
                        line,
                    ));
                }
                let var = match items[1].leaf() {
                    Some(w) if w.chars().next().is_some_and(char::is_uppercase) => {
                        self.names.intern(w)
                    }
                    _ => {
                        return Err(syntax_error(
                            "set target must be a state-variable name",
                            self.path,
                            line,
                        ))
                    }
                };
                out.push(Pending::Set {
                    var,
                    value: self.term_of_tree(&items[2]),
                });
                Ok(())
            }
            Some(kw @ ("first" | "random")) => {
                let mut alternatives = Vec::new();
                let mut current: Vec<Tree> = Vec::new();
                for item in &items[1..] {
                    if item.leaf() == Some("|") {
                        alternatives.push(std::mem::take(&mut current));
                    } else {
                        current.push(item.clone());
                    }
                }
                alternatives.push(current);

                let mut compiled = Vec::new();
                for alt in &alternatives {
                    // An empty alternative is a null branch: continue as-is.
                    compiled.push(if alt.is_empty() {
                        None
                    } else {
                        self.build_chain(alt)?
                    });
                }
                out.push(Pending::Branch {
                    alternatives: compiled,
                    shuffle: kw == "random",
                });
                Ok(())
            }
            _ => {
                let task = self.term_of_tree(head);
                let args = items[1..].iter().map(|t| self.term_of_tree(t)).collect();
                out.push(Pending::Call { task, args });
                Ok(())
            }
        }
    }
}

/// Step under construction; linked into a chain once the whole body has
/// been scanned (consecutive emits merge during the scan).
enum Pending {
    Emit(SmallVec<[Arc<str>; 4]>),
    Call {
        task: Term,
        args: SmallVec<[Term; 4]>,
    },
    Unify {
        left: Term,
        right: Term,
    },
    Set {
        var: StateVar,
        value: Term,
    },
    Branch {
        alternatives: Vec<Link>,
        shuffle: bool,
    },
}

impl Pending {
    fn into_step(self, next: Link) -> Step {
        match self {
            Pending::Emit(tokens) => Step::Emit { tokens, next },
            Pending::Call { task, args } => Step::Call { task, args, next },
            Pending::Unify { left, right } => Step::Unify { left, right, next },
            Pending::Set { var, value } => Step::Set { var, value, next },
            Pending::Branch {
                alternatives,
                shuffle,
            } => Step::Branch {
                alternatives,
                shuffle,
                next,
            },
        }
    }
}

/// Leading bracket annotations: flags and method weight.
fn parse_annotations(
    items: &[Tree],
    path: &str,
) -> Result<(usize, TaskFlags, f64, bool), EvalError> {
    let mut consumed = 0;
    let mut flags = TaskFlags::empty();
    let mut weight = 1.0;
    let mut deterministic = false;

    for item in items {
        let Tree::List(inner, line) = item else { break };
        let Some(keyword) = inner.first().and_then(Tree::leaf) else {
            break;
        };
        match keyword {
            "randomly" => flags.insert(TaskFlags::SHUFFLE),
            "fallible" => flags.insert(TaskFlags::FALLIBLE),
            "main" => flags.insert(TaskFlags::MAIN),
            "deterministic" => deterministic = true,
            "weight" => {
                let value = inner
                    .get(1)
                    .and_then(Tree::leaf)
                    .and_then(|w| w.parse::<f64>().ok());
                match value {
                    Some(w) if w > 0.0 => weight = w,
                    _ => {
                        return Err(syntax_error(
                            "weight needs a positive number",
                            path,
                            *line,
                        ))
                    }
                }
            }
            _ => break,
        }
        consumed += 1;
    }
    Ok((consumed, flags, weight, deterministic))
}

/// Parse a source into method definitions.
///
/// Unannotated methods are marked `MULTIPLE_SOLUTIONS`, so an ordinary
/// task backtracks into its later methods; `[deterministic]` suppresses
/// the mark while keeping the flag algebra monotonic.
pub fn parse_program(
    source: &str,
    path: &str,
    names: &NameStore,
) -> Result<Vec<Definition>, EvalError> {
    let tokens = tokenize(source);
    let lines = parse_lines(&tokens, path)?;

    let mut definitions = Vec::new();
    for items in lines {
        let Some(first) = items.first() else { continue };
        let line = first.line();

        let (consumed, mut flags, weight, deterministic) = parse_annotations(&items, path)?;
        if !deterministic {
            flags.insert(TaskFlags::MULTIPLE_SOLUTIONS);
        }
        let items = &items[consumed..];

        let colon = items.iter().position(|t| t.leaf() == Some(":"));
        let (head, body): (&[Tree], &[Tree]) = match colon {
            Some(i) => (&items[..i], &items[i + 1..]),
            None => {
                // A fact: the head alone, closed by a period.
                if items.last().and_then(Tree::leaf) == Some(".") {
                    (&items[..items.len() - 1], &[])
                } else {
                    return Err(syntax_error(
                        "a definition needs ':' or a closing '.'",
                        path,
                        line,
                    ));
                }
            }
        };

        let Some(task) = head.first().and_then(Tree::leaf) else {
            return Err(syntax_error("missing task name", path, line));
        };
        if task.starts_with('?') || !task.chars().next().is_some_and(is_word_char) {
            return Err(syntax_error(
                format!("'{}' cannot name a task", task),
                path,
                line,
            ));
        }

        let mut ctx = MethodCtx::new(names, path);
        let pattern: SmallVec<[Term; 4]> =
            head[1..].iter().map(|t| ctx.term_of_tree(t)).collect();
        let chain = ctx.build_chain(body)?;

        definitions.push(Definition {
            task: task.to_string(),
            pattern,
            locals: ctx.locals,
            chain,
            flags,
            weight,
            line,
        });
    }
    Ok(definitions)
}
