use crate::symbol::{NameStore, StateVar};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::primitives::Primitive;
use crate::task::CompoundTask;

/// Stable identity of a logic variable.
pub type VarId = u64;

/// Counter for allocating fresh logic variables.
static NEXT_VAR: AtomicU64 = AtomicU64::new(0);

/// A logic variable: a stable fresh identity plus an optional display name.
///
/// A variable never carries its binding; bindings live in the ambient
/// trail. Equality is by identity, so two variables with the same display
/// name are still distinct.
#[derive(Debug, Clone, Copy)]
pub struct LogicVar {
    id: VarId,
    name: Option<StateVar>,
}

impl LogicVar {
    /// Allocate a fresh variable, optionally carrying a display name.
    pub fn fresh(name: Option<StateVar>) -> Self {
        Self {
            id: NEXT_VAR.fetch_add(1, Ordering::Relaxed),
            name,
        }
    }

    /// The variable's stable identity.
    pub fn id(self) -> VarId {
        self.id
    }

    /// The variable's display name, if it has one.
    pub fn name(self) -> Option<StateVar> {
        self.name
    }
}

impl PartialEq for LogicVar {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LogicVar {}

impl std::hash::Hash for LogicVar {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A term of the language.
///
/// Ground values (`Text`, `Number`, `Bool`, `Pair`) compare structurally.
/// `Var` compares by identity, `State` by interned name, and `Task` /
/// `Primitive` by pointer identity. `Local` is a method-local placeholder:
/// it only appears in stored method bodies and patterns, and is replaced by
/// a fresh `Var` on each activation.
#[derive(Debug, Clone)]
pub enum Term {
    /// A text token.
    Text(Arc<str>),
    /// A number. Prints without a trailing `.0` when integral.
    Number(f64),
    /// A boolean.
    Bool(bool),
    /// A tagged list cell.
    Pair(Arc<(Term, Term)>),
    /// A heterogeneous tuple.
    Tuple(Arc<[Term]>),
    /// A logic variable, fresh per method activation.
    Var(LogicVar),
    /// A method-local placeholder slot, resolved against the active frame.
    Local { index: u16, name: StateVar },
    /// A named, module-global state variable.
    State(StateVar),
    /// A user-defined task value.
    Task(Arc<CompoundTask>),
    /// A host-supplied callable value.
    Primitive(Primitive),
}

impl Term {
    /// Build a text term from a token.
    pub fn text(s: &str) -> Self {
        Term::Text(Arc::from(s))
    }

    /// Build a tuple term from its elements.
    pub fn tuple(elems: impl Into<Arc<[Term]>>) -> Self {
        Term::Tuple(elems.into())
    }

    /// Build a pair (tagged list cell).
    pub fn pair(car: Term, cdr: Term) -> Self {
        Term::Pair(Arc::new((car, cdr)))
    }

    /// True for terms that contain no variables or placeholders at the top
    /// level of their structure.
    pub fn is_ground(&self) -> bool {
        match self {
            Term::Text(_) | Term::Number(_) | Term::Bool(_) => true,
            Term::Pair(p) => p.0.is_ground() && p.1.is_ground(),
            Term::Tuple(ts) => ts.iter().all(Term::is_ground),
            Term::Var(_) | Term::Local { .. } | Term::State(_) => false,
            Term::Task(_) | Term::Primitive(_) => true,
        }
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Term::Text(a), Term::Text(b)) => a == b,
            (Term::Number(a), Term::Number(b)) => a == b,
            (Term::Bool(a), Term::Bool(b)) => a == b,
            (Term::Pair(a), Term::Pair(b)) => a == b,
            (Term::Tuple(a), Term::Tuple(b)) => a == b,
            (Term::Var(a), Term::Var(b)) => a == b,
            (Term::Local { index: a, .. }, Term::Local { index: b, .. }) => a == b,
            (Term::State(a), Term::State(b)) => a == b,
            (Term::Task(a), Term::Task(b)) => Arc::ptr_eq(a, b),
            (Term::Primitive(a), Term::Primitive(b)) => a.same(b),
            _ => false,
        }
    }
}

/// Render a number the way the language prints it: integral values without
/// a fractional part.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Render a term for diagnostics and output.
///
/// Unbound variables render as `?name` (or `?_id` when anonymous), state
/// variables by their interned name, tuples in brackets.
pub fn format_term(term: &Term, names: &NameStore) -> String {
    let mut out = String::new();
    render(term, names, &mut out);
    out
}

fn render(term: &Term, names: &NameStore, out: &mut String) {
    match term {
        Term::Text(s) => out.push_str(s),
        Term::Number(n) => out.push_str(&format_number(*n)),
        Term::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Term::Pair(p) => {
            out.push('[');
            render(&p.0, names, out);
            out.push_str(" . ");
            render(&p.1, names, out);
            out.push(']');
        }
        Term::Tuple(ts) => {
            out.push('[');
            for (i, t) in ts.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                render(t, names, out);
            }
            out.push(']');
        }
        Term::Var(v) => {
            out.push('?');
            match v.name().and_then(|n| names.resolve(n).map(str::to_owned)) {
                Some(name) => out.push_str(&name),
                None => out.push_str(&format!("_{}", v.id())),
            }
        }
        Term::Local { name, .. } => {
            out.push('?');
            out.push_str(names.resolve(*name).unwrap_or("_"));
        }
        Term::State(sv) => out.push_str(names.resolve(*sv).unwrap_or("<unknown>")),
        Term::Task(t) => {
            out.push_str(names.resolve(t.name()).unwrap_or("<task>"));
        }
        Term::Primitive(p) => out.push_str(p.name()),
    }
}

/// Conversion out of a final term, used by `call_function`.
///
/// `expected()` names the type for `ArgumentType` diagnostics.
pub trait FromTerm: Sized {
    fn from_term(term: &Term) -> Option<Self>;
    fn expected() -> &'static str;
}

impl FromTerm for i64 {
    fn from_term(term: &Term) -> Option<Self> {
        match term {
            Term::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            _ => None,
        }
    }

    fn expected() -> &'static str {
        "integer"
    }
}

impl FromTerm for f64 {
    fn from_term(term: &Term) -> Option<Self> {
        match term {
            Term::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn expected() -> &'static str {
        "number"
    }
}

impl FromTerm for bool {
    fn from_term(term: &Term) -> Option<Self> {
        match term {
            Term::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn expected() -> &'static str {
        "boolean"
    }
}

impl FromTerm for String {
    fn from_term(term: &Term) -> Option<Self> {
        match term {
            Term::Text(s) => Some(s.to_string()),
            _ => None,
        }
    }

    fn expected() -> &'static str {
        "text"
    }
}

impl FromTerm for Term {
    fn from_term(term: &Term) -> Option<Self> {
        Some(term.clone())
    }

    fn expected() -> &'static str {
        "term"
    }
}
