use crate::bindings::{State, Trail};
use crate::module::Module;
use crate::symbol::{NameStore, StateVar};
use crate::task::Method;
use crate::term::{format_term, LogicVar, Term};
use crate::unify::copy_term;
use smallvec::SmallVec;
use std::sync::Arc;

/// One active method activation, chained through `parent` for source-level
/// stack traces. Diagnostics only: proof-search correctness never reads the
/// frame chain.
#[derive(Debug)]
pub struct Frame {
    /// The method whose chain is running.
    pub method: Arc<Method>,
    /// The call's resolved argument list.
    pub args: SmallVec<[Term; 4]>,
    /// Fresh logic variables allocated for the method's local slots.
    pub locals: SmallVec<[LogicVar; 8]>,
    /// The caller's frame.
    pub parent: Option<Arc<Frame>>,
    /// Trail as it stood when the frame was entered; used to render
    /// arguments in stack traces.
    pub trail_at_entry: Trail,
}

impl Frame {
    /// Render this frame as a source-level call, e.g. `[Greet ?who]`.
    pub fn render(&self, names: &NameStore) -> String {
        let mut out = String::from("[");
        out.push_str(names.resolve(self.method.task_name()).unwrap_or("<task>"));
        for arg in &self.args {
            out.push(' ');
            out.push_str(&format_term(&copy_term(arg, &self.trail_at_entry), names));
        }
        out.push(']');
        out
    }
}

/// Render a frame chain innermost-first, for attaching to errors.
pub fn stack_trace(frame: &Option<Arc<Frame>>, names: &NameStore) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = frame.clone();
    while let Some(f) = current {
        out.push(f.render(names));
        current = f.parent.clone();
    }
    out
}

/// The binding environment: a cheap handle carrying the module, the active
/// frame, the local trail, and the dynamic state. Cloning is four handle
/// copies; persistent lists make older environments safe to retain across
/// backtracking.
#[derive(Clone)]
pub struct Env {
    pub module: Arc<Module>,
    pub frame: Option<Arc<Frame>>,
    pub trail: Trail,
    pub state: State,
}

impl Env {
    /// Root environment for a top-level call.
    pub fn new(module: Arc<Module>, state: State) -> Self {
        Self {
            module,
            frame: None,
            trail: Trail::empty(),
            state,
        }
    }

    /// Non-destructive local binding.
    pub fn extend(&self, var: LogicVar, value: Term) -> Self {
        Self {
            trail: self.trail.bind(var, value),
            ..self.clone()
        }
    }

    /// Non-destructive dynamic-state binding.
    pub fn bind_state(&self, var: StateVar, value: Term) -> Self {
        Self {
            state: self.state.bind(var, value),
            ..self.clone()
        }
    }

    /// Swap in a new trail (after unification succeeded).
    pub fn with_trail(&self, trail: Trail) -> Self {
        Self {
            trail,
            ..self.clone()
        }
    }

    /// Swap in a new active frame.
    pub fn with_frame(&self, frame: Option<Arc<Frame>>) -> Self {
        Self {
            frame,
            ..self.clone()
        }
    }

    /// The module's name store.
    pub fn names(&self) -> &NameStore {
        self.module.names()
    }

    /// Fully resolve a term: activate local placeholders against the
    /// current frame, then substitute bound variables recursively. An
    /// unbound variable survives as itself.
    pub fn resolve(&self, term: &Term) -> Term {
        copy_term(&activate(term, &self.frame), &self.trail)
    }

    /// Elementwise resolve.
    pub fn resolve_all(&self, terms: &[Term]) -> SmallVec<[Term; 4]> {
        terms.iter().map(|t| self.resolve(t)).collect()
    }

    /// Render the current frame chain for error reporting.
    pub fn stack_trace(&self) -> Vec<String> {
        stack_trace(&self.frame, self.names())
    }
}

/// Replace method-local placeholder slots by the activation's fresh logic
/// variables. A placeholder with no matching frame slot is left inert; it
/// can only arise from a malformed chain and renders as `?name`.
pub fn activate(term: &Term, frame: &Option<Arc<Frame>>) -> Term {
    match term {
        Term::Local { index, .. } => match frame
            .as_ref()
            .and_then(|f| f.locals.get(*index as usize))
        {
            Some(var) => Term::Var(*var),
            None => term.clone(),
        },
        Term::Tuple(ts) => {
            let copied: Vec<Term> = ts.iter().map(|t| activate(t, frame)).collect();
            Term::Tuple(copied.into())
        }
        Term::Pair(p) => Term::pair(activate(&p.0, frame), activate(&p.1, frame)),
        _ => term.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;

    fn test_env() -> Env {
        let module = Module::new();
        Env::new(module, State::empty())
    }

    // ========== ENV EXTENSION ==========

    #[test]
    fn extend_is_non_destructive() {
        let env = test_env();
        let v = LogicVar::fresh(None);
        let ext = env.extend(v, Term::text("a"));
        assert!(env.trail.lookup(&v).is_none());
        assert_eq!(ext.trail.lookup(&v), Some(&Term::text("a")));
    }

    #[test]
    fn bind_state_is_non_destructive() {
        let env = test_env();
        let sv = env.names().intern("Topic");
        let ext = env.bind_state(sv, Term::text("cats"));
        assert!(env.state.lookup(&sv).is_none());
        assert_eq!(ext.state.lookup(&sv), Some(&Term::text("cats")));
    }

    #[test]
    fn resolve_follows_trail() {
        let env = test_env();
        let v = LogicVar::fresh(None);
        let env = env.extend(v, Term::Number(7.0));
        assert_eq!(env.resolve(&Term::Var(v)), Term::Number(7.0));
    }

    #[test]
    fn resolve_keeps_unbound() {
        let env = test_env();
        let v = LogicVar::fresh(None);
        assert_eq!(env.resolve(&Term::Var(v)), Term::Var(v));
    }

    // ========== LOCAL ACTIVATION ==========

    #[test]
    fn activate_without_frame_is_inert() {
        let names = NameStore::new();
        let t = Term::Local {
            index: 0,
            name: names.intern("x"),
        };
        assert_eq!(activate(&t, &None), t);
    }

    #[test]
    fn activate_inside_tuple() {
        let env = test_env();
        let name = env.names().intern("x");
        let t = Term::tuple(vec![
            Term::text("lit"),
            Term::Local { index: 3, name },
        ]);
        // No frame: structure preserved, placeholder inert.
        assert_eq!(env.resolve(&t), t);
    }
}
