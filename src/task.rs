use crate::env::{Env, Frame};
use crate::error::{Control, ErrorKind, EvalError, Try};
use crate::output::TextBuffer;
use crate::step::{Cont, Link, Step};
use crate::symbol::StateVar;
use crate::term::{format_term, LogicVar, Term};
use crate::trace::TraceEvent;
use crate::unify::unify_all;
use parking_lot::RwLock;
use rand::Rng;
use smallvec::SmallVec;
use std::cell::Cell;
use std::cmp::Ordering;
use std::sync::Arc;

#[cfg(feature = "tracing")]
use crate::trace::{debug, debug_span};

/// Task-level flags. Flags are monotonic: adding methods may set more
/// flags but never clears one; the only reset is `erase_methods`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskFlags(u8);

impl TaskFlags {
    /// Methods are tried in a weighted-shuffle order.
    pub const SHUFFLE: TaskFlags = TaskFlags(1);
    /// The task may be re-entered for further answers on backtracking.
    /// A task without this flag is deterministic: it promises at most one
    /// answer even if several methods match.
    pub const MULTIPLE_SOLUTIONS: TaskFlags = TaskFlags(2);
    /// Exhausting all methods is ordinary failure rather than an error.
    pub const FALLIBLE: TaskFlags = TaskFlags(4);
    /// Entry point marker, used by hosts to find runnable tasks.
    pub const MAIN: TaskFlags = TaskFlags(8);

    pub fn empty() -> Self {
        TaskFlags(0)
    }

    pub fn contains(self, other: TaskFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: TaskFlags) {
        self.0 |= other.0;
    }

    pub fn union(self, other: TaskFlags) -> Self {
        TaskFlags(self.0 | other.0)
    }
}

/// One clause of a compound task: an argument pattern plus a step chain.
#[derive(Debug)]
pub struct Method {
    task_name: StateVar,
    /// Pattern terms with embedded `Term::Local` placeholder slots.
    pub pattern: SmallVec<[Term; 4]>,
    /// Display names for the local slots; one fresh `LogicVar` is
    /// allocated per slot at every activation.
    pub locals: Vec<StateVar>,
    /// Head of the body chain; `None` is an empty body (a fact).
    pub chain: Link,
    /// Weight for the Plackett-Luce shuffle draw. Must be positive.
    pub weight: f64,
    /// Source location, for stack traces and lint output.
    pub path: Arc<str>,
    pub line: u32,
}

impl Method {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_name: StateVar,
        pattern: SmallVec<[Term; 4]>,
        locals: Vec<StateVar>,
        chain: Link,
        weight: f64,
        path: Arc<str>,
        line: u32,
    ) -> Self {
        Self {
            task_name,
            pattern,
            locals,
            chain,
            weight,
            path,
            line,
        }
    }

    /// The owning task's name.
    pub fn task_name(&self) -> StateVar {
        self.task_name
    }

    /// Try this method against already-resolved arguments.
    ///
    /// Allocates fresh locals, unifies the activated pattern against the
    /// arguments (failure is silent: no frame, no output), pushes a frame,
    /// and runs the chain. The success continuation restores the caller's
    /// frame before delegating outward.
    pub fn try_method(
        self: &Arc<Self>,
        args: &[Term],
        buf: &mut TextBuffer,
        env: &Env,
        k: Cont<'_>,
    ) -> Try {
        let locals: SmallVec<[LogicVar; 8]> = self
            .locals
            .iter()
            .map(|name| LogicVar::fresh(Some(*name)))
            .collect();

        let frame = Arc::new(Frame {
            method: self.clone(),
            args: args.iter().cloned().collect(),
            locals,
            parent: env.frame.clone(),
            trail_at_entry: env.trail.clone(),
        });

        let activated: SmallVec<[Term; 4]> = self
            .pattern
            .iter()
            .map(|t| crate::env::activate(t, &Some(frame.clone())))
            .collect();

        let Some(trail) = unify_all(&activated, args, &env.trail) else {
            return Ok(false);
        };

        let inner = Env {
            frame: Some(frame.clone()),
            trail,
            ..env.clone()
        };

        env.module.emit_trace(|| TraceEvent::Enter {
            task: env.names().resolve(self.task_name).unwrap_or("?").into(),
            line: self.line,
        });

        let caller_frame = env.frame.clone();
        let mut on_success = |buf: &mut TextBuffer, e: &Env| {
            e.module.emit_trace(|| TraceEvent::Succeed {
                task: e.names().resolve(self.task_name).unwrap_or("?").into(),
                line: self.line,
            });
            k(buf, &e.with_frame(caller_frame.clone()))
        };

        let ok = Step::try_chain(&self.chain, buf, &inner, &mut on_success)?;
        if !ok {
            env.module.emit_trace(|| TraceEvent::MethodFail {
                task: env.names().resolve(self.task_name).unwrap_or("?").into(),
                line: self.line,
            });
        }
        Ok(ok)
    }
}

/// A named task with one or more pattern-guarded methods.
///
/// Invariants: every method's pattern length equals the declared arity;
/// the flag set only grows as methods are added.
#[derive(Debug)]
pub struct CompoundTask {
    name: StateVar,
    arity: usize,
    methods: RwLock<Vec<Arc<Method>>>,
    flags: RwLock<TaskFlags>,
}

impl CompoundTask {
    pub fn new(name: StateVar, arity: usize) -> Self {
        Self {
            name,
            arity,
            methods: RwLock::new(Vec::new()),
            flags: RwLock::new(TaskFlags::empty()),
        }
    }

    pub fn name(&self) -> StateVar {
        self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn flags(&self) -> TaskFlags {
        *self.flags.read()
    }

    pub fn method_count(&self) -> usize {
        self.methods.read().len()
    }

    /// Add a method, unioning `flags` into the task's flag set.
    /// Raises `ArgumentCount` if the pattern length is not the arity.
    pub fn add_method(
        &self,
        method: Method,
        flags: TaskFlags,
        task_display: &str,
    ) -> Result<(), EvalError> {
        if method.pattern.len() != self.arity {
            return Err(EvalError::new(ErrorKind::ArgumentCount {
                task: task_display.to_string(),
                expected: self.arity,
                got: method.pattern.len(),
            }));
        }
        self.methods.write().push(Arc::new(method));
        let mut f = self.flags.write();
        *f = f.union(flags);
        Ok(())
    }

    /// Remove all methods and reset the flag set to empty.
    pub fn erase_methods(&self) {
        self.methods.write().clear();
        *self.flags.write() = TaskFlags::empty();
    }

    /// The call driver: iterate methods in effective order, enforcing the
    /// determinism cut and the must-succeed contract.
    pub fn call(&self, args: &[Term], buf: &mut TextBuffer, env: &Env, k: Cont<'_>) -> Try {
        let display = env.names().resolve(self.name).unwrap_or("?").to_string();

        if args.len() != self.arity {
            return Err(EvalError::new(ErrorKind::ArgumentCount {
                task: display,
                expected: self.arity,
                got: args.len(),
            })
            .with_stack(env.stack_trace())
            .into());
        }

        let flags = self.flags();
        let methods = self.methods.read().clone();
        let effective = if flags.contains(TaskFlags::SHUFFLE) {
            weighted_order(&methods)
        } else {
            methods
        };

        #[cfg(feature = "tracing")]
        let _span = debug_span!("call", task = %display, methods = effective.len()).entered();

        let successes = Cell::new(0usize);
        for method in &effective {
            let mut counting_k = |buf: &mut TextBuffer, e: &Env| {
                successes.set(successes.get() + 1);
                k(buf, e)
            };
            if method.try_method(args, buf, env, &mut counting_k)? {
                return Ok(true);
            }
            // Determinism cut: a deterministic task never re-enters the
            // method list once one method's continuation has run.
            if !flags.contains(TaskFlags::MULTIPLE_SOLUTIONS) && successes.get() > 0 {
                break;
            }
        }

        if successes.get() == 0 && !flags.contains(TaskFlags::FALLIBLE) {
            let rendered_args = args
                .iter()
                .map(|a| format_term(a, env.names()))
                .collect::<Vec<_>>()
                .join(" ");
            return Err(Control::Err(
                EvalError::new(ErrorKind::CallFailed {
                    task: display,
                    args: rendered_args,
                })
                .with_stack(env.stack_trace()),
            ));
        }

        #[cfg(feature = "tracing")]
        debug!(task = %display, "call_exhausted");
        env.module
            .emit_trace(|| TraceEvent::CallFail { task: display });
        Ok(false)
    }
}

/// Weighted-shuffle permutation: each method draws the key `-ln(U)/w` and
/// the list is sorted ascending, which realises a Plackett-Luce draw
/// without replacement in O(n log n).
fn weighted_order(methods: &[Arc<Method>]) -> Vec<Arc<Method>> {
    let mut rng = rand::thread_rng();
    let mut keyed: Vec<(f64, Arc<Method>)> = methods
        .iter()
        .map(|m| {
            // 1 - U lies in (0, 1], keeping ln finite.
            let u: f64 = 1.0 - rng.gen::<f64>();
            let w = if m.weight > 0.0 { m.weight } else { f64::MIN_POSITIVE };
            (-u.ln() / w, m.clone())
        })
        .collect();
    keyed.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
    keyed.into_iter().map(|(_, m)| m).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::State;
    use crate::module::Module;
    use crate::step::emit;

    fn test_env() -> Env {
        Env::new(Module::new(), State::empty())
    }

    fn method_for(env: &Env, name: &str, pattern: Vec<Term>, chain: Link) -> Method {
        Method::new(
            env.names().intern(name),
            pattern.into_iter().collect(),
            Vec::new(),
            chain,
            1.0,
            Arc::from("<test>"),
            0,
        )
    }

    // ========== FLAGS ==========

    #[test]
    fn flags_union_is_monotonic() {
        let mut f = TaskFlags::empty();
        f.insert(TaskFlags::SHUFFLE);
        f.insert(TaskFlags::FALLIBLE);
        assert!(f.contains(TaskFlags::SHUFFLE));
        assert!(f.contains(TaskFlags::FALLIBLE));
        assert!(!f.contains(TaskFlags::MAIN));
    }

    #[test]
    fn adding_methods_unions_flags() {
        let env = test_env();
        let task = CompoundTask::new(env.names().intern("T"), 0);
        task.add_method(
            method_for(&env, "T", vec![], None),
            TaskFlags::SHUFFLE,
            "T",
        )
        .unwrap();
        task.add_method(
            method_for(&env, "T", vec![], None),
            TaskFlags::FALLIBLE,
            "T",
        )
        .unwrap();
        assert!(task.flags().contains(TaskFlags::SHUFFLE));
        assert!(task.flags().contains(TaskFlags::FALLIBLE));
    }

    #[test]
    fn erase_methods_resets_flags() {
        let env = test_env();
        let task = CompoundTask::new(env.names().intern("T"), 0);
        task.add_method(method_for(&env, "T", vec![], None), TaskFlags::MAIN, "T")
            .unwrap();
        task.erase_methods();
        assert_eq!(task.method_count(), 0);
        assert_eq!(task.flags(), TaskFlags::empty());
    }

    // ========== ARITY ==========

    #[test]
    fn add_method_wrong_arity_is_error() {
        let env = test_env();
        let task = CompoundTask::new(env.names().intern("T"), 2);
        let err = task
            .add_method(
                method_for(&env, "T", vec![Term::text("only-one")], None),
                TaskFlags::empty(),
                "T",
            )
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ArgumentCount { expected: 2, got: 1, .. }));
    }

    #[test]
    fn call_wrong_arity_is_error() {
        let env = test_env();
        let task = CompoundTask::new(env.names().intern("T"), 1);
        let mut buf = TextBuffer::new();
        let mut k = |_: &mut TextBuffer, _: &Env| Ok(true);
        let err = task.call(&[], &mut buf, &env, &mut k).unwrap_err();
        match err {
            Control::Err(e) => {
                assert!(matches!(e.kind, ErrorKind::ArgumentCount { expected: 1, got: 0, .. }))
            }
            Control::Exit(..) => panic!("expected error, got exit"),
        }
    }

    // ========== METHOD SELECTION ==========

    #[test]
    fn first_matching_method_wins() {
        let env = test_env();
        let task = CompoundTask::new(env.names().intern("F"), 1);
        let mk = |pat: f64, out: &str| {
            method_for(
                &env,
                "F",
                vec![Term::Number(pat)],
                Some(emit([Arc::from(out)], None)),
            )
        };
        task.add_method(mk(1.0, "one"), TaskFlags::MULTIPLE_SOLUTIONS, "F")
            .unwrap();
        task.add_method(mk(2.0, "two"), TaskFlags::MULTIPLE_SOLUTIONS, "F")
            .unwrap();

        let mut buf = TextBuffer::new();
        let mut k = |_: &mut TextBuffer, _: &Env| Ok(true);
        assert!(task
            .call(&[Term::Number(2.0)], &mut buf, &env, &mut k)
            .unwrap());
        assert_eq!(buf.format(), "two");
    }

    #[test]
    fn exhausted_must_succeed_task_raises_call_failed() {
        let env = test_env();
        let task = CompoundTask::new(env.names().intern("F"), 1);
        task.add_method(
            method_for(&env, "F", vec![Term::Number(1.0)], None),
            TaskFlags::MULTIPLE_SOLUTIONS,
            "F",
        )
        .unwrap();

        let mut buf = TextBuffer::new();
        let mut k = |_: &mut TextBuffer, _: &Env| Ok(true);
        let err = task
            .call(&[Term::Number(3.0)], &mut buf, &env, &mut k)
            .unwrap_err();
        match err {
            Control::Err(e) => assert!(matches!(e.kind, ErrorKind::CallFailed { .. })),
            Control::Exit(..) => panic!("expected error, got exit"),
        }
    }

    #[test]
    fn exhausted_fallible_task_fails_quietly() {
        let env = test_env();
        let task = CompoundTask::new(env.names().intern("F"), 1);
        task.add_method(
            method_for(&env, "F", vec![Term::Number(1.0)], None),
            TaskFlags::FALLIBLE,
            "F",
        )
        .unwrap();

        let mut buf = TextBuffer::new();
        let mut k = |_: &mut TextBuffer, _: &Env| Ok(true);
        assert_eq!(
            task.call(&[Term::Number(3.0)], &mut buf, &env, &mut k)
                .unwrap(),
            false
        );
    }

    // ========== DETERMINISM CUT ==========

    #[test]
    fn deterministic_task_tries_one_succeeding_method() {
        let env = test_env();
        let task = CompoundTask::new(env.names().intern("D"), 0);
        task.add_method(
            method_for(&env, "D", vec![], Some(emit([Arc::from("first")], None))),
            TaskFlags::empty(),
            "D",
        )
        .unwrap();
        task.add_method(
            method_for(&env, "D", vec![], Some(emit([Arc::from("second")], None))),
            TaskFlags::empty(),
            "D",
        )
        .unwrap();

        let mut invocations = 0;
        let mut k = |_: &mut TextBuffer, _: &Env| {
            invocations += 1;
            Ok(false) // reject every answer, forcing re-entry attempts
        };
        let mut buf = TextBuffer::new();
        let r = task.call(&[], &mut buf, &env, &mut k).unwrap();
        assert_eq!(r, false, "one success happened, so this is quiet failure");
        assert_eq!(
            invocations, 1,
            "deterministic task must invoke at most one method's continuation"
        );
    }

    #[test]
    fn multi_solution_task_retries_later_methods() {
        let env = test_env();
        let task = CompoundTask::new(env.names().intern("M"), 0);
        for out in ["first", "second"] {
            task.add_method(
                method_for(&env, "M", vec![], Some(emit([Arc::from(out)], None))),
                TaskFlags::MULTIPLE_SOLUTIONS.union(TaskFlags::FALLIBLE),
                "M",
            )
            .unwrap();
        }

        let mut outputs = Vec::new();
        let mut buf = TextBuffer::new();
        let mut k = |b: &mut TextBuffer, _: &Env| {
            outputs.push(b.format());
            Ok(false)
        };
        assert_eq!(task.call(&[], &mut buf, &env, &mut k).unwrap(), false);
        assert_eq!(outputs, vec!["first".to_string(), "second".to_string()]);
        assert!(buf.is_empty(), "all rejected output rolled back");
    }

    // ========== PATTERN BINDING ==========

    #[test]
    fn pattern_binds_fresh_local_per_activation() {
        let env = test_env();
        let x = env.names().intern("x");
        let task = CompoundTask::new(env.names().intern("Id"), 1);
        let method = Method::new(
            env.names().intern("Id"),
            smallvec::smallvec![Term::Local { index: 0, name: x }],
            vec![x],
            None,
            1.0,
            Arc::from("<test>"),
            0,
        );
        task.add_method(method, TaskFlags::MULTIPLE_SOLUTIONS, "Id")
            .unwrap();

        let mut buf = TextBuffer::new();
        let mut k = |_: &mut TextBuffer, _: &Env| Ok(true);
        assert!(task
            .call(&[Term::text("anything")], &mut buf, &env, &mut k)
            .unwrap());
        assert!(task
            .call(&[Term::Number(7.0)], &mut buf, &env, &mut k)
            .unwrap());
    }

    // ========== WEIGHTED SHUFFLE ==========

    #[test]
    fn weighted_order_is_a_permutation() {
        let env = test_env();
        let methods: Vec<Arc<Method>> = (0..5)
            .map(|i| {
                Arc::new(method_for(
                    &env,
                    "W",
                    vec![],
                    Some(emit([Arc::from(format!("m{}", i).as_str())], None)),
                ))
            })
            .collect();
        let order = weighted_order(&methods);
        assert_eq!(order.len(), methods.len());
        for m in &methods {
            assert!(order.iter().any(|o| Arc::ptr_eq(o, m)));
        }
    }

    #[test]
    fn heavy_weight_usually_first() {
        let env = test_env();
        let light = Arc::new(Method::new(
            env.names().intern("W"),
            SmallVec::new(),
            Vec::new(),
            None,
            1.0,
            Arc::from("<test>"),
            0,
        ));
        let heavy = Arc::new(Method::new(
            env.names().intern("W"),
            SmallVec::new(),
            Vec::new(),
            None,
            1000.0,
            Arc::from("<test>"),
            1,
        ));
        let methods = vec![light, heavy.clone()];
        let mut heavy_first = 0;
        for _ in 0..100 {
            if Arc::ptr_eq(&weighted_order(&methods)[0], &heavy) {
                heavy_first += 1;
            }
        }
        assert!(heavy_first > 90, "weight 1000 vs 1 should lead almost always");
    }
}
