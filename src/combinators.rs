//! Solution-capturing combinators: `DoAll`, `Once`, `ExactlyOnce`, `Max`,
//! `Min`.
//!
//! Each is a meta primitive that compiles its body argument (a sequence of
//! call tuples) into an internal step chain and drives it with a custom
//! continuation. Solutions are captured as `(output difference, trail,
//! state)` and replayed after the search has moved past them. The
//! `Once`-family escape is a `Control::Exit` carrying a per-invocation
//! token; it is intercepted only by the combinator that raised it.

use crate::env::Env;
use crate::error::{Capture, Control, ErrorKind, EvalError, ExitToken, Try};
use crate::module::Module;
use crate::output::{TextBuffer, Token};
use crate::primitives::Primitive;
use crate::step::{Cont, Link, Step};
use crate::term::{format_term, Term};
use smallvec::SmallVec;
use std::sync::Arc;

/// Compile a body (resolved call tuples) into a chain of `Call` steps.
fn compile_body(name: &str, body: &[Term], env: &Env) -> Result<Link, Control> {
    let mut chain: Link = None;
    for tuple in body.iter().rev() {
        let Term::Tuple(elems) = tuple else {
            return Err(type_error(name, "body elements must be call tuples", env));
        };
        let Some((task, args)) = elems.split_first() else {
            return Err(type_error(name, "body call tuple is empty", env));
        };
        chain = Some(Arc::new(Step::Call {
            task: task.clone(),
            args: args.iter().cloned().collect(),
            next: chain,
        }));
    }
    Ok(chain)
}

fn type_error(task: &str, message: &str, env: &Env) -> Control {
    EvalError::new(ErrorKind::ArgumentType {
        task: task.to_string(),
        message: message.to_string(),
    })
    .with_stack(env.stack_trace())
    .into()
}

/// Replay a captured solution into the buffer and hand the captured
/// bindings to the continuation, rolling back if it rejects.
fn replay(
    cap: &Capture,
    mark: usize,
    buf: &mut TextBuffer,
    env: &Env,
    k: Cont<'_>,
) -> Try {
    buf.truncate(mark);
    buf.append_slice(&cap.slice);
    let replay_env = Env {
        trail: cap.trail.clone(),
        state: cap.state.clone(),
        ..env.clone()
    };
    let ok = k(buf, &replay_env)?;
    if !ok {
        buf.truncate(mark);
    }
    Ok(ok)
}

/// `DoAll`: run the body to exhaustion, concatenating every successful
/// solution's output in search order, then continue once. Inner
/// unifications and state changes do not propagate outward.
fn do_all(args: &[Term], buf: &mut TextBuffer, env: &Env, k: Cont<'_>) -> Try {
    let chain = compile_body("DoAll", args, env)?;
    let mark = buf.mark();
    let mut slices: Vec<Vec<Token>> = Vec::new();

    let mut collect = |b: &mut TextBuffer, _e: &Env| {
        slices.push(b.difference(mark));
        Ok(false) // reject so the search keeps producing solutions
    };
    Step::try_chain(&chain, buf, env, &mut collect)?;

    buf.truncate(mark);
    for slice in &slices {
        buf.append_slice(slice);
    }
    let ok = k(buf, env)?;
    if !ok {
        buf.truncate(mark);
    }
    Ok(ok)
}

/// Shared engine for `Once` and `ExactlyOnce`: commit to the body's first
/// solution by escaping the search with a non-local exit.
fn first_solution(
    name: &str,
    args: &[Term],
    buf: &mut TextBuffer,
    env: &Env,
) -> Result<Option<Capture>, Control> {
    let chain = compile_body(name, args, env)?;
    let token = ExitToken::fresh();
    let mark = buf.mark();

    let mut escape = |b: &mut TextBuffer, e: &Env| -> Try {
        Err(Control::Exit(
            token,
            Box::new(Capture {
                slice: b.difference(mark),
                trail: e.trail.clone(),
                state: e.state.clone(),
            }),
        ))
    };

    match Step::try_chain(&chain, buf, env, &mut escape) {
        Ok(_) => Ok(None),
        Err(Control::Exit(t, cap)) if t == token => Ok(Some(*cap)),
        Err(other) => Err(other),
    }
}

/// `Once`: commit to the first solution; zero solutions is quiet failure.
fn once(args: &[Term], buf: &mut TextBuffer, env: &Env, k: Cont<'_>) -> Try {
    let mark = buf.mark();
    match first_solution("Once", args, buf, env)? {
        Some(cap) => replay(&cap, mark, buf, env, k),
        None => Ok(false),
    }
}

/// `ExactlyOnce`: like `Once`, but zero solutions raises `CallFailed`
/// naming the first call in the body.
fn exactly_once(args: &[Term], buf: &mut TextBuffer, env: &Env, k: Cont<'_>) -> Try {
    let mark = buf.mark();
    match first_solution("ExactlyOnce", args, buf, env)? {
        Some(cap) => replay(&cap, mark, buf, env, k),
        None => {
            let (task, rendered_args) = match args.first() {
                Some(Term::Tuple(elems)) if !elems.is_empty() => (
                    format_term(&elems[0], env.names()),
                    elems[1..]
                        .iter()
                        .map(|t| format_term(t, env.names()))
                        .collect::<Vec<_>>()
                        .join(" "),
                ),
                _ => ("ExactlyOnce".to_string(), String::new()),
            };
            Err(EvalError::new(ErrorKind::CallFailed {
                task,
                args: rendered_args,
            })
            .with_stack(env.stack_trace())
            .into())
        }
    }
}

/// Shared engine for `Max` and `Min`: enumerate all solutions, score each
/// by dereferencing the score variable, keep the best capture.
fn best_solution(
    name: &str,
    prefer_larger: bool,
    args: &[Term],
    buf: &mut TextBuffer,
    env: &Env,
    k: Cont<'_>,
) -> Try {
    let Some((score, body)) = args.split_first() else {
        return Err(type_error(name, "expected a score variable and a body", env));
    };
    let chain = compile_body(name, body, env)?;
    let mark = buf.mark();
    let mut best: Option<(f64, Capture)> = None;

    let mut observe = |b: &mut TextBuffer, e: &Env| -> Try {
        let value = e.resolve(score);
        let n = match value {
            Term::Number(n) if n.is_finite() => n,
            Term::Var(_) => {
                return Err(EvalError::new(ErrorKind::ArgumentInstantiation {
                    task: name.to_string(),
                    message: format!(
                        "score {} is unbound at solution",
                        format_term(score, e.names())
                    ),
                })
                .with_stack(e.stack_trace())
                .into())
            }
            other => {
                return Err(EvalError::new(ErrorKind::ArgumentType {
                    task: name.to_string(),
                    message: format!(
                        "score resolved to {}, which is not a finite number",
                        format_term(&other, e.names())
                    ),
                })
                .with_stack(e.stack_trace())
                .into())
            }
        };

        let better = match &best {
            None => true,
            Some((current, _)) => {
                if prefer_larger {
                    n > *current
                } else {
                    n < *current
                }
            }
        };
        if better {
            best = Some((
                n,
                Capture {
                    slice: b.difference(mark),
                    trail: e.trail.clone(),
                    state: e.state.clone(),
                },
            ));
        }
        Ok(false)
    };
    Step::try_chain(&chain, buf, env, &mut observe)?;

    match best {
        Some((_, cap)) => replay(&cap, mark, buf, env, k),
        None => Ok(false),
    }
}

fn max(args: &[Term], buf: &mut TextBuffer, env: &Env, k: Cont<'_>) -> Try {
    best_solution("Max", true, args, buf, env, k)
}

fn min(args: &[Term], buf: &mut TextBuffer, env: &Env, k: Cont<'_>) -> Try {
    best_solution("Min", false, args, buf, env, k)
}

/// Install the combinators into a module.
pub fn install(module: &Module) {
    module.set("DoAll", Term::Primitive(Primitive::meta("DoAll", do_all)));
    module.set("Once", Term::Primitive(Primitive::meta("Once", once)));
    module.set(
        "ExactlyOnce",
        Term::Primitive(Primitive::meta("ExactlyOnce", exactly_once)),
    );
    module.set("Max", Term::Primitive(Primitive::meta("Max", max)));
    module.set("Min", Term::Primitive(Primitive::meta("Min", min)));
}

/// Build a body tuple for host-side callers and tests.
pub fn call_tuple(task: Term, args: impl IntoIterator<Item = Term>) -> Term {
    let mut elems: SmallVec<[Term; 4]> = SmallVec::new();
    elems.push(task);
    elems.extend(args);
    Term::Tuple(elems.into_vec().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::State;
    use crate::task::{CompoundTask, TaskFlags};
    use crate::term::LogicVar;

    /// A module with a two-method generator task `Gen` producing "a" then
    /// "b", binding its argument to the emitted text.
    fn env_with_gen() -> (Env, Arc<CompoundTask>) {
        let module = Module::new();
        let gen_name = module.names().intern("Gen");
        let task = Arc::new(CompoundTask::new(gen_name, 1));
        for out in ["a", "b"] {
            let m = crate::task::Method::new(
                gen_name,
                smallvec::smallvec![Term::text(out)],
                Vec::new(),
                Some(crate::step::emit([Arc::from(out)], None)),
                1.0,
                Arc::from("<test>"),
                0,
            );
            task.add_method(
                m,
                TaskFlags::MULTIPLE_SOLUTIONS.union(TaskFlags::FALLIBLE),
                "Gen",
            )
            .unwrap();
        }
        module.set("Gen", Term::Task(task.clone()));
        (Env::new(module, State::empty()), task)
    }

    fn accept() -> impl FnMut(&mut TextBuffer, &Env) -> Try {
        |_: &mut TextBuffer, _: &Env| Ok(true)
    }

    // ========== DO ALL ==========

    #[test]
    fn do_all_concatenates_solutions_in_order() {
        let (env, _) = env_with_gen();
        let mut buf = TextBuffer::new();
        let v = LogicVar::fresh(None);
        let body = [call_tuple(Term::State(env.names().intern("Gen")), [Term::Var(v)])];
        let mut k = accept();
        assert!(do_all(&body, &mut buf, &env, &mut k).unwrap());
        assert_eq!(buf.format(), "a b");
    }

    #[test]
    fn do_all_does_not_leak_inner_bindings() {
        let (env, _) = env_with_gen();
        let mut buf = TextBuffer::new();
        let v = LogicVar::fresh(None);
        let body = [call_tuple(Term::State(env.names().intern("Gen")), [Term::Var(v)])];
        let mut outer = None;
        let mut k = |_: &mut TextBuffer, e: &Env| {
            outer = Some(e.resolve(&Term::Var(v)));
            Ok(true)
        };
        assert!(do_all(&body, &mut buf, &env, &mut k).unwrap());
        assert_eq!(
            outer,
            Some(Term::Var(v)),
            "DoAll must not propagate inner unifications"
        );
    }

    #[test]
    fn do_all_zero_solutions_emits_nothing_and_succeeds() {
        let (env, _) = env_with_gen();
        let mut buf = TextBuffer::new();
        // Gen is never called with "c"; the body produces no solutions.
        let body = [call_tuple(
            Term::State(env.names().intern("Gen")),
            [Term::text("c")],
        )];
        let mut k = accept();
        assert!(do_all(&body, &mut buf, &env, &mut k).unwrap());
        assert_eq!(buf.format(), "");
    }

    // ========== ONCE ==========

    #[test]
    fn once_commits_to_first_solution() {
        let (env, _) = env_with_gen();
        let mut buf = TextBuffer::new();
        let v = LogicVar::fresh(None);
        let body = [call_tuple(Term::State(env.names().intern("Gen")), [Term::Var(v)])];
        let mut seen = None;
        let mut k = |_: &mut TextBuffer, e: &Env| {
            seen = Some(e.resolve(&Term::Var(v)));
            Ok(true)
        };
        assert!(once(&body, &mut buf, &env, &mut k).unwrap());
        assert_eq!(buf.format(), "a");
        assert_eq!(seen, Some(Term::text("a")), "bindings of the first solution");
    }

    #[test]
    fn once_zero_solutions_fails_quietly() {
        let (env, _) = env_with_gen();
        let mut buf = TextBuffer::new();
        let body = [call_tuple(
            Term::State(env.names().intern("Gen")),
            [Term::text("c")],
        )];
        let mut k = accept();
        assert_eq!(once(&body, &mut buf, &env, &mut k).unwrap(), false);
        assert!(buf.is_empty());
    }

    // ========== EXACTLY ONCE ==========

    #[test]
    fn exactly_once_zero_solutions_raises_call_failed() {
        let (env, _) = env_with_gen();
        let mut buf = TextBuffer::new();
        let body = [call_tuple(
            Term::State(env.names().intern("Gen")),
            [Term::text("c")],
        )];
        let mut k = accept();
        let err = exactly_once(&body, &mut buf, &env, &mut k).unwrap_err();
        match err {
            Control::Err(e) => match e.kind {
                ErrorKind::CallFailed { task, .. } => assert_eq!(task, "Gen"),
                other => panic!("unexpected kind: {:?}", other),
            },
            Control::Exit(..) => panic!("exit escaped its combinator"),
        }
    }

    // ========== MAX / MIN ==========

    /// Scored generator: three methods binding (key, score) pairs.
    fn env_with_scored() -> Env {
        let module = Module::new();
        let name = module.names().intern("S");
        let task = Arc::new(CompoundTask::new(name, 2));
        for (key, score) in [(1.0, 10.0), (2.0, 20.0), (3.0, 5.0)] {
            let m = crate::task::Method::new(
                name,
                smallvec::smallvec![Term::Number(key), Term::Number(score)],
                Vec::new(),
                None,
                1.0,
                Arc::from("<test>"),
                0,
            );
            task.add_method(
                m,
                TaskFlags::MULTIPLE_SOLUTIONS.union(TaskFlags::FALLIBLE),
                "S",
            )
            .unwrap();
        }
        module.set("S", Term::Task(task));
        Env::new(module, State::empty())
    }

    #[test]
    fn max_selects_highest_score() {
        let env = env_with_scored();
        let mut buf = TextBuffer::new();
        let key = LogicVar::fresh(None);
        let score = LogicVar::fresh(None);
        let args = [
            Term::Var(score),
            call_tuple(
                Term::State(env.names().intern("S")),
                [Term::Var(key), Term::Var(score)],
            ),
        ];
        let mut best_key = None;
        let mut k = |_: &mut TextBuffer, e: &Env| {
            best_key = Some(e.resolve(&Term::Var(key)));
            Ok(true)
        };
        assert!(max(&args, &mut buf, &env, &mut k).unwrap());
        assert_eq!(best_key, Some(Term::Number(2.0)));
    }

    #[test]
    fn min_selects_lowest_score() {
        let env = env_with_scored();
        let mut buf = TextBuffer::new();
        let key = LogicVar::fresh(None);
        let score = LogicVar::fresh(None);
        let args = [
            Term::Var(score),
            call_tuple(
                Term::State(env.names().intern("S")),
                [Term::Var(key), Term::Var(score)],
            ),
        ];
        let mut best_key = None;
        let mut k = |_: &mut TextBuffer, e: &Env| {
            best_key = Some(e.resolve(&Term::Var(key)));
            Ok(true)
        };
        assert!(min(&args, &mut buf, &env, &mut k).unwrap());
        assert_eq!(best_key, Some(Term::Number(3.0)));
    }

    #[test]
    fn max_unbound_score_is_instantiation_error() {
        let (env, _) = env_with_gen();
        let mut buf = TextBuffer::new();
        let x = LogicVar::fresh(None);
        let score = LogicVar::fresh(None);
        // Gen never binds the score variable.
        let args = [
            Term::Var(score),
            call_tuple(Term::State(env.names().intern("Gen")), [Term::Var(x)]),
        ];
        let mut k = accept();
        let err = max(&args, &mut buf, &env, &mut k).unwrap_err();
        match err {
            Control::Err(e) => {
                assert!(matches!(e.kind, ErrorKind::ArgumentInstantiation { .. }))
            }
            Control::Exit(..) => panic!("expected error"),
        }
    }

    #[test]
    fn max_non_numeric_score_is_type_error() {
        let (env, _) = env_with_gen();
        let mut buf = TextBuffer::new();
        let x = LogicVar::fresh(None);
        // Score unifies with the emitted text, not a number.
        let args = [
            Term::Var(x),
            call_tuple(Term::State(env.names().intern("Gen")), [Term::Var(x)]),
        ];
        let mut k = accept();
        let err = max(&args, &mut buf, &env, &mut k).unwrap_err();
        match err {
            Control::Err(e) => assert!(matches!(e.kind, ErrorKind::ArgumentType { .. })),
            Control::Exit(..) => panic!("expected error"),
        }
    }

    #[test]
    fn max_zero_solutions_fails_quietly() {
        let (env, _) = env_with_gen();
        let mut buf = TextBuffer::new();
        let score = LogicVar::fresh(None);
        let args = [
            Term::Var(score),
            call_tuple(Term::State(env.names().intern("Gen")), [Term::text("c")]),
        ];
        let mut k = accept();
        assert_eq!(max(&args, &mut buf, &env, &mut k).unwrap(), false);
    }

    // ========== BODY VALIDATION ==========

    #[test]
    fn non_tuple_body_is_type_error() {
        let (env, _) = env_with_gen();
        let mut buf = TextBuffer::new();
        let mut k = accept();
        assert!(do_all(&[Term::text("not-a-call")], &mut buf, &env, &mut k).is_err());
    }
}
