use crate::env::Env;
use crate::error::{ErrorKind, EvalError, Try};
use crate::output::{TextBuffer, Token};
use crate::term::{format_term, Term};
use rand::seq::SliceRandom;
use smallvec::SmallVec;
use std::sync::Arc;

#[cfg(feature = "tracing")]
use crate::trace::trace;

/// Link to the rest of a method body; `None` ends the chain.
pub type Link = Option<Arc<Step>>;

/// The success continuation: "what to do after this step succeeds".
/// Invoking it is the only way a step reports success.
pub type Cont<'a> = &'a mut dyn FnMut(&mut TextBuffer, &Env) -> Try;

/// One atomic operation inside a method body. Each step holds a link to
/// its successor; chains are built right-to-left at parse time so
/// execution is a tail-shaped traversal.
#[derive(Debug)]
pub enum Step {
    /// Append a fixed token run.
    Emit {
        tokens: SmallVec<[Token; 4]>,
        next: Link,
    },
    /// Call a task or primitive. The task term is resolved at execution
    /// time, so call targets can be variables or state lookups.
    Call {
        task: Term,
        args: SmallVec<[Term; 4]>,
        next: Link,
    },
    /// Try alternative sub-chains in order (or shuffled). A `None`
    /// alternative means "do nothing and continue", which is how empty
    /// else-clauses are represented.
    Branch {
        alternatives: Vec<Link>,
        shuffle: bool,
        next: Link,
    },
    /// Unify two terms; fail the step if they do not unify.
    Unify { left: Term, right: Term, next: Link },
    /// Bind a state variable in the dynamic state.
    Set {
        var: crate::symbol::StateVar,
        value: Term,
        next: Link,
    },
}

impl Step {
    /// Run a chain from its head link. An empty chain invokes `k` with the
    /// incoming environment unchanged.
    pub fn try_chain(chain: &Link, buf: &mut TextBuffer, env: &Env, k: Cont<'_>) -> Try {
        match chain {
            Some(step) => step.try_step(buf, env, k),
            None => k(buf, env),
        }
    }

    /// Execute this step. Returns `Ok(true)` iff the continuation was
    /// invoked and accepted; on `Ok(false)` the buffer is back at the
    /// length observed on entry.
    pub fn try_step(&self, buf: &mut TextBuffer, env: &Env, k: Cont<'_>) -> Try {
        match self {
            Step::Emit { tokens, next } => {
                let mark = buf.mark();
                buf.append_slice(tokens);
                let ok = Self::try_chain(next, buf, env, k)?;
                if !ok {
                    buf.truncate(mark);
                }
                Ok(ok)
            }

            Step::Call { task, args, next } => {
                let target = resolve_call_target(task, env)?;
                let resolved = env.resolve_all(args);
                let mut continue_next =
                    |buf: &mut TextBuffer, env: &Env| Self::try_chain(next, buf, env, k);
                match target {
                    Term::Task(ct) => ct.call(&resolved, buf, env, &mut continue_next),
                    Term::Primitive(p) => p.invoke(&resolved, buf, env, &mut continue_next),
                    other => Err(EvalError::new(ErrorKind::ArgumentType {
                        task: format_term(&other, env.names()),
                        message: "call target is not a task or primitive".into(),
                    })
                    .with_stack(env.stack_trace())
                    .into()),
                }
            }

            Step::Branch {
                alternatives,
                shuffle,
                next,
            } => {
                let order: Vec<usize> = if *shuffle {
                    let mut idx: Vec<usize> = (0..alternatives.len()).collect();
                    idx.shuffle(&mut rand::thread_rng());
                    idx
                } else {
                    (0..alternatives.len()).collect()
                };

                for i in order {
                    let mut continue_next =
                        |buf: &mut TextBuffer, env: &Env| Self::try_chain(next, buf, env, k);
                    if Self::try_chain(&alternatives[i], buf, env, &mut continue_next)? {
                        return Ok(true);
                    }
                }
                #[cfg(feature = "tracing")]
                trace!("branch_exhausted");
                Ok(false)
            }

            Step::Unify { left, right, next } => {
                let l = env.resolve(left);
                let r = env.resolve(right);
                match crate::unify::unify(&l, &r, &env.trail) {
                    Some(trail) => Self::try_chain(next, buf, &env.with_trail(trail), k),
                    None => Ok(false),
                }
            }

            Step::Set { var, value, next } => {
                let v = env.resolve(value);
                Self::try_chain(next, buf, &env.bind_state(*var, v), k)
            }
        }
    }
}

/// Resolve a call-position term to a callable value. A state variable is
/// looked up through the module chain; an unbound logic variable is an
/// instantiation error.
fn resolve_call_target(task: &Term, env: &Env) -> Result<Term, crate::error::Control> {
    let t = env.resolve(task);
    match t {
        Term::State(sv) => {
            env.state
                .lookup(&sv)
                .cloned()
                .or_else(|| env.module.lookup(sv))
                .ok_or_else(|| {
                    EvalError::new(ErrorKind::UndefinedVariable {
                        name: env
                            .names()
                            .resolve(sv)
                            .unwrap_or("<unknown>")
                            .to_string(),
                    })
                    .with_stack(env.stack_trace())
                    .into()
                })
        }
        Term::Var(v) => Err(EvalError::new(ErrorKind::ArgumentInstantiation {
            task: "call".into(),
            message: format!(
                "call target {} is unbound",
                format_term(&Term::Var(v), env.names())
            ),
        })
        .with_stack(env.stack_trace())
        .into()),
        other => Ok(other),
    }
}

/// Build an `Emit` step for a token run.
pub fn emit(tokens: impl IntoIterator<Item = Token>, next: Link) -> Arc<Step> {
    Arc::new(Step::Emit {
        tokens: tokens.into_iter().collect(),
        next,
    })
}
