use crate::env::Env;
use crate::error::{Control, ErrorKind, EvalError, Try};
use crate::module::Module;
use crate::output::{TextBuffer, Token};
use crate::step::Cont;
use crate::term::{format_number, format_term, Term};
use smallvec::SmallVec;
use std::sync::Arc;

/// Tokens produced by a deterministic text generator.
pub type Tokens = SmallVec<[Token; 8]>;

type TextFn =
    dyn Fn(&[Term], &TextBuffer, &Env) -> Result<Tokens, Control> + Send + Sync;
type PredFn = dyn Fn(&[Term], &mut TextBuffer, &Env) -> Try + Send + Sync;
type MetaFn =
    dyn Fn(&[Term], &mut TextBuffer, &Env, Cont<'_>) -> Try + Send + Sync;

/// A host-supplied callable. Primitives participate in lookup exactly like
/// compound tasks: they are values stored under a state-variable name.
#[derive(Clone)]
pub struct Primitive {
    name: Arc<str>,
    kind: PrimitiveKind,
}

#[derive(Clone)]
enum PrimitiveKind {
    /// `(args, buffer, env) -> tokens`, appended in order, always succeeds.
    Text(Arc<TextFn>),
    /// `(args, buffer, env) -> bool`.
    Predicate(Arc<PredFn>),
    /// `(args, buffer, env, k) -> bool`; receives the success continuation.
    Meta(Arc<MetaFn>),
}

impl std::fmt::Debug for Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            PrimitiveKind::Text(_) => "text",
            PrimitiveKind::Predicate(_) => "predicate",
            PrimitiveKind::Meta(_) => "meta",
        };
        write!(f, "<primitive {} ({})>", self.name, kind)
    }
}

impl Primitive {
    pub fn text<F>(name: &str, f: F) -> Self
    where
        F: Fn(&[Term], &TextBuffer, &Env) -> Result<Tokens, Control> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            kind: PrimitiveKind::Text(Arc::new(f)),
        }
    }

    pub fn predicate<F>(name: &str, f: F) -> Self
    where
        F: Fn(&[Term], &mut TextBuffer, &Env) -> Try + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            kind: PrimitiveKind::Predicate(Arc::new(f)),
        }
    }

    pub fn meta<F>(name: &str, f: F) -> Self
    where
        F: Fn(&[Term], &mut TextBuffer, &Env, Cont<'_>) -> Try + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            kind: PrimitiveKind::Meta(Arc::new(f)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity comparison, used by `Term` equality.
    pub fn same(&self, other: &Primitive) -> bool {
        match (&self.kind, &other.kind) {
            (PrimitiveKind::Text(a), PrimitiveKind::Text(b)) => Arc::ptr_eq(a, b),
            (PrimitiveKind::Predicate(a), PrimitiveKind::Predicate(b)) => Arc::ptr_eq(a, b),
            (PrimitiveKind::Meta(a), PrimitiveKind::Meta(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Invoke with already-resolved arguments. The buffer contract matches
    /// compiled steps: output is rolled back when the continuation fails.
    pub fn invoke(&self, args: &[Term], buf: &mut TextBuffer, env: &Env, k: Cont<'_>) -> Try {
        match &self.kind {
            PrimitiveKind::Text(f) => {
                let tokens = f(args, buf, env)?;
                let mark = buf.mark();
                buf.append_slice(&tokens);
                let ok = k(buf, env)?;
                if !ok {
                    buf.truncate(mark);
                }
                Ok(ok)
            }
            PrimitiveKind::Predicate(f) => {
                if f(args, buf, env)? {
                    k(buf, env)
                } else {
                    Ok(false)
                }
            }
            PrimitiveKind::Meta(f) => f(args, buf, env, k),
        }
    }
}

/// Render a term into output tokens, the way `Write` mentions values.
/// State variables are read through the dynamic state and then the module
/// chain; an unresolvable one is an `UndefinedVariable` error.
pub fn term_tokens(term: &Term, env: &Env, out: &mut Tokens) -> Result<(), Control> {
    match term {
        Term::Text(s) => out.push(s.clone()),
        Term::Number(n) => out.push(Arc::from(format_number(*n).as_str())),
        Term::Bool(b) => out.push(Arc::from(if *b { "true" } else { "false" })),
        Term::Tuple(ts) => {
            out.push(Arc::from("["));
            for t in ts.iter() {
                term_tokens(&env.resolve(t), env, out)?;
            }
            out.push(Arc::from("]"));
        }
        Term::Pair(p) => {
            out.push(Arc::from("["));
            term_tokens(&env.resolve(&p.0), env, out)?;
            out.push(Arc::from("."));
            term_tokens(&env.resolve(&p.1), env, out)?;
            out.push(Arc::from("]"));
        }
        Term::State(sv) => {
            let value = env
                .state
                .lookup(sv)
                .cloned()
                .or_else(|| env.module.lookup(*sv));
            match value {
                Some(v) => term_tokens(&env.resolve(&v), env, out)?,
                None => {
                    return Err(EvalError::new(ErrorKind::UndefinedVariable {
                        name: env.names().resolve(*sv).unwrap_or("<unknown>").to_string(),
                    })
                    .with_stack(env.stack_trace())
                    .into())
                }
            }
        }
        Term::Var(_) | Term::Local { .. } => {
            out.push(Arc::from(format_term(term, env.names()).as_str()))
        }
        Term::Task(t) => out.push(Arc::from(
            env.names().resolve(t.name()).unwrap_or("<task>"),
        )),
        Term::Primitive(p) => out.push(Arc::from(p.name())),
    }
    Ok(())
}

fn arity_error(task: &str, expected: usize, got: usize, env: &Env) -> Control {
    EvalError::new(ErrorKind::ArgumentCount {
        task: task.to_string(),
        expected,
        got,
    })
    .with_stack(env.stack_trace())
    .into()
}

/// `Write`: emit the resolved argument as tokens. Also installed as the
/// default binding for `Mention`, which is what variable mentions in
/// method bodies compile to.
fn write_primitive() -> Primitive {
    Primitive::text("Write", |args, _buf, env| {
        let mut out = Tokens::new();
        for arg in args {
            term_tokens(&env.resolve(arg), env, &mut out)?;
        }
        Ok(out)
    })
}

/// `StringForm`: render the first argument to its string form and unify it
/// with the second. A tokeniser-level escape hatch for turning values into
/// text terms.
fn string_form_primitive() -> Primitive {
    Primitive::meta("StringForm", |args, buf, env, k| {
        if args.len() != 2 {
            return Err(arity_error("StringForm", 2, args.len(), env));
        }
        let rendered = format_term(&env.resolve(&args[0]), env.names());
        let text = Term::text(&rendered);
        match crate::unify::unify(&text, &args[1], &env.trail) {
            Some(trail) => k(buf, &env.with_trail(trail)),
            None => Ok(false),
        }
    })
}

/// `Throw`: raise an error whose payload preserves the argument tokens.
fn throw_primitive() -> Primitive {
    Primitive::predicate("Throw", |args, _buf, env| {
        let mut payload = Tokens::new();
        for arg in args {
            term_tokens(&env.resolve(arg), env, &mut payload)?;
        }
        Err(EvalError::new(ErrorKind::Thrown {
            payload: payload.into_vec(),
        })
        .with_stack(env.stack_trace())
        .into())
    })
}

/// `Fail`: always fails, driving backtracking.
fn fail_primitive() -> Primitive {
    Primitive::predicate("Fail", |_args, _buf, _env| Ok(false))
}

/// Install the built-in primitives into a module under their names, and
/// seed the default-bindings table (`Mention` falls back to `Write`).
pub fn install(module: &Module) {
    let write = write_primitive();
    module.set("Write", Term::Primitive(write.clone()));
    module.set_default("Mention", Term::Primitive(write));
    module.set("StringForm", Term::Primitive(string_form_primitive()));
    module.set("Throw", Term::Primitive(throw_primitive()));
    module.set("Fail", Term::Primitive(fail_primitive()));
}
