use crate::bindings::State;
use crate::env::Env;
use crate::error::{Control, ErrorKind, EvalError};
use crate::output::TextBuffer;
use crate::parser::parse_program;
use crate::symbol::{NameStore, StateVar};
use crate::task::{CompoundTask, Method};
use crate::term::{format_term, FromTerm, LogicVar, Term};
use crate::trace::{TraceEvent, TraceHook};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

/// A hook consulted when dictionary lookup fails; the first hook in chain
/// order that returns a value wins, and the value is cached in the module
/// where the lookup was initiated.
pub type BindHook = Arc<dyn Fn(StateVar, &NameStore) -> Option<Term> + Send + Sync>;

/// The name of the pseudo-task run at definition-load time.
const INITIALLY: &str = "initially";

/// The task defined and invoked by `parse_and_execute`.
const TOP_LEVEL_CALL: &str = "TopLevelCall";

/// Named storage for tasks and state variables, with an optional parent
/// chain for lookup.
///
/// The dictionary is the only mutable shared state in an evaluation; two
/// concurrent top-level calls on the same module are unsafe and separate
/// threads should use separate modules.
pub struct Module {
    names: Arc<NameStore>,
    dict: RwLock<HashMap<StateVar, Term>>,
    /// Pluggable default bindings, consulted after parents and hooks.
    defaults: RwLock<HashMap<StateVar, Term>>,
    parent: Option<Arc<Module>>,
    bind_hooks: RwLock<Vec<BindHook>>,
    trace_hook: RwLock<Option<TraceHook>>,
}

impl Module {
    /// A fresh root module with the built-in primitives and combinators
    /// installed.
    pub fn new() -> Arc<Self> {
        let module = Arc::new(Self {
            names: Arc::new(NameStore::new()),
            dict: RwLock::new(HashMap::new()),
            defaults: RwLock::new(HashMap::new()),
            parent: None,
            bind_hooks: RwLock::new(Vec::new()),
            trace_hook: RwLock::new(None),
        });
        crate::primitives::install(&module);
        crate::combinators::install(&module);
        module
    }

    /// A child module sharing the parent's name store. Lookups fall back
    /// to the parent; writes stay local.
    pub fn with_parent(parent: Arc<Module>) -> Arc<Self> {
        Arc::new(Self {
            names: parent.names.clone(),
            dict: RwLock::new(HashMap::new()),
            defaults: RwLock::new(HashMap::new()),
            parent: Some(parent),
            bind_hooks: RwLock::new(Vec::new()),
            trace_hook: RwLock::new(None),
        })
    }

    pub fn names(&self) -> &NameStore {
        &self.names
    }

    /// Intern a state-variable name in this module family.
    pub fn intern(&self, name: &str) -> StateVar {
        self.names.intern(name)
    }

    /// Bind `name` in this module's dictionary.
    pub fn set(&self, name: &str, value: Term) {
        let sv = self.names.intern(name);
        self.dict.write().insert(sv, value);
    }

    /// Seed the default-bindings table.
    pub fn set_default(&self, name: &str, value: Term) {
        let sv = self.names.intern(name);
        self.defaults.write().insert(sv, value);
    }

    /// Read a binding by name, through the full lookup chain.
    pub fn get(&self, name: &str) -> Option<Term> {
        let sv = self.names.get(name)?;
        self.lookup(sv)
    }

    /// True if this module (not a parent) binds `name` directly.
    pub fn defines(&self, name: &str) -> bool {
        match self.names.get(name) {
            Some(sv) => self.dict.read().contains_key(&sv),
            None => false,
        }
    }

    /// Register a bind hook on this module.
    pub fn add_bind_hook(&self, hook: BindHook) {
        self.bind_hooks.write().push(hook);
    }

    /// Subscribe to trace events for calls evaluated against this module.
    pub fn set_trace_hook(&self, hook: Option<TraceHook>) {
        *self.trace_hook.write() = hook;
    }

    /// Report a trace event. The event is only constructed when a hook is
    /// installed somewhere on the chain.
    pub fn emit_trace<F: FnOnce() -> TraceEvent>(&self, make: F) {
        let mut module = Some(self);
        while let Some(m) = module {
            let hook = m.trace_hook.read().clone();
            if let Some(hook) = hook {
                hook(&make());
                return;
            }
            module = m.parent.as_deref();
        }
    }

    /// Full lookup: own dictionary, then the parent chain, then bind hooks
    /// in the same chain order, then the default-bindings tables. A value
    /// supplied by a hook is cached in this module (the one where the
    /// lookup initiated), so derived values shadow the parent afterwards.
    pub fn lookup(&self, sv: StateVar) -> Option<Term> {
        let mut module = Some(self);
        while let Some(m) = module {
            if let Some(v) = m.dict.read().get(&sv) {
                return Some(v.clone());
            }
            module = m.parent.as_deref();
        }

        let mut module = Some(self);
        while let Some(m) = module {
            let hooks = m.bind_hooks.read().clone();
            for hook in hooks {
                if let Some(v) = hook(sv, &self.names) {
                    self.dict.write().insert(sv, v.clone());
                    return Some(v);
                }
            }
            module = m.parent.as_deref();
        }

        let mut module = Some(self);
        while let Some(m) = module {
            if let Some(v) = m.defaults.read().get(&sv) {
                return Some(v.clone());
            }
            module = m.parent.as_deref();
        }

        None
    }

    /// Find the compound task bound to `name`, creating it when asked.
    /// An existing task with a different arity, or a name bound to a
    /// non-task value, is an error.
    pub fn find_task(
        &self,
        name: &str,
        arity: usize,
        create: bool,
    ) -> Result<Arc<CompoundTask>, EvalError> {
        let sv = self.names.intern(name);
        if let Some(existing) = self.lookup(sv) {
            return match existing {
                Term::Task(t) => {
                    if t.arity() != arity {
                        Err(EvalError::new(ErrorKind::ArgumentCount {
                            task: name.to_string(),
                            expected: t.arity(),
                            got: arity,
                        }))
                    } else {
                        Ok(t)
                    }
                }
                other => Err(EvalError::new(ErrorKind::ArgumentType {
                    task: name.to_string(),
                    message: format!(
                        "bound to {}, not a compound task",
                        format_term(&other, &self.names)
                    ),
                })),
            };
        }
        if create {
            let task = Arc::new(CompoundTask::new(sv, arity));
            self.dict.write().insert(sv, Term::Task(task.clone()));
            Ok(task)
        } else {
            Err(EvalError::new(ErrorKind::UndefinedVariable {
                name: name.to_string(),
            }))
        }
    }

    /// Remove all methods from `name`, resetting its flags. A no-op if
    /// the name is unbound or not a task.
    pub fn erase_methods(&self, name: &str) {
        if let Some(Term::Task(t)) = self.names.get(name).and_then(|sv| self.lookup(sv)) {
            t.erase_methods();
        }
    }

    /// Drive a top-level call. On success returns the generated text and
    /// the final dynamic state; on exhausted search returns `(None,
    /// State::empty())`. Errors surface as `Err` with their stack data.
    pub fn call(
        self: &Arc<Self>,
        state: &State,
        task: &str,
        args: &[Term],
    ) -> Result<(Option<String>, State), EvalError> {
        let mut buf = TextBuffer::new();
        let mut captured: Option<(String, State)> = None;
        let succeeded = self.drive(state, task, args, &mut buf, &mut |b, e| {
            captured = Some((b.format(), e.state.clone()));
            Ok(true)
        })?;
        if succeeded {
            if let Some((text, new_state)) = captured {
                return Ok((Some(text), new_state));
            }
        }
        Ok((None, State::empty()))
    }

    /// Like `call`, but for tasks used as tests: output is rejected and
    /// only success or failure is reported.
    pub fn call_predicate(
        self: &Arc<Self>,
        state: &State,
        task: &str,
        args: &[Term],
    ) -> Result<bool, EvalError> {
        let mut buf = TextBuffer::new();
        let succeeded = self.drive(state, task, args, &mut buf, &mut |_b, _e| Ok(true))?;
        if succeeded && !buf.is_empty() {
            return Err(EvalError::new(ErrorKind::ArgumentType {
                task: task.to_string(),
                message: "produced output in predicate position".into(),
            }));
        }
        Ok(succeeded)
    }

    /// Call a task as a function: a fresh variable is appended to the
    /// arguments and its final value returned. Raises `CallFailed` when
    /// the task fails, `ArgumentInstantiation` when the result variable is
    /// still unbound, and `ArgumentType` when it cannot convert to `T`.
    pub fn call_function<T: FromTerm>(
        self: &Arc<Self>,
        state: &State,
        task: &str,
        args: &[Term],
    ) -> Result<T, EvalError> {
        let result_var = LogicVar::fresh(None);
        let mut full_args: Vec<Term> = args.to_vec();
        full_args.push(Term::Var(result_var));

        let mut buf = TextBuffer::new();
        let mut captured: Option<Term> = None;
        let succeeded = self.drive(state, task, &full_args, &mut buf, &mut |_b, e| {
            captured = Some(e.resolve(&Term::Var(result_var)));
            Ok(true)
        })?;

        if !succeeded {
            return Err(EvalError::new(ErrorKind::CallFailed {
                task: task.to_string(),
                args: args
                    .iter()
                    .map(|a| format_term(a, &self.names))
                    .collect::<Vec<_>>()
                    .join(" "),
            }));
        }
        match captured {
            Some(Term::Var(_)) | None => Err(EvalError::new(ErrorKind::ArgumentInstantiation {
                task: task.to_string(),
                message: "function result is unbound".into(),
            })),
            Some(value) => T::from_term(&value).ok_or_else(|| {
                EvalError::new(ErrorKind::ArgumentType {
                    task: task.to_string(),
                    message: format!(
                        "result {} is not a {}",
                        format_term(&value, &self.names),
                        T::expected()
                    ),
                })
            }),
        }
    }

    /// Resolve the target and run the call driver against a fresh root
    /// environment, translating the control channel at the boundary.
    fn drive(
        self: &Arc<Self>,
        state: &State,
        task: &str,
        args: &[Term],
        buf: &mut TextBuffer,
        k: &mut dyn FnMut(&mut TextBuffer, &Env) -> crate::error::Try,
    ) -> Result<bool, EvalError> {
        let env = Env::new(self.clone(), state.clone());
        let sv = self.names.intern(task);
        let target = env
            .state
            .lookup(&sv)
            .cloned()
            .or_else(|| self.lookup(sv))
            .ok_or_else(|| {
                EvalError::new(ErrorKind::UndefinedVariable {
                    name: task.to_string(),
                })
            })?;

        let outcome = match &target {
            Term::Task(ct) => ct.call(args, buf, &env, k),
            Term::Primitive(p) => p.invoke(&env.resolve_all(args), buf, &env, k),
            other => Err(Control::Err(EvalError::new(ErrorKind::ArgumentType {
                task: task.to_string(),
                message: format!(
                    "bound to {}, which is not callable",
                    format_term(other, &self.names)
                ),
            }))),
        };

        match outcome {
            Ok(ok) => Ok(ok),
            Err(Control::Err(e)) => Err(e),
            Err(Control::Exit(..)) => {
                unreachable!("non-local exit escaped its combinator")
            }
        }
    }

    /// Parse and install method definitions from in-memory sources. If a
    /// batch defines the `initially` pseudo-task, it is run once and the
    /// surviving dynamic bindings become module state.
    pub fn add_definitions(self: &Arc<Self>, sources: &[&str]) -> Result<(), EvalError> {
        let mut defined_initially = false;
        for source in sources {
            defined_initially |= self.install_source(source, "<definitions>")?;
        }
        if defined_initially {
            self.run_initially()?;
        }
        Ok(())
    }

    /// Load definitions from a `.step` file.
    pub fn load_definitions(self: &Arc<Self>, path: &Path) -> Result<(), EvalError> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            EvalError::new(ErrorKind::Syntax {
                message: format!("cannot read file: {}", e),
                path: path.display().to_string(),
                line: 0,
            })
        })?;
        let defined_initially =
            self.install_source(&source, &path.display().to_string())?;
        if defined_initially {
            self.run_initially()?;
        }
        Ok(())
    }

    /// Load every `.step` file in a directory, optionally recursing.
    /// Files load in name order so runs are reproducible.
    pub fn load_directory(self: &Arc<Self>, path: &Path, recursive: bool) -> Result<(), EvalError> {
        let mut entries: Vec<_> = std::fs::read_dir(path)
            .map_err(|e| {
                EvalError::new(ErrorKind::Syntax {
                    message: format!("cannot read directory: {}", e),
                    path: path.display().to_string(),
                    line: 0,
                })
            })?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        entries.sort();

        for entry in entries {
            if entry.is_dir() {
                if recursive {
                    self.load_directory(&entry, true)?;
                }
            } else if entry.extension().is_some_and(|ext| ext == "step") {
                self.load_definitions(&entry)?;
            }
        }
        Ok(())
    }

    /// Define (or redefine) `TopLevelCall` from `code` and call it.
    pub fn parse_and_execute(
        self: &Arc<Self>,
        code: &str,
    ) -> Result<(Option<String>, State), EvalError> {
        self.erase_methods(TOP_LEVEL_CALL);
        let source = format!("{}: {}", TOP_LEVEL_CALL, code);
        self.install_source(&source, "<top level>")?;
        self.call(&State::empty(), TOP_LEVEL_CALL, &[])
    }

    /// Install one source's definitions. Returns whether it defined the
    /// `initially` pseudo-task.
    fn install_source(self: &Arc<Self>, source: &str, path: &str) -> Result<bool, EvalError> {
        let definitions = parse_program(source, path, &self.names)?;
        let mut defined_initially = false;
        for def in definitions {
            defined_initially |= def.task == INITIALLY;
            let task = self.find_task(&def.task, def.pattern.len(), true)?;
            let method = Method::new(
                self.names.intern(&def.task),
                def.pattern,
                def.locals,
                def.chain,
                def.weight,
                Arc::from(path),
                def.line,
            );
            task.add_method(method, def.flags, &def.task)?;
        }
        Ok(defined_initially)
    }

    /// Run `initially` with empty state and write its surviving dynamic
    /// bindings into the module dictionary.
    fn run_initially(self: &Arc<Self>) -> Result<(), EvalError> {
        let (_, state) = self.call(&State::empty(), INITIALLY, &[])?;
        for (sv, value) in state.effective() {
            self.dict.write().insert(sv, value);
        }
        Ok(())
    }
}
