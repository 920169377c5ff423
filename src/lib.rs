//! steplang - an interpreter for a small logic-and-generation language.
//!
//! Programs are collections of pattern-matched methods that produce text.
//! Each named task has one or more methods guarded by argument patterns;
//! each method body is a chain of steps that emit tokens, call other
//! tasks, branch, or bind variables. Execution is nondeterministic with
//! backtracking: methods are tried in order (optionally shuffled by
//! weight) and logic variables unify across calls. A top-level call
//! yields either generated text plus a final dynamic state, or failure.
//!
//! The evaluation model is direct-style continuation passing: every step
//! takes a success continuation and returns a boolean, with persistent
//! binding lists and an output watermark making backtracking free of
//! cleanup work. Solution-capturing combinators (`DoAll`, `Once`,
//! `ExactlyOnce`, `Max`, `Min`) record output differences and escape the
//! search with a private control signal.

pub mod bindings;
pub mod combinators;
pub mod env;
pub mod error;
pub mod module;
pub mod output;
pub mod parser;
pub mod primitives;
pub mod repl;
pub mod step;
pub mod symbol;
pub mod task;
pub mod term;
pub mod trace;
pub mod unify;

pub use bindings::State;
pub use error::{ErrorKind, EvalError};
pub use module::Module;
pub use term::Term;
