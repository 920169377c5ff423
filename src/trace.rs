//! Diagnostics: source-level trace events plus feature-gated structured
//! logging.
//!
//! Engine internals log through the `tracing` crate when the `tracing`
//! feature is enabled; every call site is itself feature-gated, so a
//! default build carries zero instrumentation overhead.
//!
//! Independent of that feature, the engine reports method entry, success,
//! and failure through an optional per-module [`TraceHook`], which is what
//! source-level debuggers and test harnesses subscribe to.

use std::sync::Arc;

#[cfg(feature = "tracing")]
pub use tracing::{debug, debug_span, error, info, trace, trace_span, warn};

/// One step of the proof search, reported through the module's trace hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// A method's pattern matched and its body chain is starting.
    Enter { task: String, line: u32 },
    /// A method's chain reached its continuation.
    Succeed { task: String, line: u32 },
    /// A method's chain was exhausted without success.
    MethodFail { task: String, line: u32 },
    /// A task exhausted all of its methods.
    CallFail { task: String },
}

/// Subscriber for trace events. Kept cheap to test against: hooks receive
/// borrowed events and must not re-enter the evaluator.
pub type TraceHook = Arc<dyn Fn(&TraceEvent) + Send + Sync>;

/// Initialize a stderr `tracing` subscriber honouring `RUST_LOG`.
/// Safe to call more than once; later calls are ignored.
#[cfg(feature = "tracing")]
pub fn init_subscriber() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_ansi(false),
        )
        .with(filter)
        .try_init()
        .ok();
}

#[cfg(not(feature = "tracing"))]
pub fn init_subscriber() {}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn hooks_observe_events() {
        let seen: Arc<Mutex<Vec<TraceEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hook: TraceHook = Arc::new(move |ev| sink.lock().push(ev.clone()));

        hook(&TraceEvent::Enter {
            task: "Greet".into(),
            line: 3,
        });
        hook(&TraceEvent::CallFail {
            task: "Greet".into(),
        });

        let events = seen.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TraceEvent::Enter { .. }));
    }
}
