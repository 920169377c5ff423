use lasso::{Spur, ThreadedRodeo};

/// Identity of a state variable: an interned name.
/// Two interns of the same string always yield the same `StateVar`.
pub type StateVar = Spur;

/// Thread-safe store for interning state-variable and task names.
///
/// Guarantees:
/// - Same string always produces the same StateVar
/// - Different strings always produce different StateVars
/// - A StateVar can be resolved back to the original string
pub struct NameStore {
    rodeo: ThreadedRodeo,
}

impl NameStore {
    /// Create a new empty name store.
    pub fn new() -> Self {
        Self {
            rodeo: ThreadedRodeo::new(),
        }
    }

    /// Intern a name, returning its unique StateVar.
    /// If the name was already interned, returns the existing StateVar.
    pub fn intern(&self, name: &str) -> StateVar {
        self.rodeo.get_or_intern(name)
    }

    /// Resolve a StateVar back to its string representation.
    /// Returns None if the StateVar was not created by this store.
    pub fn resolve(&self, var: StateVar) -> Option<&str> {
        self.rodeo.try_resolve(&var)
    }

    /// Get the StateVar for a name if it exists, without interning.
    pub fn get(&self, name: &str) -> Option<StateVar> {
        self.rodeo.get(name)
    }

    /// Check if a name has already been interned.
    pub fn contains(&self, name: &str) -> bool {
        self.rodeo.contains(name)
    }
}

impl Default for NameStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_same_name_returns_same_var() {
        let store = NameStore::new();
        let a = store.intern("Mention");
        let b = store.intern("Mention");
        assert_eq!(a, b, "Interning the same name twice should return identical StateVars");
    }

    #[test]
    fn intern_different_names_returns_different_vars() {
        let store = NameStore::new();
        let a = store.intern("Speaker");
        let b = store.intern("Listener");
        assert_ne!(a, b);
    }

    #[test]
    fn resolve_returns_original_name() {
        let store = NameStore::new();
        let v = store.intern("CurrentTopic");
        assert_eq!(store.resolve(v), Some("CurrentTopic"));
    }

    #[test]
    fn get_without_interning() {
        let store = NameStore::new();
        let v = store.intern("Write");
        assert_eq!(store.get("Write"), Some(v));
        assert_eq!(store.get("NeverSeen"), None);
    }

    #[test]
    fn contains_reflects_interning() {
        let store = NameStore::new();
        store.intern("Test");
        assert!(store.contains("Test"));
        assert!(!store.contains("test"), "names are case sensitive");
    }

    #[test]
    fn concurrent_intern_same_name() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(NameStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.intern("Shared"))
            })
            .collect();

        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for id in &ids {
            assert_eq!(*id, ids[0], "all threads should agree on the StateVar");
        }
    }
}
