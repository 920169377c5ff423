use crate::symbol::StateVar;
use crate::term::{LogicVar, Term};
use std::sync::Arc;

/// A persistent singly-linked list of `(key, value)` binding cells.
///
/// Extension is an O(1) cons; lookup walks from the head and returns the
/// first match. Cells only point backward to older tails, so no cycles can
/// arise and prefixes are shared freely across retained continuations.
/// Failing a branch simply drops the extension; the older list is untouched.
#[derive(Debug, Clone)]
pub struct BindingList<K, V> {
    head: Option<Arc<Cell<K, V>>>,
}

#[derive(Debug)]
struct Cell<K, V> {
    key: K,
    value: V,
    rest: Option<Arc<Cell<K, V>>>,
}

impl<K, V> BindingList<K, V> {
    /// The empty list.
    pub fn empty() -> Self {
        Self { head: None }
    }

    /// True if no bindings have been made.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of cells, counting shadowed bindings.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Non-destructive extension: returns a new list whose head binds
    /// `key` to `value`. `self` is unchanged.
    pub fn bind(&self, key: K, value: V) -> Self {
        Self {
            head: Some(Arc::new(Cell {
                key,
                value,
                rest: self.head.clone(),
            })),
        }
    }

    /// Iterate `(key, value)` pairs, newest binding first. Shadowed cells
    /// are still yielded after the binding that shadows them.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            cell: self.head.as_deref(),
        }
    }
}

impl<K: PartialEq, V> BindingList<K, V> {
    /// First binding for `key`, newest first.
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

impl<K, V> Default for BindingList<K, V> {
    fn default() -> Self {
        Self::empty()
    }
}

pub struct Iter<'a, K, V> {
    cell: Option<&'a Cell<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let cell = self.cell?;
        self.cell = cell.rest.as_deref();
        Some((&cell.key, &cell.value))
    }
}

/// The trail: bindings of local logic variables made on the current
/// search path.
pub type Trail = BindingList<LogicVar, Term>;

/// The dynamic state: bindings of state variables threaded through a
/// top-level call and returned as the new state on success.
pub type State = BindingList<StateVar, Term>;

impl State {
    /// Collapse the state to its effective bindings: the newest cell per
    /// key, oldest-first. Used when `initially` bindings are written back
    /// into the module dictionary.
    pub fn effective(&self) -> Vec<(StateVar, Term)> {
        let mut seen: Vec<StateVar> = Vec::new();
        let mut out: Vec<(StateVar, Term)> = Vec::new();
        for (k, v) in self.iter() {
            if !seen.contains(k) {
                seen.push(*k);
                out.push((*k, v.clone()));
            }
        }
        out.reverse();
        out
    }
}
