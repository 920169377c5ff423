use crate::bindings::Trail;
use crate::term::Term;
use smallvec::SmallVec;

#[cfg(feature = "tracing")]
use crate::trace::trace;

/// Dereference a term through the trail: follow variable bindings until a
/// non-variable or an unbound variable is reached. Does not descend into
/// structure. A cyclic variable chain stops at the revisited variable.
pub fn deref(term: &Term, trail: &Trail) -> Term {
    let mut current = term.clone();
    let mut visited: SmallVec<[u64; 8]> = SmallVec::new();
    while let Term::Var(v) = &current {
        if visited.contains(&v.id()) {
            return current;
        }
        visited.push(v.id());
        match trail.lookup(v) {
            Some(bound) => current = bound.clone(),
            None => break,
        }
    }
    current
}

/// Unify two terms against a trail, returning the extended trail on
/// success and `None` on failure. Failure is a value, never an error.
///
/// The unifier is pure: it never mutates existing cells, only conses new
/// ones. There is no occurs check; cyclic terms are undefined behaviour,
/// and callers accepting untrusted input should guard with a depth-bounded
/// walk. Uses an explicit worklist to avoid deep recursion.
pub fn unify(t1: &Term, t2: &Term, trail: &Trail) -> Option<Trail> {
    let mut trail = trail.clone();
    let mut worklist: SmallVec<[(Term, Term); 16]> = SmallVec::new();
    worklist.push((t1.clone(), t2.clone()));

    while let Some((a, b)) = worklist.pop() {
        let a = deref(&a, &trail);
        let b = deref(&b, &trail);

        match (&a, &b) {
            (Term::Var(va), Term::Var(vb)) if va == vb => {}
            (Term::Var(va), _) => {
                trail = trail.bind(*va, b);
            }
            (_, Term::Var(vb)) => {
                trail = trail.bind(*vb, a);
            }
            (Term::Tuple(xs), Term::Tuple(ys)) => {
                if xs.len() != ys.len() {
                    #[cfg(feature = "tracing")]
                    trace!("unify_tuple_length_mismatch");
                    return None;
                }
                for (x, y) in xs.iter().zip(ys.iter()) {
                    worklist.push((x.clone(), y.clone()));
                }
            }
            (Term::Pair(p), Term::Pair(q)) => {
                worklist.push((p.0.clone(), q.0.clone()));
                worklist.push((p.1.clone(), q.1.clone()));
            }
            _ => {
                if a != b {
                    #[cfg(feature = "tracing")]
                    trace!("unify_ground_mismatch");
                    return None;
                }
            }
        }
    }

    Some(trail)
}

/// Unify two term slices elementwise, threading the trail. The slices must
/// be the same length; callers check arity before reaching here.
pub fn unify_all(xs: &[Term], ys: &[Term], trail: &Trail) -> Option<Trail> {
    debug_assert_eq!(xs.len(), ys.len());
    let mut trail = trail.clone();
    for (x, y) in xs.iter().zip(ys.iter()) {
        trail = unify(x, y, &trail)?;
    }
    Some(trail)
}

/// One-way unification: only variables on the `pattern` side may bind.
/// A variable on the value side (other than one the pattern aliases to
/// itself) fails the match, so the value stays untouched. Used by hosts
/// that match against data they do not want instantiated.
pub fn match_term(pattern: &Term, value: &Term, trail: &Trail) -> Option<Trail> {
    let mut trail = trail.clone();
    let mut worklist: SmallVec<[(Term, Term); 16]> = SmallVec::new();
    worklist.push((pattern.clone(), value.clone()));

    while let Some((p, v)) = worklist.pop() {
        let p = deref(&p, &trail);
        let v = deref(&v, &trail);

        match (&p, &v) {
            (Term::Var(vp), Term::Var(vv)) if vp == vv => {}
            (Term::Var(vp), _) => {
                trail = trail.bind(*vp, v);
            }
            (_, Term::Var(_)) => return None,
            (Term::Tuple(xs), Term::Tuple(ys)) => {
                if xs.len() != ys.len() {
                    return None;
                }
                for (x, y) in xs.iter().zip(ys.iter()) {
                    worklist.push((x.clone(), y.clone()));
                }
            }
            (Term::Pair(a), Term::Pair(b)) => {
                worklist.push((a.0.clone(), b.0.clone()));
                worklist.push((a.1.clone(), b.1.clone()));
            }
            _ => {
                if p != v {
                    return None;
                }
            }
        }
    }
    Some(trail)
}

/// Walk a term, replacing bound variables by their values recursively.
/// A still-unbound variable appears as itself in the output, which callers
/// use as the "no value produced" signal.
pub fn copy_term(term: &Term, trail: &Trail) -> Term {
    let t = deref(term, trail);
    match &t {
        Term::Tuple(ts) => {
            let copied: Vec<Term> = ts.iter().map(|x| copy_term(x, trail)).collect();
            Term::Tuple(copied.into())
        }
        Term::Pair(p) => Term::pair(copy_term(&p.0, trail), copy_term(&p.1, trail)),
        _ => t,
    }
}
