//! State container: the single writer of a set's membership.

use std::sync::Arc;
use synset_protocol::{apply, MemberSet, Operation};

/// Callback invoked with the new membership after it changes.
pub type Listener<T> = Arc<dyn Fn(&MemberSet<T>) + Send + Sync>;

/// An operation tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directed<T> {
    /// Originated on this node: apply, then forward to peers.
    Local(Operation<T>),
    /// Received from a peer or the store: apply only.
    Remote(Operation<T>),
}

/// Input to the reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action<T> {
    /// Apply an operation.
    Apply(Directed<T>),
    /// Resubmit an already-applied operation to the forwarding path.
    Forward(Operation<T>),
    /// A payload that was not recognized; leaves state unchanged.
    Unrecognized,
}

/// Computes the next state and the operation to forward, if any.
pub fn reduce<T: Clone>(state: &MemberSet<T>, action: Action<T>) -> (MemberSet<T>, Option<Operation<T>>) {
    match action {
        Action::Apply(Directed::Local(op)) => (apply(state, &op), Some(op)),
        Action::Apply(Directed::Remote(op)) => (apply(state, &op), None),
        Action::Forward(op) => (state.clone(), Some(op)),
        Action::Unrecognized => (state.clone(), None),
    }
}

/// Outcome of one dispatched action.
#[derive(Debug)]
pub struct Dispatch<T> {
    /// Operation to hand to the outbound path.
    pub forward: Option<Operation<T>>,
    /// New membership, present only if it differs from the last one
    /// notified.
    pub changed: Option<MemberSet<T>>,
}

/// Holds the current membership and the change listeners.
pub struct StateContainer<T> {
    state: MemberSet<T>,
    last_notified: MemberSet<T>,
    listeners: Vec<Listener<T>>,
}

impl<T: Clone> StateContainer<T> {
    /// Creates a container holding the empty set.
    pub fn new() -> Self {
        Self {
            state: MemberSet::new(),
            last_notified: MemberSet::new(),
            listeners: Vec::new(),
        }
    }

    /// Returns the current membership.
    pub fn state(&self) -> &MemberSet<T> {
        &self.state
    }

    /// Runs an action through the reducer.
    pub fn dispatch(&mut self, action: Action<T>) -> Dispatch<T> {
        let (next, forward) = reduce(&self.state, action);
        self.state = next;

        let changed = if self.state != self.last_notified {
            self.last_notified = self.state.clone();
            Some(self.state.clone())
        } else {
            None
        };

        Dispatch { forward, changed }
    }

    /// Registers a change listener.
    pub fn subscribe(&mut self, listener: Listener<T>) {
        self.listeners.push(listener);
    }

    /// Returns the listeners in registration order.
    pub fn listeners(&self) -> Vec<Listener<T>> {
        self.listeners.clone()
    }
}

impl<T: Clone> Default for StateContainer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synset_protocol::Member;

    fn set_of(values: &[i64]) -> MemberSet<i64> {
        values.iter().map(|v| Member::new(*v).unwrap()).collect()
    }

    #[test]
    fn local_operations_are_forwarded() {
        let op = Operation::add(1i64).unwrap();
        let (state, forward) = reduce(&MemberSet::new(), Action::Apply(Directed::Local(op.clone())));
        assert_eq!(state, set_of(&[1]));
        assert_eq!(forward, Some(op));
    }

    #[test]
    fn remote_operations_are_not_forwarded() {
        let op = Operation::add(1i64).unwrap();
        let (state, forward) = reduce(&MemberSet::new(), Action::Apply(Directed::Remote(op)));
        assert_eq!(state, set_of(&[1]));
        assert_eq!(forward, None);
    }

    #[test]
    fn forward_requests_do_not_reapply() {
        let state = set_of(&[2]);
        let op = Operation::<i64>::Clear;
        let (next, forward) = reduce(&state, Action::Forward(op.clone()));
        assert_eq!(next, state);
        assert_eq!(forward, Some(op));
    }

    #[test]
    fn unrecognized_leaves_state() {
        let state = set_of(&[3]);
        let (next, forward) = reduce(&state, Action::Unrecognized);
        assert_eq!(next, state);
        assert!(forward.is_none());
    }

    #[test]
    fn dispatch_reports_only_real_changes() {
        let mut container = StateContainer::new();

        let first = container.dispatch(Action::Apply(Directed::Remote(
            Operation::add(1i64).unwrap(),
        )));
        assert_eq!(first.changed, Some(set_of(&[1])));

        let again = container.dispatch(Action::Apply(Directed::Remote(
            Operation::add(1i64).unwrap(),
        )));
        assert!(again.changed.is_none());

        let absent = container.dispatch(Action::Apply(Directed::Remote(
            Operation::remove(7i64).unwrap(),
        )));
        assert!(absent.changed.is_none());
    }

    #[test]
    fn changes_compare_against_last_notified() {
        let mut container = StateContainer::new();
        container.dispatch(Action::Apply(Directed::Local(
            Operation::replace_all([1i64, 2]).unwrap(),
        )));

        // Same membership built from a different operation.
        let replay = container.dispatch(Action::Apply(Directed::Local(
            Operation::replace_all([2i64, 1, 1]).unwrap(),
        )));
        assert!(replay.changed.is_none());
        assert!(replay.forward.is_some());
    }

    #[test]
    fn listeners_keep_registration_order() {
        let mut container: StateContainer<i64> = StateContainer::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for id in 0..3 {
            let seen = Arc::clone(&seen);
            container.subscribe(Arc::new(move |_: &MemberSet<i64>| seen.lock().push(id)));
        }
        for listener in container.listeners() {
            listener(container.state());
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }
}
