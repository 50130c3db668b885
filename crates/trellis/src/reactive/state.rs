use super::runtime::{NodeId, Runtime};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A settable reactive cell.
///
/// Every `set` notifies dependents, even when the new value equals the old
/// one; callers that want deduplication compare before writing.
pub struct State<T: 'static> {
    node: Rc<StateNode<T>>,
}

struct StateNode<T> {
    id: NodeId,
    runtime: Runtime,
    value: RefCell<T>,
}

impl<T> Drop for StateNode<T> {
    fn drop(&mut self) {
        self.runtime.unregister(self.id);
    }
}

impl<T: 'static> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            node: Rc::clone(&self.node),
        }
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for State<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node.value.try_borrow() {
            Ok(value) => f
                .debug_struct("State")
                .field("id", &self.node.id)
                .field("value", &*value)
                .finish(),
            Err(_) => f.debug_struct("State").field("id", &self.node.id).finish(),
        }
    }
}

impl<T: 'static> State<T> {
    pub fn new(runtime: &Runtime, value: T) -> Self {
        Self {
            node: Rc::new(StateNode {
                id: runtime.next_id(),
                runtime: runtime.clone(),
                value: RefCell::new(value),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.node.runtime
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }

    /// Reads the value and records the read in the running computed/effect.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.node.runtime.track(self.node.id);
        self.node.value.borrow().clone()
    }

    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.node.value.borrow().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.node.runtime.track(self.node.id);
        f(&self.node.value.borrow())
    }

    pub fn with_untracked<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.node.value.borrow())
    }

    pub fn set(&self, value: T) {
        let previous = self.node.value.replace(value);
        drop(previous);
        self.node.runtime.notify(self.node.id);
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.node.value.borrow_mut());
        self.node.runtime.notify(self.node.id);
    }

    /// Notifies dependents without changing the value.
    pub fn touch(&self) {
        self.node.runtime.notify(self.node.id);
    }
}
