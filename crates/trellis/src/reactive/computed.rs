use super::runtime::{NodeId, Reaction, ReactionKind, Runtime};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

type ComputeFn<T> = Box<dyn FnMut(Option<&T>) -> T>;

/// A lazily derived, read-only reactive value.
///
/// The value is recomputed on the first read after any dependency changed;
/// unrelated writes never trigger a recomputation.
pub struct Computed<T: 'static> {
    node: Rc<ComputedNode<T>>,
}

struct ComputedNode<T> {
    id: NodeId,
    runtime: Runtime,
    value: RefCell<Option<T>>,
    dirty: Cell<bool>,
    computing: Cell<bool>,
    compute: RefCell<ComputeFn<T>>,
}

impl<T> Drop for ComputedNode<T> {
    fn drop(&mut self) {
        self.runtime.unregister(self.id);
    }
}

impl<T: 'static> Reaction for ComputedNode<T> {
    fn kind(&self) -> ReactionKind {
        ReactionKind::Computed
    }

    fn mark_dirty(&self) -> bool {
        !self.dirty.replace(true)
    }

    fn run(&self) {}
}

impl<T: 'static> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            node: Rc::clone(&self.node),
        }
    }
}

impl<T: 'static> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.node.id)
            .field("dirty", &self.node.dirty.get())
            .finish()
    }
}

impl<T: Clone + 'static> Computed<T> {
    pub fn new(runtime: &Runtime, mut compute: impl FnMut() -> T + 'static) -> Self {
        Self::with_previous(runtime, move |_| compute())
    }

    /// Like [`Computed::new`], but the closure also receives the last value,
    /// which lets it keep that value when a recomputation fails.
    pub fn with_previous(
        runtime: &Runtime,
        compute: impl FnMut(Option<&T>) -> T + 'static,
    ) -> Self {
        let node = Rc::new(ComputedNode {
            id: runtime.next_id(),
            runtime: runtime.clone(),
            value: RefCell::new(None),
            dirty: Cell::new(true),
            computing: Cell::new(false),
            compute: RefCell::new(Box::new(compute)),
        });
        let reaction: Rc<dyn Reaction> = node.clone();
        runtime.register(node.id, Rc::downgrade(&reaction));
        Self { node }
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }

    pub fn is_dirty(&self) -> bool {
        self.node.dirty.get()
    }

    /// Tracked read. Returns `None` only when a computed reads itself before
    /// it ever produced a value.
    pub fn try_get(&self) -> Option<T> {
        self.node.runtime.track(self.node.id);
        self.get_untracked()
    }

    pub fn get(&self) -> T
    where
        T: Default,
    {
        self.try_get().unwrap_or_default()
    }

    pub fn get_untracked(&self) -> Option<T> {
        let node = &self.node;
        if node.computing.get() {
            log::warn!("computed {:?} read itself while recomputing", node.id);
            return None;
        }
        if node.dirty.get() {
            self.recompute();
        }
        node.value.borrow().clone()
    }

    fn recompute(&self) {
        let node = &self.node;
        node.runtime.batch(|| {
            node.computing.set(true);
            node.dirty.set(false);
            let previous = node.value.borrow_mut().take();
            let next = node.runtime.run_tracked(node.id, || {
                let mut compute = node.compute.borrow_mut();
                (*compute)(previous.as_ref())
            });
            *node.value.borrow_mut() = Some(next);
            node.computing.set(false);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Effect, State};

    #[test]
    fn recomputes_lazily_and_only_when_a_read_source_changes() {
        let runtime = Runtime::new();
        let a = State::new(&runtime, 2);
        let unrelated = State::new(&runtime, 0);
        let computations = Rc::new(Cell::new(0));
        let doubled = Computed::new(&runtime, {
            let a = a.clone();
            let computations = computations.clone();
            move || {
                computations.set(computations.get() + 1);
                a.get() * 2
            }
        });
        assert_eq!(computations.get(), 0);
        assert_eq!(doubled.get(), 4);
        assert_eq!(doubled.get(), 4);
        assert_eq!(computations.get(), 1);

        unrelated.set(1);
        assert_eq!(doubled.get(), 4);
        assert_eq!(computations.get(), 1);

        a.set(5);
        assert_eq!(doubled.get(), 10);
        assert_eq!(computations.get(), 2);
    }

    #[test]
    fn effects_downstream_of_a_computed_rerun() {
        let runtime = Runtime::new();
        let name = State::new(&runtime, "ada".to_owned());
        let upper = Computed::new(&runtime, {
            let name = name.clone();
            move || name.get().to_uppercase()
        });
        let seen = Rc::new(RefCell::new(Vec::new()));
        let _effect = Effect::new(&runtime, {
            let upper = upper.clone();
            let seen = seen.clone();
            move || seen.borrow_mut().push(upper.get())
        });
        name.set("grace".to_owned());
        assert_eq!(*seen.borrow(), vec!["ADA".to_owned(), "GRACE".to_owned()]);
    }

    #[test]
    fn previous_value_is_available_to_the_closure() {
        let runtime = Runtime::new();
        let input = State::new(&runtime, Some(1));
        let sticky = Computed::with_previous(&runtime, {
            let input = input.clone();
            move |previous: Option<&i32>| match input.get() {
                Some(value) => value,
                None => previous.copied().unwrap_or_default(),
            }
        });
        assert_eq!(sticky.get(), 1);
        input.set(None);
        assert_eq!(sticky.get(), 1);
        input.set(Some(7));
        assert_eq!(sticky.get(), 7);
    }

    #[test]
    fn diamond_recomputes_once_per_change() {
        let runtime = Runtime::new();
        let source = State::new(&runtime, 1);
        let left = Computed::new(&runtime, {
            let source = source.clone();
            move || source.get() + 1
        });
        let right = Computed::new(&runtime, {
            let source = source.clone();
            move || source.get() * 10
        });
        let runs = Rc::new(Cell::new(0));
        let _effect = Effect::new(&runtime, {
            let (left, right, runs) = (left.clone(), right.clone(), runs.clone());
            move || {
                let _ = left.get() + right.get();
                runs.set(runs.get() + 1);
            }
        });
        source.set(2);
        assert_eq!(runs.get(), 2);
        assert_eq!(left.get() + right.get(), 23);
    }
}
