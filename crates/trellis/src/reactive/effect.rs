use super::runtime::{NodeId, Reaction, ReactionKind, Runtime};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// A side effect that re-runs whenever a signal it read changes.
///
/// The closure runs once immediately. Dropping the handle (or calling
/// [`Effect::dispose`]) stops it for good.
#[must_use = "an effect stops as soon as its handle is dropped"]
pub struct Effect {
    node: Rc<EffectNode>,
}

struct EffectNode {
    id: NodeId,
    runtime: Runtime,
    run: RefCell<Box<dyn FnMut()>>,
    disposed: Cell<bool>,
}

impl Reaction for EffectNode {
    fn kind(&self) -> ReactionKind {
        ReactionKind::Effect
    }

    fn mark_dirty(&self) -> bool {
        false
    }

    fn run(&self) {
        if self.disposed.get() {
            return;
        }
        let Ok(mut run) = self.run.try_borrow_mut() else {
            log::debug!("effect {:?} is already running; skipping re-entrant run", self.id);
            return;
        };
        self.runtime
            .batch(|| self.runtime.run_tracked(self.id, || (*run)()));
    }
}

impl Effect {
    pub fn new(runtime: &Runtime, run: impl FnMut() + 'static) -> Self {
        let node = Rc::new(EffectNode {
            id: runtime.next_id(),
            runtime: runtime.clone(),
            run: RefCell::new(Box::new(run)),
            disposed: Cell::new(false),
        });
        let reaction: Rc<dyn Reaction> = node.clone();
        runtime.register(node.id, Rc::downgrade(&reaction));
        node.run();
        Self { node }
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn dispose(&self) {
        if self.node.disposed.replace(true) {
            return;
        }
        self.node.runtime.unregister(self.node.id);
    }

    pub fn is_disposed(&self) -> bool {
        self.node.disposed.get()
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.node.id)
            .field("disposed", &self.node.disposed.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::State;

    #[test]
    fn runs_immediately_and_on_change() {
        let runtime = Runtime::new();
        let count = State::new(&runtime, 0);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let _effect = Effect::new(&runtime, {
            let (count, seen) = (count.clone(), seen.clone());
            move || seen.borrow_mut().push(count.get())
        });
        count.set(1);
        count.set(2);
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn dropping_the_handle_stops_the_effect() {
        let runtime = Runtime::new();
        let count = State::new(&runtime, 0);
        let runs = Rc::new(Cell::new(0));
        let effect = Effect::new(&runtime, {
            let (count, runs) = (count.clone(), runs.clone());
            move || {
                count.get();
                runs.set(runs.get() + 1);
            }
        });
        drop(effect);
        count.set(1);
        assert_eq!(runs.get(), 1);
        assert_eq!(runtime.subscriber_count(count.id()), 0);
    }

    #[test]
    fn batch_coalesces_writes() {
        let runtime = Runtime::new();
        let a = State::new(&runtime, 0);
        let b = State::new(&runtime, 0);
        let runs = Rc::new(Cell::new(0));
        let _effect = Effect::new(&runtime, {
            let (a, b, runs) = (a.clone(), b.clone(), runs.clone());
            move || {
                let _ = a.get() + b.get();
                runs.set(runs.get() + 1);
            }
        });
        runtime.batch(|| {
            a.set(1);
            b.set(1);
            assert_eq!(runtime.pending_effects(), 1);
        });
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn dependencies_are_retracked_on_every_run() {
        let runtime = Runtime::new();
        let use_left = State::new(&runtime, true);
        let left = State::new(&runtime, 1);
        let right = State::new(&runtime, 2);
        let runs = Rc::new(Cell::new(0));
        let _effect = Effect::new(&runtime, {
            let (use_left, left, right, runs) =
                (use_left.clone(), left.clone(), right.clone(), runs.clone());
            move || {
                runs.set(runs.get() + 1);
                if use_left.get() {
                    left.get();
                } else {
                    right.get();
                }
            }
        });
        right.set(3);
        assert_eq!(runs.get(), 1);
        use_left.set(false);
        left.set(4);
        assert_eq!(runs.get(), 2);
        right.set(5);
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn self_feeding_effect_is_cut_off() {
        let runtime = Runtime::with_flush_limit(50);
        let count = State::new(&runtime, 0);
        let _effect = Effect::new(&runtime, {
            let count = count.clone();
            move || {
                let next = count.get() + 1;
                count.set(next);
            }
        });
        assert!(count.get_untracked() <= 52);
        assert_eq!(runtime.pending_effects(), 0);
    }
}
