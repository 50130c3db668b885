//! Dependency graph and scheduler shared by every signal of one session.
//!
//! The runtime keeps three tables:
//!
//! - `subscribers`: source node -> reactions that read it during their last run
//! - `sources`: reaction -> nodes it read during its last run
//! - `reactions`: weak handles to live computeds and effects
//!
//! Writes push "dirty" through computeds (which recompute lazily on the next
//! read) and queue effects. The queue is flushed synchronously once the
//! outermost write or batch returns.

use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};

pub const DEFAULT_MAX_FLUSH_ITERATIONS: usize = 10_000;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReactionKind {
    Computed,
    Effect,
}

pub(crate) trait Reaction {
    fn kind(&self) -> ReactionKind;
    /// Returns `true` when the node just transitioned from clean to dirty.
    fn mark_dirty(&self) -> bool;
    fn run(&self);
}

type Sources = SmallVec<[NodeId; 4]>;

struct RuntimeInner {
    next_id: Cell<u64>,
    observers: RefCell<Vec<Option<NodeId>>>,
    sources: RefCell<HashMap<NodeId, Sources>>,
    subscribers: RefCell<HashMap<NodeId, Sources>>,
    reactions: RefCell<HashMap<NodeId, Weak<dyn Reaction>>>,
    pending: RefCell<VecDeque<NodeId>>,
    queued: RefCell<HashSet<NodeId>>,
    batch_depth: Cell<u32>,
    flushing: Cell<bool>,
    max_flush_iterations: usize,
}

/// Handle to one reactive graph. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("reactions", &self.inner.reactions.borrow().len())
            .field("pending", &self.inner.pending.borrow().len())
            .finish()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_flush_limit(DEFAULT_MAX_FLUSH_ITERATIONS)
    }

    /// `max_flush_iterations` bounds how many effect runs one flush may
    /// perform before the queue is dropped as a runaway cycle.
    pub fn with_flush_limit(max_flush_iterations: usize) -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                next_id: Cell::new(0),
                observers: RefCell::new(Vec::new()),
                sources: RefCell::new(HashMap::new()),
                subscribers: RefCell::new(HashMap::new()),
                reactions: RefCell::new(HashMap::new()),
                pending: RefCell::new(VecDeque::new()),
                queued: RefCell::new(HashSet::new()),
                batch_depth: Cell::new(0),
                flushing: Cell::new(false),
                max_flush_iterations: max_flush_iterations.max(1),
            }),
        }
    }

    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Defers effect execution until `f` returns; nested batches flush once.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.batch_depth.set(self.inner.batch_depth.get() + 1);
        let _guard = BatchGuard { runtime: self };
        f()
    }

    /// Runs `f` without recording any signal reads as dependencies.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.observers.borrow_mut().push(None);
        let _guard = ObserverGuard { runtime: self };
        f()
    }

    /// Whether a computed or effect is currently recording reads.
    pub fn is_tracking(&self) -> bool {
        matches!(self.inner.observers.borrow().last(), Some(Some(_)))
    }

    pub fn pending_effects(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Runs queued effects until the queue is empty.
    pub fn flush(&self) {
        if self.inner.flushing.get() {
            return;
        }
        self.inner.flushing.set(true);
        let mut iterations = 0usize;
        loop {
            let next = self.inner.pending.borrow_mut().pop_front();
            let Some(id) = next else {
                break;
            };
            self.inner.queued.borrow_mut().remove(&id);
            iterations += 1;
            if iterations > self.inner.max_flush_iterations {
                let dropped = self.inner.pending.borrow().len() + 1;
                log::error!(
                    "reactive flush exceeded {} effect runs; dropping {dropped} queued effects (update cycle?)",
                    self.inner.max_flush_iterations
                );
                self.inner.pending.borrow_mut().clear();
                self.inner.queued.borrow_mut().clear();
                break;
            }
            let reaction = self.reaction(id);
            if let Some(reaction) = reaction {
                reaction.run();
            }
        }
        self.inner.flushing.set(false);
    }

    pub(crate) fn next_id(&self) -> NodeId {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        NodeId(id)
    }

    pub(crate) fn register(&self, id: NodeId, reaction: Weak<dyn Reaction>) {
        self.inner.reactions.borrow_mut().insert(id, reaction);
    }

    /// Forgets a node entirely. Called from `Drop`, so it never panics on a
    /// busy table; stale entries are skipped later because their weak handle
    /// no longer upgrades.
    pub(crate) fn unregister(&self, id: NodeId) {
        if let Ok(mut reactions) = self.inner.reactions.try_borrow_mut() {
            reactions.remove(&id);
        }
        self.clear_sources(id);
        if let Ok(mut subscribers) = self.inner.subscribers.try_borrow_mut() {
            subscribers.remove(&id);
        }
    }

    /// Records that the running reaction read `source`.
    pub(crate) fn track(&self, source: NodeId) {
        let observer = match self.inner.observers.borrow().last() {
            Some(Some(observer)) => *observer,
            _ => return,
        };
        if observer == source {
            return;
        }
        {
            let mut sources = self.inner.sources.borrow_mut();
            let entry = sources.entry(observer).or_default();
            if entry.contains(&source) {
                return;
            }
            entry.push(source);
        }
        let mut subscribers = self.inner.subscribers.borrow_mut();
        let entry = subscribers.entry(source).or_default();
        if !entry.contains(&observer) {
            entry.push(observer);
        }
    }

    /// Runs `f` as reaction `id`, replacing its previous dependency set.
    /// Callers wrap this in [`Runtime::batch`] so writes made by `f` are
    /// flushed only after the reaction has stored its result.
    pub(crate) fn run_tracked<R>(&self, id: NodeId, f: impl FnOnce() -> R) -> R {
        self.clear_sources(id);
        self.inner.observers.borrow_mut().push(Some(id));
        let _observer = ObserverGuard { runtime: self };
        f()
    }

    /// Propagates a change of `source` to everything that read it.
    pub(crate) fn notify(&self, source: NodeId) {
        self.mark_subscribers(source);
        if self.inner.batch_depth.get() == 0 {
            self.flush();
        }
    }

    fn mark_subscribers(&self, source: NodeId) {
        let subscribers: Sources = self
            .inner
            .subscribers
            .borrow()
            .get(&source)
            .cloned()
            .unwrap_or_default();
        for subscriber in subscribers {
            let Some(reaction) = self.reaction(subscriber) else {
                continue;
            };
            match reaction.kind() {
                ReactionKind::Computed => {
                    if reaction.mark_dirty() {
                        self.mark_subscribers(subscriber);
                    }
                }
                ReactionKind::Effect => self.enqueue(subscriber),
            }
        }
    }

    fn enqueue(&self, id: NodeId) {
        if self.inner.queued.borrow_mut().insert(id) {
            self.inner.pending.borrow_mut().push_back(id);
        }
    }

    fn reaction(&self, id: NodeId) -> Option<Rc<dyn Reaction>> {
        let weak = self.inner.reactions.borrow().get(&id).cloned()?;
        weak.upgrade()
    }

    fn clear_sources(&self, id: NodeId) {
        let previous = match self.inner.sources.try_borrow_mut() {
            Ok(mut sources) => sources.remove(&id),
            Err(_) => return,
        };
        let Some(previous) = previous else {
            return;
        };
        let Ok(mut subscribers) = self.inner.subscribers.try_borrow_mut() else {
            return;
        };
        for source in previous {
            if let Some(entry) = subscribers.get_mut(&source) {
                entry.retain(|subscriber| *subscriber != id);
                if entry.is_empty() {
                    subscribers.remove(&source);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self, source: NodeId) -> usize {
        self.inner
            .subscribers
            .borrow()
            .get(&source)
            .map_or(0, |subscribers| subscribers.len())
    }
}

struct BatchGuard<'a> {
    runtime: &'a Runtime,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let inner = &self.runtime.inner;
        let depth = inner.batch_depth.get().saturating_sub(1);
        inner.batch_depth.set(depth);
        if depth == 0 && !std::thread::panicking() {
            self.runtime.flush();
        }
    }
}

struct ObserverGuard<'a> {
    runtime: &'a Runtime,
}

impl Drop for ObserverGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut observers) = self.runtime.inner.observers.try_borrow_mut() {
            observers.pop();
        }
    }
}
