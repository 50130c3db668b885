//! JavaScript-style promises for formulas.
//!
//! A promise is settled from host code through its [`Resolver`]. Reactions
//! registered with `then`/`catch`/`finally` run synchronously at settle time,
//! on whatever task settled it. Hosts that need to wait turn a promise into a
//! future with [`Promise::wait`].

use super::interpreter::EvalError;
use super::value::{Function, Value};
use futures::channel::oneshot;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub enum Settled {
    Fulfilled(Value),
    Rejected(Value),
}

type Reaction = Box<dyn FnOnce(&Settled)>;

#[derive(Clone)]
pub struct Promise(Rc<PromiseInner>);

struct PromiseInner {
    settled: RefCell<Option<Settled>>,
    reactions: RefCell<Vec<Reaction>>,
    handled: Cell<bool>,
}

impl Drop for PromiseInner {
    fn drop(&mut self) {
        if let Some(Settled::Rejected(reason)) = self.settled.get_mut() {
            if !self.handled.get() {
                log::warn!("unhandled promise rejection: {reason}");
            }
        }
    }
}

/// The settling half of a pending promise. Only the first settle counts.
#[derive(Clone)]
pub struct Resolver {
    promise: Promise,
}

impl Promise {
    pub fn pending() -> (Promise, Resolver) {
        let promise = Promise(Rc::new(PromiseInner {
            settled: RefCell::new(None),
            reactions: RefCell::new(Vec::new()),
            handled: Cell::new(false),
        }));
        let resolver = Resolver {
            promise: promise.clone(),
        };
        (promise, resolver)
    }

    /// `Promise.resolve(value)`: adopts `value` when it already is a promise.
    pub fn resolved(value: Value) -> Promise {
        if let Value::Promise(promise) = value {
            return promise;
        }
        let (promise, resolver) = Promise::pending();
        resolver.resolve(value);
        promise
    }

    pub fn rejected(reason: Value) -> Promise {
        let (promise, resolver) = Promise::pending();
        resolver.reject(reason);
        promise
    }

    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn state_name(&self) -> &'static str {
        match &*self.0.settled.borrow() {
            None => "pending",
            Some(Settled::Fulfilled(_)) => "fulfilled",
            Some(Settled::Rejected(_)) => "rejected",
        }
    }

    pub fn settled(&self) -> Option<Settled> {
        self.0.settled.borrow().clone()
    }

    fn subscribe(&self, reaction: impl FnOnce(&Settled) + 'static) {
        self.0.handled.set(true);
        let settled = self.0.settled.borrow().clone();
        match settled {
            Some(settled) => reaction(&settled),
            None => self.0.reactions.borrow_mut().push(Box::new(reaction)),
        }
    }

    pub fn then(&self, on_fulfilled: Option<Function>, on_rejected: Option<Function>) -> Promise {
        let (next, resolver) = Promise::pending();
        self.subscribe(move |settled| {
            let (handler, value) = match settled {
                Settled::Fulfilled(value) => (on_fulfilled, value),
                Settled::Rejected(reason) => match on_rejected {
                    Some(handler) => (Some(handler), reason),
                    None => return resolver.reject(reason.clone()),
                },
            };
            match handler {
                Some(handler) => resolver.settle_with(handler.call(&[value.clone()])),
                None => resolver.resolve(value.clone()),
            }
        });
        next
    }

    pub fn catch(&self, on_rejected: Option<Function>) -> Promise {
        self.then(None, on_rejected)
    }

    /// Runs `callback` on either outcome and passes the original outcome on,
    /// unless the callback itself throws.
    pub fn finally(&self, callback: Option<Function>) -> Promise {
        let (next, resolver) = Promise::pending();
        self.subscribe(move |settled| {
            if let Some(callback) = &callback {
                if let Err(error) = callback.call(&[]) {
                    return resolver.reject(error.into_value());
                }
            }
            match settled {
                Settled::Fulfilled(value) => resolver.resolve(value.clone()),
                Settled::Rejected(reason) => resolver.reject(reason.clone()),
            }
        });
        next
    }

    /// `Promise.all`: fulfils with every value in order, or rejects with the
    /// first rejection.
    pub fn all(items: Vec<Value>) -> Promise {
        let (promise, resolver) = Promise::pending();
        if items.is_empty() {
            resolver.resolve(Value::array(Vec::new()));
            return promise;
        }
        let results = Rc::new(RefCell::new(vec![Value::Undefined; items.len()]));
        let remaining = Rc::new(Cell::new(items.len()));
        for (index, item) in items.into_iter().enumerate() {
            let results = results.clone();
            let remaining = remaining.clone();
            let resolver = resolver.clone();
            Promise::resolved(item).subscribe(move |settled| match settled {
                Settled::Fulfilled(value) => {
                    results.borrow_mut()[index] = value.clone();
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        resolver.resolve(Value::array(results.borrow().clone()));
                    }
                }
                Settled::Rejected(reason) => resolver.reject(reason.clone()),
            });
        }
        promise
    }

    /// Future resolving once the promise settles. A promise dropped while
    /// still pending rejects the future.
    pub fn wait(&self) -> impl Future<Output = Result<Value, Value>> + 'static {
        let (sender, receiver) = oneshot::channel();
        self.subscribe(move |settled| {
            let _ = sender.send(settled.clone());
        });
        async move {
            match receiver.await {
                Ok(Settled::Fulfilled(value)) => Ok(value),
                Ok(Settled::Rejected(reason)) => Err(reason),
                Err(oneshot::Canceled) => Err(Value::from("promise was dropped before it settled")),
            }
        }
    }
}

impl Resolver {
    pub fn resolve(&self, value: Value) {
        match value {
            Value::Promise(inner) if !inner.ptr_eq(&self.promise) => {
                let resolver = self.clone();
                inner.subscribe(move |settled| resolver.settle(settled.clone()));
            }
            value => self.settle(Settled::Fulfilled(value)),
        }
    }

    pub fn reject(&self, reason: Value) {
        self.settle(Settled::Rejected(reason));
    }

    pub fn settle_with(&self, result: Result<Value, EvalError>) {
        match result {
            Ok(value) => self.resolve(value),
            Err(error) => self.reject(error.into_value()),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.promise.0.settled.borrow().is_some()
    }

    fn settle(&self, settled: Settled) {
        let inner = &self.promise.0;
        if inner.settled.borrow().is_some() {
            return;
        }
        *inner.settled.borrow_mut() = Some(settled.clone());
        let reactions = std::mem::take(&mut *inner.reactions.borrow_mut());
        for reaction in reactions {
            reaction(&settled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    fn double() -> Function {
        Function::native("double", |_, arguments| {
            Ok(Value::from(arguments[0].to_number() * 2.0))
        })
    }

    #[test]
    fn reactions_registered_before_and_after_settling_both_run() {
        let (promise, resolver) = Promise::pending();
        let early = promise.then(Some(double()), None);
        resolver.resolve(Value::from(4));
        let late = promise.then(Some(double()), None);
        assert!(matches!(early.settled(), Some(Settled::Fulfilled(value)) if value == Value::from(8)));
        assert!(matches!(late.settled(), Some(Settled::Fulfilled(value)) if value == Value::from(8)));
    }

    #[test]
    fn rejection_skips_then_and_reaches_catch() {
        let recovered = Promise::rejected(Value::from("nope"))
            .then(Some(double()), None)
            .catch(Some(Function::native("recover", |_, arguments| {
                Ok(Value::from(format!("recovered from {}", arguments[0])))
            })));
        assert_eq!(
            block_on(recovered.wait()),
            Ok(Value::from("recovered from nope"))
        );
    }

    #[test]
    fn handler_errors_reject_the_chain() {
        let failing = Function::native("fail", |_, _| Err(EvalError::type_error("broken")));
        let chained = Promise::resolved(Value::from(1)).then(Some(failing), None);
        let reason = block_on(chained.wait()).unwrap_err();
        assert_eq!(reason.field("name"), Some(Value::from("TypeError")));
    }

    #[test]
    fn all_keeps_order_and_waits_for_every_item() {
        let (slow, resolver) = Promise::pending();
        let all = Promise::all(vec![Value::Promise(slow), Value::from(2)]);
        assert_eq!(all.state_name(), "pending");
        resolver.resolve(Value::from(1));
        assert_eq!(
            block_on(all.wait()).map(|value| value.to_json()),
            Ok(serde_json::json!([1, 2]))
        );
    }

    #[test]
    fn first_settle_wins() {
        let (promise, resolver) = Promise::pending();
        resolver.resolve(Value::from(1));
        resolver.reject(Value::from(2));
        assert_eq!(promise.state_name(), "fulfilled");
        assert!(resolver.is_settled());
    }
}
