//! Deduplicated, rate-limited error records per variable and property.
//!
//! The whole collection lives in one [`State`] and is replaced on every
//! mutation, so a UI effect reading [`ErrorLedger::errors`] sees each change
//! exactly once. Recording reads the current collection untracked: an effect
//! that records an error never starts depending on the ledger.

use crate::clock::Clock;
use crate::reactive::{Runtime, State};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use trellis_model::Id;

pub const DEFAULT_BURST_LIMIT: usize = 10;
pub const DEFAULT_BURST_WINDOW_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Schema,
    Value,
    Validation,
    Invocation,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Schema => "schema",
            Self::Value => "value",
            Self::Validation => "validation",
            Self::Invocation => "invocation",
        })
    }
}

/// What an error is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ErrorSubject {
    Variable { variable_id: Id },
    Property { container_id: Id, property_name: String },
}

impl fmt::Display for ErrorSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Variable { variable_id } => write!(f, "variable {variable_id}"),
            Self::Property {
                container_id,
                property_name,
            } => write!(f, "property {container_id}.{property_name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(flatten)]
    pub subject: ErrorSubject,
    pub category: ErrorCategory,
    pub message: String,
}

impl ErrorEntry {
    pub fn variable(id: &Id, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            subject: ErrorSubject::Variable {
                variable_id: id.clone(),
            },
            category,
            message: message.into(),
        }
    }

    pub fn property(
        container: &Id,
        property: &str,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            subject: ErrorSubject::Property {
                container_id: container.clone(),
                property_name: property.to_owned(),
            },
            category,
            message: message.into(),
        }
    }

    fn same_identity(&self, other: &ErrorEntry) -> bool {
        self.category == other.category && self.subject == other.subject
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.subject, self.category, self.message)
    }
}

/// Fixed-window counter of state-changing records.
#[derive(Debug)]
struct BurstWindow {
    limit: usize,
    window_ms: u64,
    started_at: Cell<u64>,
    admitted: Cell<usize>,
    dropped: Cell<usize>,
}

impl BurstWindow {
    fn admit(&self, now: u64) -> bool {
        if now.saturating_sub(self.started_at.get()) >= self.window_ms {
            let dropped = self.dropped.replace(0);
            if dropped > 0 {
                log::warn!("error ledger dropped {dropped} records in the last burst window");
            }
            self.started_at.set(now);
            self.admitted.set(0);
        }
        if self.admitted.get() >= self.limit {
            if self.dropped.get() == 0 {
                log::warn!(
                    "more than {} error records within {} ms; suppressing until the window ends",
                    self.limit,
                    self.window_ms
                );
            }
            self.dropped.set(self.dropped.get() + 1);
            return false;
        }
        self.admitted.set(self.admitted.get() + 1);
        true
    }
}

pub struct ErrorLedger {
    entries: State<Rc<Vec<ErrorEntry>>>,
    clock: Rc<dyn Clock>,
    burst: BurstWindow,
    revision: Cell<u64>,
}

impl fmt::Debug for ErrorLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorLedger")
            .field("entries", &self.entries.with_untracked(|entries| entries.len()))
            .field("revision", &self.revision.get())
            .field("burst", &self.burst)
            .finish()
    }
}

impl ErrorLedger {
    pub fn new(runtime: &Runtime, clock: Rc<dyn Clock>) -> Self {
        Self::with_burst_limit(runtime, clock, DEFAULT_BURST_LIMIT, DEFAULT_BURST_WINDOW_MS)
    }

    pub fn with_burst_limit(
        runtime: &Runtime,
        clock: Rc<dyn Clock>,
        limit: usize,
        window_ms: u64,
    ) -> Self {
        let now = clock.now_ms();
        Self {
            entries: State::new(runtime, Rc::new(Vec::new())),
            clock,
            burst: BurstWindow {
                limit,
                window_ms,
                started_at: Cell::new(now),
                admitted: Cell::new(0),
                dropped: Cell::new(0),
            },
            revision: Cell::new(0),
        }
    }

    /// Upserts `entry`: an identical message is a no-op, an empty message
    /// removes the entry, anything else replaces it. Returns whether the
    /// ledger changed.
    pub fn record(&self, entry: ErrorEntry) -> bool {
        let current = self.entries.get_untracked();
        let existing = current.iter().position(|known| known.same_identity(&entry));
        let next = match existing {
            None if entry.message.is_empty() => return false,
            Some(index) if current[index].message == entry.message => return false,
            Some(index) => {
                let mut next = Vec::clone(&current);
                if entry.message.is_empty() {
                    next.remove(index);
                } else {
                    next[index] = entry;
                }
                next
            }
            None => {
                let mut next = Vec::clone(&current);
                next.push(entry);
                next
            }
        };
        if !self.burst.admit(self.clock.now_ms()) {
            return false;
        }
        self.replace(next);
        true
    }

    pub fn variable(&self, id: &Id, category: ErrorCategory, message: impl Into<String>) -> bool {
        self.record(ErrorEntry::variable(id, category, message))
    }

    pub fn property(
        &self,
        container: &Id,
        property: &str,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> bool {
        self.record(ErrorEntry::property(container, property, category, message))
    }

    /// Reactive read of every live entry.
    pub fn errors(&self) -> Rc<Vec<ErrorEntry>> {
        self.entries.get()
    }

    pub fn errors_untracked(&self) -> Rc<Vec<ErrorEntry>> {
        self.entries.get_untracked()
    }

    pub fn find(&self, subject: &ErrorSubject, category: ErrorCategory) -> Option<ErrorEntry> {
        self.entries.with_untracked(|entries| {
            entries
                .iter()
                .find(|entry| entry.category == category && &entry.subject == subject)
                .cloned()
        })
    }

    pub fn len(&self) -> usize {
        self.entries.with_untracked(|entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of mutations so far.
    pub fn revision(&self) -> u64 {
        self.revision.get()
    }

    // The clear helpers run on teardown and bypass the burst limiter.

    pub fn clear_variable(&self, id: &Id) {
        self.retain(|entry| {
            !matches!(&entry.subject, ErrorSubject::Variable { variable_id } if variable_id == id)
        });
    }

    pub fn clear_property(&self, container: &Id, property: &str) {
        self.retain(|entry| {
            !matches!(
                &entry.subject,
                ErrorSubject::Property { container_id, property_name }
                    if container_id == container && property_name == property
            )
        });
    }

    pub fn clear_container(&self, container: &Id) {
        self.retain(|entry| {
            !matches!(
                &entry.subject,
                ErrorSubject::Property { container_id, .. } if container_id == container
            )
        });
    }

    pub fn clear_all(&self) {
        self.retain(|_| false);
    }

    fn retain(&self, keep: impl Fn(&ErrorEntry) -> bool) {
        let current = self.entries.get_untracked();
        if current.iter().all(&keep) {
            return;
        }
        let next = current.iter().filter(|entry| keep(entry)).cloned().collect();
        self.replace(next);
    }

    fn replace(&self, next: Vec<ErrorEntry>) {
        self.revision.set(self.revision.get() + 1);
        self.entries.set(Rc::new(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::reactive::Effect;

    fn ledger() -> (Runtime, TestClock, ErrorLedger) {
        let runtime = Runtime::new();
        let clock = TestClock::new();
        let ledger = ErrorLedger::new(&runtime, Rc::new(clock.clone()));
        (runtime, clock, ledger)
    }

    #[test]
    fn identical_messages_are_recorded_once() {
        let (_runtime, _clock, ledger) = ledger();
        let id = Id::from("v1");
        assert!(ledger.variable(&id, ErrorCategory::Value, "boom"));
        assert!(!ledger.variable(&id, ErrorCategory::Value, "boom"));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.revision(), 1);
    }

    #[test]
    fn categories_are_separate_identities() {
        let (_runtime, _clock, ledger) = ledger();
        let id = Id::from("v1");
        ledger.variable(&id, ErrorCategory::Value, "boom");
        ledger.variable(&id, ErrorCategory::Validation, "bad");
        ledger.variable(&id, ErrorCategory::Value, "boom again");
        let errors = ledger.errors_untracked();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "boom again");
    }

    #[test]
    fn empty_message_removes_the_entry() {
        let (_runtime, _clock, ledger) = ledger();
        let container = Id::from("c1");
        ledger.property(&container, "label", ErrorCategory::Value, "boom");
        assert!(ledger.property(&container, "label", ErrorCategory::Value, ""));
        assert!(ledger.is_empty());
        assert!(!ledger.property(&container, "label", ErrorCategory::Value, ""));
    }

    #[test]
    fn bursts_are_suppressed_until_the_window_ends() {
        let (_runtime, clock, ledger) = ledger();
        let id = Id::from("v1");
        let changed = (0..15)
            .filter(|attempt| ledger.variable(&id, ErrorCategory::Value, format!("boom {attempt}")))
            .count();
        assert_eq!(changed, DEFAULT_BURST_LIMIT);
        assert_eq!(ledger.revision(), DEFAULT_BURST_LIMIT as u64);

        clock.advance_by(DEFAULT_BURST_WINDOW_MS);
        assert!(ledger.variable(&id, ErrorCategory::Value, "late"));
    }

    #[test]
    fn readers_rerun_and_recorders_do_not_subscribe() {
        let (runtime, _clock, ledger) = ledger();
        let ledger = Rc::new(ledger);
        let seen = Rc::new(Cell::new(0));
        let _reader = Effect::new(&runtime, {
            let (ledger, seen) = (ledger.clone(), seen.clone());
            move || seen.set(ledger.errors().len())
        });
        let recorder_runs = Rc::new(Cell::new(0));
        let _recorder = Effect::new(&runtime, {
            let (ledger, runs) = (ledger.clone(), recorder_runs.clone());
            move || {
                runs.set(runs.get() + 1);
                ledger.variable(&Id::from("v1"), ErrorCategory::Schema, "bad code");
            }
        });
        ledger.clear_all();
        assert_eq!(seen.get(), 0);
        assert_eq!(recorder_runs.get(), 1);
    }

    #[test]
    fn entries_serialize_with_a_type_tag() {
        let entry = ErrorEntry::property(&Id::from("c1"), "label", ErrorCategory::Invocation, "x");
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            serde_json::json!({
                "type": "property",
                "containerId": "c1",
                "propertyName": "label",
                "category": "invocation",
                "message": "x",
            })
        );
    }
}
