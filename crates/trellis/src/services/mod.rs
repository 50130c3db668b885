//! Collaborators the engine talks to but does not implement: storage, query
//! execution, HTTP, alerts and navigation.
//!
//! Every collaborator is a trait object shared through [`Services`]. The
//! in-memory implementations in [`memory`] back the tests and the offline
//! CLI.

pub mod http;
pub mod memory;

pub use http::{HttpRequest, HttpResponse, HttpTransport, RecordingTransport};
pub use memory::{
    AutoAlert, MemoryDatabase, MemoryQueryExecutor, MemorySnapshotStore, NoopNavigator,
};

use crate::clock::{Clock, SystemClock};
use crate::error::EngineError;
use futures::executor::LocalSpawner;
use futures::future::LocalBoxFuture;
use futures::task::LocalSpawnExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;
use trellis_model::{Query, Table};

/// One database row as plain JSON.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Table storage behind `db.*`.
///
/// Writes are journaled until [`Database::commit`].
pub trait Database {
    /// Upserts `row` by its `id` column, generating one when missing.
    fn record(&self, table: &str, row: Row) -> Result<Row, EngineError>;
    fn remove(&self, table: &str, id: &str) -> Result<bool, EngineError>;
    fn read(&self, table: &str, id: &str) -> Result<Option<Row>, EngineError>;
    /// Rows whose columns equal every entry of `filter`.
    fn find(&self, table: &str, filter: &Row) -> Result<Vec<Row>, EngineError>;
    /// Returns how many journaled changes were committed.
    fn commit(&self) -> Result<usize, EngineError>;
    fn export(&self) -> serde_json::Value;
    fn import(&self, snapshot: &serde_json::Value) -> Result<(), EngineError>;
}

/// Named database snapshots behind `tools.*SqlLite`.
pub trait SnapshotStore {
    fn save(&self, name: &str, snapshot: &serde_json::Value) -> Result<(), EngineError>;
    fn load(&self, name: &str) -> Result<Option<serde_json::Value>, EngineError>;
    fn delete(&self, name: &str) -> Result<bool, EngineError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryRequest {
    pub query: Query,
    pub params: serde_json::Value,
    /// 1-based.
    pub page: usize,
    pub filter: Row,
    pub sort: Option<Sort>,
    pub row_per_page: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPage {
    pub data: Vec<Row>,
    pub columns: Vec<String>,
    pub total_page: usize,
    pub current_page: usize,
}

pub trait QueryExecutor {
    fn execute(&self, request: QueryRequest) -> LocalBoxFuture<'static, Result<QueryPage, EngineError>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertButton {
    pub id: String,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Alert {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub buttons: Vec<AlertButton>,
}

/// Shows `alertBox(..)` dialogs; resolves to the id of the pressed button.
pub trait AlertPresenter {
    fn present(&self, alert: Alert) -> LocalBoxFuture<'static, Option<String>>;
}

/// Told about every navigation request a formula makes. The session applies
/// the navigation itself on [`crate::Session::settle`].
pub trait Navigator {
    fn navigate(&self, page: &str, params: &IndexMap<String, serde_json::Value>);
}

/// Runs promise-backed work on the session's single-threaded executor.
pub trait TaskSpawner {
    fn spawn(&self, task: LocalBoxFuture<'static, ()>);
}

impl TaskSpawner for LocalSpawner {
    fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
        if let Err(error) = self.spawn_local(task) {
            log::error!("failed to spawn task: {error}");
        }
    }
}

#[derive(Clone)]
pub struct Services {
    pub database: Rc<dyn Database>,
    pub snapshots: Rc<dyn SnapshotStore>,
    pub queries: Rc<dyn QueryExecutor>,
    pub http: Rc<dyn HttpTransport>,
    pub alerts: Rc<dyn AlertPresenter>,
    pub navigator: Rc<dyn Navigator>,
    pub spawner: Rc<dyn TaskSpawner>,
    pub clock: Rc<dyn Clock>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

impl Services {
    /// Everything in memory; HTTP answers from `http`.
    pub fn in_memory(
        tables: &[Table],
        http: Rc<dyn HttpTransport>,
        spawner: Rc<dyn TaskSpawner>,
    ) -> Self {
        let database = Rc::new(MemoryDatabase::new());
        Self {
            queries: Rc::new(MemoryQueryExecutor::new(database.clone(), tables.to_vec())),
            database,
            snapshots: Rc::new(MemorySnapshotStore::default()),
            http,
            alerts: Rc::new(AutoAlert::default()),
            navigator: Rc::new(NoopNavigator),
            spawner,
            clock: Rc::new(SystemClock::new()),
        }
    }

    pub fn with_clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_database(mut self, database: Rc<dyn Database>) -> Self {
        self.database = database;
        self
    }

    pub fn with_alerts(mut self, alerts: Rc<dyn AlertPresenter>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_navigator(mut self, navigator: Rc<dyn Navigator>) -> Self {
        self.navigator = navigator;
        self
    }

    pub fn with_snapshots(mut self, snapshots: Rc<dyn SnapshotStore>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_queries(mut self, queries: Rc<dyn QueryExecutor>) -> Self {
        self.queries = queries;
        self
    }
}
