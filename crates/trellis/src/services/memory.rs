use super::{
    Alert, AlertPresenter, Database, Navigator, QueryExecutor, QueryPage, QueryRequest, Row,
    SnapshotStore,
};
use crate::error::EngineError;
use futures::FutureExt;
use futures::future::{self, LocalBoxFuture};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;
use trellis_model::{Id, Table};

const DEFAULT_ROW_PER_PAGE: usize = 10;

type Tables = IndexMap<String, IndexMap<String, Row>>;

#[derive(Debug, Clone, PartialEq)]
enum Change {
    Record { table: String, row: Row },
    Remove { table: String, id: String },
}

/// Tables kept in memory. Writes are visible immediately and journaled;
/// [`Database::commit`] folds the journal into the committed copy.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    working: RefCell<Tables>,
    committed: RefCell<Tables>,
    journal: RefCell<Vec<Change>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.working
            .borrow()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn committed_rows(&self, table: &str) -> Vec<Row> {
        self.committed
            .borrow()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_changes(&self) -> usize {
        self.journal.borrow().len()
    }
}

fn row_id(row: &Row) -> Option<String> {
    match row.get("id")? {
        serde_json::Value::String(id) if !id.is_empty() => Some(id.clone()),
        serde_json::Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn matches_filter(row: &Row, filter: &Row) -> bool {
    filter
        .iter()
        .all(|(column, expected)| row.get(column).unwrap_or(&serde_json::Value::Null) == expected)
}

impl Database for MemoryDatabase {
    fn record(&self, table: &str, mut row: Row) -> Result<Row, EngineError> {
        let id = match row_id(&row) {
            Some(id) => id,
            None => {
                let id = Id::generate().to_string();
                row.insert("id".to_owned(), serde_json::Value::String(id.clone()));
                id
            }
        };
        self.working
            .borrow_mut()
            .entry(table.to_owned())
            .or_default()
            .insert(id, row.clone());
        self.journal.borrow_mut().push(Change::Record {
            table: table.to_owned(),
            row: row.clone(),
        });
        Ok(row)
    }

    fn remove(&self, table: &str, id: &str) -> Result<bool, EngineError> {
        let removed = self
            .working
            .borrow_mut()
            .get_mut(table)
            .and_then(|rows| rows.shift_remove(id))
            .is_some();
        if removed {
            self.journal.borrow_mut().push(Change::Remove {
                table: table.to_owned(),
                id: id.to_owned(),
            });
        }
        Ok(removed)
    }

    fn read(&self, table: &str, id: &str) -> Result<Option<Row>, EngineError> {
        Ok(self
            .working
            .borrow()
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned())
    }

    fn find(&self, table: &str, filter: &Row) -> Result<Vec<Row>, EngineError> {
        Ok(self
            .rows(table)
            .into_iter()
            .filter(|row| matches_filter(row, filter))
            .collect())
    }

    fn commit(&self) -> Result<usize, EngineError> {
        let journal = std::mem::take(&mut *self.journal.borrow_mut());
        let mut committed = self.committed.borrow_mut();
        for change in &journal {
            match change {
                Change::Record { table, row } => {
                    if let Some(id) = row_id(row) {
                        committed
                            .entry(table.clone())
                            .or_default()
                            .insert(id, row.clone());
                    }
                }
                Change::Remove { table, id } => {
                    if let Some(rows) = committed.get_mut(table) {
                        rows.shift_remove(id);
                    }
                }
            }
        }
        log::debug!("committed {} database changes", journal.len());
        Ok(journal.len())
    }

    fn export(&self) -> serde_json::Value {
        let tables = self
            .working
            .borrow()
            .iter()
            .map(|(name, rows)| {
                let rows = rows.values().cloned().map(serde_json::Value::Object).collect();
                (name.clone(), serde_json::Value::Array(rows))
            })
            .collect();
        serde_json::Value::Object(tables)
    }

    fn import(&self, snapshot: &serde_json::Value) -> Result<(), EngineError> {
        let serde_json::Value::Object(tables) = snapshot else {
            return Err(EngineError::service("database", "snapshot is not an object"));
        };
        let mut imported = Tables::new();
        for (name, rows) in tables {
            let serde_json::Value::Array(rows) = rows else {
                return Err(EngineError::service(
                    "database",
                    format!("snapshot table `{name}` is not an array"),
                ));
            };
            let table = imported.entry(name.clone()).or_default();
            for row in rows {
                if let serde_json::Value::Object(row) = row {
                    if let Some(id) = row_id(row) {
                        table.insert(id, row.clone());
                    }
                }
            }
        }
        *self.committed.borrow_mut() = imported.clone();
        *self.working.borrow_mut() = imported;
        self.journal.borrow_mut().clear();
        Ok(())
    }
}

/// Filters, sorts and paginates the rows of the query's table.
#[derive(Debug)]
pub struct MemoryQueryExecutor {
    database: Rc<MemoryDatabase>,
    tables: Vec<Table>,
}

impl MemoryQueryExecutor {
    pub fn new(database: Rc<MemoryDatabase>, tables: Vec<Table>) -> Self {
        Self { database, tables }
    }

    fn run(&self, request: &QueryRequest) -> Result<QueryPage, EngineError> {
        let table = request
            .query
            .table
            .clone()
            .or_else(|| {
                let source = request.query.source.trim();
                (!source.is_empty() && !source.contains(char::is_whitespace))
                    .then(|| source.to_owned())
            })
            .ok_or_else(|| {
                EngineError::service(
                    "query",
                    format!("query `{}` names no table", request.query.name),
                )
            })?;
        let mut rows = self.database.find(&table, &request.filter)?;
        if let Some(sort) = &request.sort {
            rows.sort_by(|a, b| {
                let ordering = compare_json(a.get(&sort.column), b.get(&sort.column));
                if sort.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        let columns = match self.tables.iter().find(|known| known.name == table) {
            Some(known) => known.columns.iter().map(|column| column.name.clone()).collect(),
            None => rows
                .first()
                .map(|row| row.keys().cloned().collect())
                .unwrap_or_default(),
        };
        let per_page = request
            .row_per_page
            .or(request.query.row_per_page.map(|rows| rows as usize))
            .filter(|rows| *rows > 0)
            .unwrap_or(DEFAULT_ROW_PER_PAGE);
        let total_page = rows.len().div_ceil(per_page).max(1);
        let current_page = request.page.clamp(1, total_page);
        let data = rows
            .into_iter()
            .skip((current_page - 1) * per_page)
            .take(per_page)
            .collect();
        Ok(QueryPage {
            data,
            columns,
            total_page,
            current_page,
        })
    }
}

fn compare_json(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> Ordering {
    use serde_json::Value as Json;
    match (a, b) {
        (Some(Json::Number(a)), Some(Json::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Json::String(a)), Some(Json::String(b))) => a.cmp(b),
        (Some(Json::Bool(a)), Some(Json::Bool(b))) => a.cmp(b),
        (None | Some(Json::Null), None | Some(Json::Null)) => Ordering::Equal,
        (None | Some(Json::Null), _) => Ordering::Greater,
        (_, None | Some(Json::Null)) => Ordering::Less,
        (Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
    }
}

impl QueryExecutor for MemoryQueryExecutor {
    fn execute(&self, request: QueryRequest) -> LocalBoxFuture<'static, Result<QueryPage, EngineError>> {
        future::ready(self.run(&request)).boxed_local()
    }
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: RefCell<IndexMap<String, serde_json::Value>>,
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, name: &str, snapshot: &serde_json::Value) -> Result<(), EngineError> {
        self.snapshots
            .borrow_mut()
            .insert(name.to_owned(), snapshot.clone());
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<serde_json::Value>, EngineError> {
        Ok(self.snapshots.borrow().get(name).cloned())
    }

    fn delete(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.snapshots.borrow_mut().shift_remove(name).is_some())
    }
}

/// Answers every alert right away with a fixed button, or the first one.
#[derive(Debug, Default)]
pub struct AutoAlert {
    answer: Option<String>,
    shown: RefCell<Vec<Alert>>,
}

impl AutoAlert {
    pub fn answering(button: impl Into<String>) -> Self {
        Self {
            answer: Some(button.into()),
            shown: RefCell::default(),
        }
    }

    pub fn shown(&self) -> Vec<Alert> {
        self.shown.borrow().clone()
    }
}

impl AlertPresenter for AutoAlert {
    fn present(&self, alert: Alert) -> LocalBoxFuture<'static, Option<String>> {
        log::info!("alert: {} {}", alert.title, alert.message);
        let answer = self
            .answer
            .clone()
            .or_else(|| alert.buttons.first().map(|button| button.id.clone()));
        self.shown.borrow_mut().push(alert);
        future::ready(answer).boxed_local()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNavigator;

impl Navigator for NoopNavigator {
    fn navigate(&self, page: &str, _params: &IndexMap<String, serde_json::Value>) {
        log::debug!("navigation to `{page}` requested");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Sort;
    use futures::executor::block_on;
    use serde_json::json;
    use trellis_model::Query;

    fn row(value: serde_json::Value) -> Row {
        match value {
            serde_json::Value::Object(row) => row,
            _ => unreachable!(),
        }
    }

    #[test]
    fn records_upsert_by_id_and_commit_the_journal() {
        let database = MemoryDatabase::new();
        let created = database.record("todos", row(json!({"title": "a"}))).unwrap();
        let id = created["id"].as_str().unwrap().to_owned();
        assert_eq!(id.len(), 26);

        database
            .record("todos", row(json!({"id": id, "title": "b"})))
            .unwrap();
        assert_eq!(database.rows("todos").len(), 1);
        assert!(database.committed_rows("todos").is_empty());

        assert_eq!(database.commit().unwrap(), 2);
        assert_eq!(database.committed_rows("todos")[0]["title"], "b");
        assert!(database.remove("todos", &id).unwrap());
        assert!(!database.remove("todos", &id).unwrap());
        assert_eq!(database.commit().unwrap(), 1);
        assert!(database.committed_rows("todos").is_empty());
    }

    #[test]
    fn snapshots_restore_the_tables() {
        let database = MemoryDatabase::new();
        database.record("t", row(json!({"id": "1", "n": 1}))).unwrap();
        let snapshot = database.export();
        database.remove("t", "1").unwrap();
        database.import(&snapshot).unwrap();
        assert_eq!(database.read("t", "1").unwrap().unwrap()["n"], 1);
        assert_eq!(database.pending_changes(), 0);
    }

    #[test]
    fn queries_filter_sort_and_paginate() {
        let database = Rc::new(MemoryDatabase::new());
        for n in 0..5 {
            database
                .record("items", row(json!({"id": n.to_string(), "n": n, "kind": n % 2})))
                .unwrap();
        }
        let executor = MemoryQueryExecutor::new(database, Vec::new());
        let query = Query {
            name: "odd".to_owned(),
            table: Some("items".to_owned()),
            ..Query::default()
        };
        let page = block_on(executor.execute(QueryRequest {
            query,
            page: 2,
            filter: row(json!({"kind": 0})),
            sort: Some(Sort {
                column: "n".to_owned(),
                descending: true,
            }),
            row_per_page: Some(2),
            ..QueryRequest::default()
        }))
        .unwrap();
        assert_eq!(page.total_page, 2);
        assert_eq!(page.current_page, 2);
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0]["n"], 0);
        assert_eq!(page.columns, ["id", "n", "kind"]);
    }

    #[test]
    fn queries_without_a_table_fail() {
        let executor = MemoryQueryExecutor::new(Rc::new(MemoryDatabase::new()), Vec::new());
        let error = block_on(executor.execute(QueryRequest::default())).unwrap_err();
        assert!(error.to_string().contains("names no table"), "{error}");
    }
}
