//! Per-session state shared by every part of the engine, and the names each
//! kind of formula gets to see.

use crate::config::EngineConfig;
use crate::formula::ast::Name;
use crate::formula::builtins::{arg, error_object};
use crate::formula::{
    EvalError, Environment, FormulaEngine, FormulaEvaluator, Function, Interpreter, Promise,
    Signal, Value,
};
use crate::ledger::ErrorLedger;
use crate::reactive::Runtime;
use crate::schema::z;
use crate::services::{Alert, Row, Services};
use crate::utils::utils;
use futures::FutureExt;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// Values a page starts with, by variable name.
pub type InitialValues = IndexMap<Name, Value>;

const DEFAULT_SNAPSHOT: &str = "default";

#[derive(Debug, Clone, PartialEq)]
pub struct Navigation {
    pub page: String,
    pub params: InitialValues,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormulaKind {
    State,
    Computed,
    Effect,
    Property,
    Callable,
    Fetcher,
    Schema,
}

/// What a formula sees of the composed scopes: the `app` and `page` objects
/// and every visible variable as a free name.
#[derive(Clone, Default)]
pub struct ScopeView {
    pub app: Value,
    pub page: Option<Value>,
    pub vars: IndexMap<Name, Signal>,
}

struct Surface {
    navigate: Value,
    db: Value,
    z: Value,
    alert_box: Value,
    tools: Value,
    utils: Value,
}

pub struct EngineContext {
    pub runtime: Runtime,
    pub evaluator: Rc<dyn FormulaEvaluator>,
    pub ledger: Rc<ErrorLedger>,
    pub services: Services,
    pub config: EngineConfig,
    navigation: Rc<RefCell<VecDeque<Navigation>>>,
    surface: Surface,
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("runtime", &self.runtime)
            .field("ledger", &self.ledger)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    pub fn new(services: Services, config: EngineConfig) -> Rc<Self> {
        let runtime = Runtime::with_flush_limit(config.max_flush_iterations);
        let ledger = Rc::new(ErrorLedger::with_burst_limit(
            &runtime,
            services.clock.clone(),
            config.burst_limit,
            config.burst_window_ms,
        ));
        let navigation = Rc::new(RefCell::new(VecDeque::new()));
        let surface = Surface {
            navigate: navigate(&services, &navigation),
            db: database(&services),
            z: z(),
            alert_box: alert_box(&services),
            tools: tools(&services),
            utils: utils(),
        };
        Rc::new(Self {
            evaluator: Rc::new(FormulaEngine::new(config.limits())),
            runtime,
            ledger,
            services,
            config,
            navigation,
            surface,
        })
    }

    /// Names available to a formula of `kind`. Host values win over variables
    /// with the same name.
    pub fn environment(&self, kind: FormulaKind, view: &ScopeView) -> Environment {
        let mut environment = Environment::new();
        if !matches!(kind, FormulaKind::State | FormulaKind::Schema) {
            for (name, signal) in &view.vars {
                environment.insert(name.clone(), signal.clone());
            }
            environment.insert("app", view.app.clone());
            if let Some(page) = &view.page {
                environment.insert("page", page.clone());
            }
        }
        let surface = &self.surface;
        match kind {
            FormulaKind::Schema => environment.insert("z", surface.z.clone()),
            FormulaKind::State | FormulaKind::Computed | FormulaKind::Fetcher => {
                environment.insert("utils", surface.utils.clone())
            }
            FormulaKind::Effect | FormulaKind::Property | FormulaKind::Callable => {
                environment.insert("navigate", surface.navigate.clone());
                environment.insert("db", surface.db.clone());
                environment.insert("z", surface.z.clone());
                environment.insert("alertBox", surface.alert_box.clone());
                environment.insert("tools", surface.tools.clone());
                environment.insert("utils", surface.utils.clone());
            }
        }
        environment
    }

    pub fn take_navigation(&self) -> Option<Navigation> {
        self.navigation.borrow_mut().pop_front()
    }

    pub fn pending_navigations(&self) -> usize {
        self.navigation.borrow().len()
    }
}

fn native(
    name: &str,
    call: impl Fn(&mut Interpreter, &[Value]) -> Result<Value, EvalError> + 'static,
) -> Value {
    Value::Function(Function::native(name, call))
}

fn thrown(message: impl fmt::Display) -> EvalError {
    EvalError::Thrown(error_object("Error", &message.to_string()))
}

fn row_arg(args: &[Value], index: usize, what: &str) -> Result<Row, EvalError> {
    match arg(args, index).to_json() {
        serde_json::Value::Object(row) => Ok(row),
        serde_json::Value::Null if what == "filter" => Ok(Row::new()),
        _ => Err(EvalError::type_error(format!("db: {what} must be an object"))),
    }
}

fn text_arg(args: &[Value], index: usize, what: &str) -> Result<String, EvalError> {
    match arg(args, index) {
        Value::String(text) => Ok(text.to_string()),
        Value::Number(number) => Ok(crate::formula::value::format_number(number)),
        other => Err(EvalError::type_error(format!(
            "{what} must be a string, received {}",
            other.type_of()
        ))),
    }
}

fn navigate(services: &Services, queue: &Rc<RefCell<VecDeque<Navigation>>>) -> Value {
    let navigator = services.navigator.clone();
    let queue = queue.clone();
    native("navigate", move |_, args| {
        let page = text_arg(args, 0, "navigate: page")?;
        let params: InitialValues = match arg(args, 1) {
            Value::Object(map) => map.borrow().clone(),
            Value::Undefined | Value::Null => InitialValues::new(),
            other => {
                return Err(EvalError::type_error(format!(
                    "navigate: params must be an object, received {}",
                    other.type_of()
                )));
            }
        };
        let json: IndexMap<String, serde_json::Value> = params
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_json()))
            .collect();
        navigator.navigate(&page, &json);
        queue.borrow_mut().push_back(Navigation { page, params });
        Ok(Value::Undefined)
    })
}

fn database(services: &Services) -> Value {
    let db = &services.database;
    Value::object([
        ("record", {
            let db = db.clone();
            native("record", move |_, args| {
                let table = text_arg(args, 0, "db.record: table")?;
                let row = db.record(&table, row_arg(args, 1, "row")?).map_err(thrown)?;
                Ok(Value::from(&serde_json::Value::Object(row)))
            })
        }),
        ("remove", {
            let db = db.clone();
            native("remove", move |_, args| {
                let table = text_arg(args, 0, "db.remove: table")?;
                let id = text_arg(args, 1, "db.remove: id")?;
                Ok(Value::Bool(db.remove(&table, &id).map_err(thrown)?))
            })
        }),
        ("read", {
            let db = db.clone();
            native("read", move |_, args| {
                let table = text_arg(args, 0, "db.read: table")?;
                let id = text_arg(args, 1, "db.read: id")?;
                Ok(match db.read(&table, &id).map_err(thrown)? {
                    Some(row) => Value::from(&serde_json::Value::Object(row)),
                    None => Value::Null,
                })
            })
        }),
        ("find", {
            let db = db.clone();
            native("find", move |_, args| {
                let table = text_arg(args, 0, "db.find: table")?;
                let rows = db.find(&table, &row_arg(args, 1, "filter")?).map_err(thrown)?;
                Ok(Value::array(
                    rows.into_iter()
                        .map(|row| Value::from(&serde_json::Value::Object(row)))
                        .collect(),
                ))
            })
        }),
        ("commit", {
            let db = db.clone();
            native("commit", move |_, _| {
                Ok(Value::from(db.commit().map_err(thrown)? as f64))
            })
        }),
    ])
}

fn snapshot_name(args: &[Value]) -> Result<String, EvalError> {
    match arg(args, 0) {
        Value::Undefined | Value::Null => Ok(DEFAULT_SNAPSHOT.to_owned()),
        _ => text_arg(args, 0, "snapshot name"),
    }
}

fn tools(services: &Services) -> Value {
    let (db, snapshots) = (&services.database, &services.snapshots);
    Value::object([
        ("saveSqlLite", {
            let (db, snapshots) = (db.clone(), snapshots.clone());
            native("saveSqlLite", move |_, args| {
                let name = snapshot_name(args)?;
                snapshots.save(&name, &db.export()).map_err(thrown)?;
                Ok(Value::Bool(true))
            })
        }),
        ("readSqlLite", {
            let (db, snapshots) = (db.clone(), snapshots.clone());
            native("readSqlLite", move |_, args| {
                let name = snapshot_name(args)?;
                match snapshots.load(&name).map_err(thrown)? {
                    Some(snapshot) => {
                        db.import(&snapshot).map_err(thrown)?;
                        Ok(Value::Bool(true))
                    }
                    None => Ok(Value::Bool(false)),
                }
            })
        }),
        ("deleteSqlLite", {
            let snapshots = snapshots.clone();
            native("deleteSqlLite", move |_, args| {
                let name = snapshot_name(args)?;
                Ok(Value::Bool(snapshots.delete(&name).map_err(thrown)?))
            })
        }),
    ])
}

fn alert_box(services: &Services) -> Value {
    let (alerts, spawner) = (services.alerts.clone(), services.spawner.clone());
    native("alertBox", move |_, args| {
        let alert: Alert = serde_json::from_value(arg(args, 0).to_json())
            .map_err(|error| EvalError::type_error(format!("alertBox: {error}")))?;
        let (promise, resolver) = Promise::pending();
        let answer = alerts.present(alert);
        spawner.spawn(
            async move {
                resolver.resolve(match answer.await {
                    Some(button) => Value::from(button),
                    None => Value::Null,
                });
            }
            .boxed_local(),
        );
        Ok(Value::Promise(promise))
    })
}
