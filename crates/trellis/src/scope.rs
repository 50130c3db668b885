//! One level's formula scope: `{var, call, fetch, query}`.
//!
//! `var` maps names to live signals. `call` holds callables compiled against
//! the composed scope itself, `fetch` and `query` hold functions returning
//! promises that settle on the session's task spawner.

use crate::context::{EngineContext, FormulaKind, ScopeView};
use crate::formula::ast::Name;
use crate::formula::builtins::{arg, error_object};
use crate::formula::{Environment, EvalError, Function, Program, Promise, Signal, Value};
use crate::services::{HttpRequest, QueryPage, QueryRequest, Row, Sort};
use crate::variables::Instantiation;
use futures::FutureExt;
use indexmap::IndexMap;
use std::fmt;
use std::rc::Rc;
use trellis_model::{Callable, Fetcher, Query, Variable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    App,
    Page,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::App => "app",
            Self::Page => "page",
        })
    }
}

/// The document collections a level is composed from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeInputs {
    pub variables: Rc<Vec<Variable>>,
    pub queries: Rc<Vec<Query>>,
    pub fetchers: Rc<Vec<Fetcher>>,
    pub callables: Rc<Vec<Callable>>,
}

impl ScopeInputs {
    pub fn new(
        variables: Vec<Variable>,
        queries: Vec<Query>,
        fetchers: Vec<Fetcher>,
        callables: Vec<Callable>,
    ) -> Self {
        Self {
            variables: Rc::new(variables),
            queries: Rc::new(queries),
            fetchers: Rc::new(fetchers),
            callables: Rc::new(callables),
        }
    }

    fn same_as(&self, other: &ScopeInputs) -> bool {
        fn same<T: PartialEq>(a: &Rc<Vec<T>>, b: &Rc<Vec<T>>) -> bool {
            Rc::ptr_eq(a, b) || a == b
        }
        same(&self.variables, &other.variables)
            && same(&self.queries, &other.queries)
            && same(&self.fetchers, &other.fetchers)
            && same(&self.callables, &other.callables)
    }
}

/// `{var, call, fetch, query}` as a formula value.
pub fn level_value(
    vars: &IndexMap<Name, Signal>,
    calls: &IndexMap<Name, Value>,
    fetches: &IndexMap<Name, Value>,
    queries: &IndexMap<Name, Value>,
) -> Value {
    let var = vars
        .iter()
        .map(|(name, signal)| (name.clone(), Value::Signal(signal.clone())));
    let section = |entries: &IndexMap<Name, Value>| {
        Value::object(entries.iter().map(|(name, value)| (name.clone(), value.clone())))
    };
    Value::object([
        ("var", Value::object(var)),
        ("call", section(calls)),
        ("fetch", section(fetches)),
        ("query", section(queries)),
    ])
}

pub struct FormulaScope {
    level: Level,
    /// Every variable visible at this level, page names shadowing app names.
    vars: IndexMap<Name, Signal>,
    own: IndexMap<Name, Signal>,
    value: Value,
    parent: Option<Rc<FormulaScope>>,
    instantiation: Rc<Instantiation>,
    inputs: ScopeInputs,
}

impl fmt::Debug for FormulaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormulaScope")
            .field("level", &self.level)
            .field("vars", &self.own.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for FormulaScope {
    fn default() -> Self {
        Self {
            level: Level::App,
            vars: IndexMap::new(),
            own: IndexMap::new(),
            value: level_value(&IndexMap::new(), &IndexMap::new(), &IndexMap::new(), &IndexMap::new()),
            parent: None,
            instantiation: Rc::default(),
            inputs: ScopeInputs::default(),
        }
    }
}

// Callables capture the scope value they are stored in. Emptying the
// function sections breaks that cycle once the scope itself goes away.
impl Drop for FormulaScope {
    fn drop(&mut self) {
        for section in ["call", "fetch", "query"] {
            if let Some(Value::Object(map)) = self.value.field(section) {
                if let Ok(mut map) = map.try_borrow_mut() {
                    map.clear();
                }
            }
        }
    }
}

impl FormulaScope {
    pub fn level(&self) -> Level {
        self.level
    }

    pub fn vars(&self) -> &IndexMap<Name, Signal> {
        &self.vars
    }

    /// Variables declared at this level only.
    pub fn own_vars(&self) -> &IndexMap<Name, Signal> {
        &self.own
    }

    pub fn var(&self, name: &str) -> Option<&Signal> {
        self.vars.get(name)
    }

    /// The scope as formulas see it: `app` at app level, `page` on a page.
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn parent(&self) -> Option<&Rc<FormulaScope>> {
        self.parent.as_ref()
    }

    pub fn instantiation(&self) -> &Rc<Instantiation> {
        &self.instantiation
    }

    pub fn inputs(&self) -> &ScopeInputs {
        &self.inputs
    }

    /// Looks up `call.<name>`.
    pub fn callable(&self, name: &str) -> Option<Value> {
        self.value.field("call")?.field(name)
    }

    pub fn view(&self) -> ScopeView {
        match &self.parent {
            None => ScopeView {
                app: self.value.clone(),
                page: None,
                vars: self.vars.clone(),
            },
            Some(app) => ScopeView {
                app: app.value.clone(),
                page: Some(self.value.clone()),
                vars: self.vars.clone(),
            },
        }
    }

    /// Whether composing these inputs again would give an equivalent scope.
    pub fn is_for(
        &self,
        instantiation: &Rc<Instantiation>,
        inputs: &ScopeInputs,
        parent: Option<&Rc<FormulaScope>>,
    ) -> bool {
        let same_parent = match (&self.parent, parent) {
            (None, None) => true,
            (Some(previous), Some(parent)) => Rc::ptr_eq(previous, parent),
            _ => false,
        };
        same_parent && Rc::ptr_eq(&self.instantiation, instantiation) && self.inputs.same_as(inputs)
    }
}

/// The app scope and, once a page is open, the page scope.
#[derive(Debug, Clone)]
pub struct Scopes {
    pub app: Rc<FormulaScope>,
    pub page: Option<Rc<FormulaScope>>,
}

impl Scopes {
    /// The innermost scope.
    pub fn current(&self) -> &Rc<FormulaScope> {
        self.page.as_ref().unwrap_or(&self.app)
    }

    pub fn view(&self) -> ScopeView {
        self.current().view()
    }

    pub fn ptr_eq(&self, other: &Scopes) -> bool {
        Rc::ptr_eq(&self.app, &other.app)
            && match (&self.page, &other.page) {
                (None, None) => true,
                (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                _ => false,
            }
    }
}

/// Builds the scope of one level from its instantiated variables.
pub fn compose(
    context: &Rc<EngineContext>,
    level: Level,
    instantiation: Rc<Instantiation>,
    inputs: ScopeInputs,
    parent: Option<Rc<FormulaScope>>,
) -> Rc<FormulaScope> {
    let mut own = IndexMap::new();
    for variable in inputs.variables.iter() {
        if let Some(instance) = instantiation.instance(&variable.id) {
            own.insert(instance.name.clone(), instance.signal.clone());
        }
    }
    let mut vars = parent.as_ref().map(|app| app.vars.clone()).unwrap_or_default();
    for (name, signal) in &own {
        vars.insert(name.clone(), signal.clone());
    }

    let queries: IndexMap<Name, Value> = inputs
        .queries
        .iter()
        .map(|query| (Name::from(query.name.as_str()), query_function(context, query)))
        .collect();
    let value = level_value(&own, &IndexMap::new(), &IndexMap::new(), &queries);
    let scope = FormulaScope {
        level,
        vars,
        own,
        value,
        parent,
        instantiation,
        inputs,
    };

    // Callables and fetchers see the scope they belong to, so they are
    // compiled against the finished view and stored into it afterwards.
    let view = scope.view();
    let fetches: Vec<(Name, Value)> = scope
        .inputs
        .fetchers
        .iter()
        .map(|fetcher| (Name::from(fetcher.name.as_str()), fetch_function(context, fetcher, &view)))
        .collect();
    let calls: Vec<(Name, Value)> = scope
        .inputs
        .callables
        .iter()
        .map(|callable| (Name::from(callable.name.as_str()), call_function(context, callable, &view)))
        .collect();
    fill(&scope.value, "fetch", fetches);
    fill(&scope.value, "call", calls);

    log::debug!(
        "composed {level} scope: {} vars, {} calls, {} fetchers, {} queries",
        scope.own.len(),
        scope.inputs.callables.len(),
        scope.inputs.fetchers.len(),
        scope.inputs.queries.len()
    );
    Rc::new(scope)
}

fn fill(value: &Value, section: &str, entries: Vec<(Name, Value)>) {
    if let Some(Value::Object(map)) = value.field(section) {
        map.borrow_mut().extend(entries);
    }
}

fn compile_error_function(name: &str, message: String) -> Value {
    Value::Function(Function::native(name, move |_, _| {
        Err(EvalError::Thrown(error_object("SyntaxError", &message)))
    }))
}

/// `call.<name>(...args)`: runs the body with `args` bound. A body that
/// exports a function is called with the same arguments.
fn call_function(context: &Rc<EngineContext>, callable: &Callable, view: &ScopeView) -> Value {
    let environment = context
        .environment(FormulaKind::Callable, view)
        .with("args", Value::Undefined);
    let program = match context.evaluator.compile(&callable.function_code, &environment) {
        Ok(program) => program,
        Err(error) => {
            log::warn!("callable `{}` does not compile: {error}", callable.name);
            return compile_error_function(&callable.name, error.to_string());
        }
    };
    let context = context.clone();
    Value::Function(Function::native(callable.name.as_str(), move |interpreter, args| {
        let environment = environment.clone().with("args", Value::array(args.to_vec()));
        let exports = context.evaluator.evaluate(&program, &environment)?.exports;
        match exports {
            Value::Function(function) => interpreter.call_function(&function, args),
            exports => Ok(exports),
        }
    }))
}

/// `fetch.<name>(props)`: a promise of the parsed response, or `{error}`.
fn fetch_function(context: &Rc<EngineContext>, fetcher: &Fetcher, view: &ScopeView) -> Value {
    let environment = context
        .environment(FormulaKind::Fetcher, view)
        .with("props", Value::Undefined);
    let program = if fetcher.function_code.trim().is_empty() {
        None
    } else {
        match context.evaluator.compile(&fetcher.function_code, &environment) {
            Ok(program) => Some(program),
            Err(error) => {
                log::warn!("fetcher `{}` does not compile: {error}", fetcher.name);
                return compile_error_function(&fetcher.name, error.to_string());
            }
        }
    };
    let context = context.clone();
    let fetcher = fetcher.clone();
    Value::Function(Function::native(fetcher.name.clone(), move |_, args| {
        let (promise, resolver) = Promise::pending();
        let request = match request_shape(&context, &fetcher, program.as_deref(), &environment, arg(args, 0)) {
            Ok(request) => request,
            Err(error) => {
                resolver.resolve(fetch_error(error.to_string()));
                return Ok(Value::Promise(promise));
            }
        };
        let response = context.services.http.send(request);
        context.services.spawner.spawn(
            async move {
                resolver.resolve(match response.await {
                    Ok(response) if response.is_success() => {
                        match serde_json::from_str::<serde_json::Value>(&response.body) {
                            Ok(json) => Value::from_json(&json),
                            Err(_) => Value::from(response.body),
                        }
                    }
                    Ok(response) => fetch_error(format!("HTTP {}", response.status)),
                    Err(error) => fetch_error(error.to_string()),
                });
            }
            .boxed_local(),
        );
        Ok(Value::Promise(promise))
    }))
}

fn fetch_error(message: String) -> Value {
    Value::object([("error", Value::from(message))])
}

/// The static fetcher config with whatever the request-shape formula
/// exported laid over it.
fn request_shape(
    context: &EngineContext,
    fetcher: &Fetcher,
    program: Option<&Program>,
    environment: &Environment,
    props: Value,
) -> Result<HttpRequest, EvalError> {
    let mut protocol = fetcher.protocol.clone();
    let mut domain = fetcher.domain.clone();
    let mut method = fetcher.method.clone();
    let mut path = fetcher.path.clone();
    let mut headers = fetcher.headers.clone();
    let mut body = fetcher.body.clone();
    if let Some(program) = program {
        let environment = environment.clone().with("props", props);
        let outcome = context.evaluator.evaluate(program, &environment)?;
        if !outcome.untouched {
            let exports = outcome.exports;
            let text = |key: &str| exports.field(key).filter(|value| !value.is_nullish());
            if let Some(value) = text("protocol") {
                protocol = value.to_display();
            }
            if let Some(value) = text("domain") {
                domain = value.to_display();
            }
            if let Some(value) = text("method") {
                method = value.to_display();
            }
            if let Some(value) = text("path") {
                path = value.to_display();
            }
            if let Some(Value::Object(map)) = text("headers") {
                for (name, value) in map.borrow().iter() {
                    headers.insert(name.to_string(), value.to_display());
                }
            }
            match text("body") {
                Some(Value::String(text)) => body = Some(text.to_string()),
                Some(value) => body = Some(value.to_json().to_string()),
                None => {}
            }
        }
    }
    Ok(HttpRequest {
        method: method.to_uppercase(),
        url: format!(
            "{}://{}/{}",
            protocol.trim_end_matches("://"),
            domain.trim_end_matches('/'),
            path.trim_start_matches('/')
        ),
        headers,
        body,
    })
}

/// `query.<name>({params, page, filter, sort, rowPerPage})`: a promise of
/// `{data, columns, totalPage, currentPage}`. Failures resolve with empty
/// data and an `error` field.
fn query_function(context: &Rc<EngineContext>, query: &Query) -> Value {
    let context = context.clone();
    let query = query.clone();
    Value::Function(Function::native(query.name.clone(), move |_, args| {
        let request = query_request(&query, &arg(args, 0));
        let page = request.page;
        let (promise, resolver) = Promise::pending();
        let result = context.services.queries.execute(request);
        context.services.spawner.spawn(
            async move {
                resolver.resolve(match result.await {
                    Ok(result) => page_value(&result),
                    Err(error) => {
                        log::debug!("query failed: {error}");
                        let failed = page_value(&QueryPage {
                            current_page: page,
                            ..QueryPage::default()
                        });
                        if let Value::Object(map) = &failed {
                            map.borrow_mut()
                                .insert(Name::from("error"), Value::from(error.to_string()));
                        }
                        failed
                    }
                });
            }
            .boxed_local(),
        );
        Ok(Value::Promise(promise))
    }))
}

fn page_value(page: &QueryPage) -> Value {
    Value::from_json(&serde_json::to_value(page).unwrap_or_default())
}

fn query_request(query: &Query, props: &Value) -> QueryRequest {
    let field = |key: &str| props.field(key).filter(|value| !value.is_nullish());
    let page = field("page")
        .map(|page| page.to_number())
        .filter(|page| page.is_finite() && *page >= 1.0)
        .map_or(1, |page| page as usize);
    let filter = match field("filter").map(|filter| filter.to_json()) {
        Some(serde_json::Value::Object(filter)) => filter,
        _ => Row::new(),
    };
    let sort = field("sort").and_then(|sort| {
        let column = sort.field("column")?.as_str()?.to_owned();
        let descending = sort.field("descending").is_some_and(|value| value.is_truthy())
            || sort
                .field("direction")
                .and_then(|direction| direction.as_str().map(|d| d.eq_ignore_ascii_case("desc")))
                .unwrap_or(false);
        Some(Sort { column, descending })
    });
    let row_per_page = field("rowPerPage")
        .map(|rows| rows.to_number())
        .filter(|rows| rows.is_finite() && *rows >= 1.0)
        .map(|rows| rows as usize)
        .or(query.row_per_page.map(|rows| rows as usize));
    QueryRequest {
        query: query.clone(),
        params: field("params").map(|params| params.to_json()).unwrap_or(serde_json::Value::Null),
        page,
        filter,
        sort,
        row_per_page,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::services::{HttpResponse, RecordingTransport, Services};
    use crate::variables::instantiate;
    use futures::executor::LocalPool;
    use std::cell::RefCell;
    use trellis_model::{Column, Table};

    struct Fixture {
        pool: LocalPool,
        http: Rc<RecordingTransport>,
        context: Rc<EngineContext>,
    }

    fn fixture() -> Fixture {
        let pool = LocalPool::new();
        let http = Rc::new(RecordingTransport::new());
        let table = Table {
            id: "t1".into(),
            name: "todos".to_owned(),
            columns: vec![Column {
                name: "title".to_owned(),
                kind: "text".to_owned(),
                ..Column::default()
            }],
        };
        let services = Services::in_memory(&[table], http.clone(), Rc::new(pool.spawner()));
        Fixture {
            pool,
            http,
            context: EngineContext::new(services, EngineConfig::default()),
        }
    }

    fn app_scope(context: &Rc<EngineContext>, inputs: ScopeInputs) -> Rc<FormulaScope> {
        let instantiation = Rc::new(instantiate(context, inputs.variables.clone(), None, Rc::default()));
        compose(context, Level::App, instantiation, inputs, None)
    }

    fn sink() -> (Value, Rc<RefCell<Vec<serde_json::Value>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let push = Value::Function(Function::native("push", {
            let seen = seen.clone();
            move |_, args| {
                seen.borrow_mut().push(arg(args, 0).to_json());
                Ok(Value::Undefined)
            }
        }));
        (push, seen)
    }

    #[test]
    fn page_scope_shadows_and_exposes_app() {
        let Fixture { context, .. } = fixture();
        let app = app_scope(
            &context,
            ScopeInputs::new(
                vec![
                    Variable::state("a1", "title", "module.exports = 'app'"),
                    Variable::state("a2", "user", "module.exports = 'ada'"),
                ],
                vec![],
                vec![],
                vec![],
            ),
        );
        let page_variables = Rc::new(vec![Variable::state("p1", "title", "module.exports = 'page'")]);
        let instantiation = Rc::new(instantiate(
            &context,
            page_variables.clone(),
            Some(app.clone()),
            Rc::default(),
        ));
        let page = compose(
            &context,
            Level::Page,
            instantiation,
            ScopeInputs {
                variables: page_variables,
                ..ScopeInputs::default()
            },
            Some(app.clone()),
        );
        assert_eq!(page.var("title").unwrap().get_untracked(), Value::from("page"));
        assert!(page.var("user").unwrap().ptr_eq(app.var("user").unwrap()));

        let environment = context.environment(FormulaKind::Computed, &page.view());
        let outcome = context
            .evaluator
            .run(
                "module.exports = [title.get(), app.var.title.get(), page.var.title.get(), user.get()]",
                &environment,
            )
            .unwrap();
        assert_eq!(
            outcome.exports.to_json(),
            serde_json::json!(["page", "app", "page", "ada"])
        );
    }

    #[test]
    fn callables_see_their_own_scope() {
        let Fixture { context, .. } = fixture();
        let scope = app_scope(
            &context,
            ScopeInputs::new(
                vec![Variable::state("v1", "count", "module.exports = 1")],
                vec![],
                vec![],
                vec![
                    Callable {
                        id: "c1".into(),
                        name: "bump".to_owned(),
                        function_code: "module.exports = (by) => count.set(count.get() + by)".to_owned(),
                    },
                    Callable {
                        id: "c2".into(),
                        name: "twice".to_owned(),
                        function_code: "app.call.bump(args[0]); app.call.bump(args[0]); module.exports = count.get()"
                            .to_owned(),
                    },
                ],
            ),
        );
        let twice = scope.callable("twice").unwrap();
        let result = twice.as_function().unwrap().call(&[Value::from(2)]).unwrap();
        assert_eq!(result, Value::from(5));
        assert_eq!(scope.var("count").unwrap().get_untracked(), Value::from(5));
    }

    #[test]
    fn broken_callables_throw_when_called() {
        let Fixture { context, .. } = fixture();
        let scope = app_scope(
            &context,
            ScopeInputs::new(
                vec![],
                vec![],
                vec![],
                vec![Callable {
                    id: "c1".into(),
                    name: "broken".to_owned(),
                    function_code: "module.exports = nowhere".to_owned(),
                }],
            ),
        );
        let error = scope
            .callable("broken")
            .unwrap()
            .as_function()
            .unwrap()
            .call(&[])
            .unwrap_err();
        assert_eq!(error.to_string(), "SyntaxError: `nowhere` is not defined");
    }

    #[test]
    fn queries_resolve_pages_through_the_executor() {
        let Fixture {
            mut pool, context, ..
        } = fixture();
        for title in ["a", "b", "c"] {
            context
                .services
                .database
                .record("todos", serde_json::json!({ "title": title }).as_object().cloned().unwrap())
                .unwrap();
        }
        let scope = app_scope(
            &context,
            ScopeInputs::new(
                vec![],
                vec![
                    Query {
                        id: "q1".into(),
                        name: "todos".to_owned(),
                        table: Some("todos".to_owned()),
                        ..Query::default()
                    },
                    Query {
                        id: "q2".into(),
                        name: "missing".to_owned(),
                        ..Query::default()
                    },
                ],
                vec![],
                vec![],
            ),
        );
        let (push, seen) = sink();
        let environment = context
            .environment(FormulaKind::Effect, &scope.view())
            .with("push", push);
        context
            .evaluator
            .run(
                "app.query.todos({ page: 2, rowPerPage: 2, sort: { column: 'title', descending: true } })
                     .then(result => push([result.data.map(row => row.title), result.totalPage, result.currentPage]))
                 app.query.missing({ page: 3 }).then(result => push([result.data, result.currentPage, typeof result.error]))",
                &environment,
            )
            .unwrap();
        pool.run_until_stalled();
        assert_eq!(
            *seen.borrow(),
            vec![
                serde_json::json!([["a"], 2, 2]),
                serde_json::json!([[], 3, "string"]),
            ]
        );
    }

    #[test]
    fn fetchers_merge_the_request_shape_over_the_config() {
        let Fixture {
            mut pool,
            http,
            context,
        } = fixture();
        http.respond(
            "POST",
            "https://api.example.com/users/7",
            HttpResponse::ok(r#"{"name":"Ada"}"#),
        );
        let mut fetcher = Fetcher::new("f1", "user");
        fetcher.domain = "api.example.com".to_owned();
        fetcher.path = "/users".to_owned();
        fetcher.function_code =
            "module.exports = { method: 'post', path: `/users/${props.id}`, body: { id: props.id } }".to_owned();
        let mut missing = Fetcher::new("f2", "missing");
        missing.domain = "api.example.com".to_owned();
        let scope = app_scope(&context, ScopeInputs::new(vec![], vec![], vec![fetcher, missing], vec![]));

        let (push, seen) = sink();
        let environment = context
            .environment(FormulaKind::Effect, &scope.view())
            .with("push", push);
        context
            .evaluator
            .run(
                "app.fetch.user({ id: 7 }).then(push)
                 app.fetch.missing().then(push)",
                &environment,
            )
            .unwrap();
        pool.run_until_stalled();
        assert_eq!(
            *seen.borrow(),
            vec![
                serde_json::json!({ "name": "Ada" }),
                serde_json::json!({ "error": "HTTP 404" }),
            ]
        );
        let requests = http.requests();
        assert_eq!(requests[0].body.as_deref(), Some(r#"{"id":7}"#));
        assert_eq!(requests[1].url, "https://api.example.com/");
    }
}
