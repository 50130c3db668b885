use futures::executor::LocalPool;
use std::cell::Cell;
use std::rc::Rc;
use trellis::reactive::Effect;
use trellis::services::{Database, HttpResponse, RecordingTransport};
use trellis::trellis_model::{
    Application, Column, Container, Fetcher, Id, Page, Query, Table, Variable,
};
use trellis::{
    BindingMode, EngineConfig, ErrorCategory, ErrorSubject, InitialValues, Services, Session,
    TestClock, Value,
};

struct Harness {
    pool: LocalPool,
    http: Rc<RecordingTransport>,
    clock: TestClock,
    session: Session,
}

fn harness(application: Application, config: EngineConfig) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let pool = LocalPool::new();
    let http = Rc::new(RecordingTransport::new());
    let clock = TestClock::new();
    let services = Services::in_memory(&application.tables, http.clone(), Rc::new(pool.spawner()))
        .with_clock(Rc::new(clock.clone()));
    let session = Session::new(
        application,
        services,
        trellis::ElementRegistry::standard(),
        config,
    );
    Harness {
        pool,
        http,
        clock,
        session,
    }
}

fn tree(containers: Vec<Container>) -> Vec<Container> {
    let root_id = containers[0].id.clone();
    let children: Vec<Id> = containers[1..].iter().map(|child| child.id.clone()).collect();
    containers
        .into_iter()
        .enumerate()
        .map(|(index, mut container)| {
            if index == 0 {
                container.children = children.clone();
            } else {
                container.parent = Some(root_id.clone());
            }
            container
        })
        .collect()
}

fn counter_app() -> Application {
    Application {
        name: "counter".to_owned(),
        variables: vec![Variable::state("a1", "count", "module.exports = 0")],
        pages: vec![Page {
            id: "p1".into(),
            name: "home".to_owned(),
            variables: vec![Variable::computed(
                "p1v1",
                "label",
                "module.exports = `Count: ${count.get()}`",
            )],
            containers: tree(vec![
                Container::new("root", "Page"),
                Container::new("button", "Button")
                    .with_property("label", "module.exports = label.get()")
                    .with_property("onClick", "module.exports = () => count.set(count.get() + 1)"),
                Container::new("double", "Text")
                    .with_property("text", "module.exports = count.get() * 2"),
            ]),
            ..Page::default()
        }],
        ..Application::default()
    }
}

#[test]
fn clicking_updates_every_dependent_property() {
    let Harness { session, .. } = harness(counter_app(), EngineConfig::default());
    session.open_page("home", InitialValues::new()).unwrap();
    let button = Id::from("button");
    assert_eq!(session.prop(&button, "label"), Some(Value::from("Count: 0")));

    session.invoke(&button, "onClick", &[]).unwrap();
    session.invoke(&button, "onClick", &[]).unwrap();

    assert_eq!(session.prop(&button, "label"), Some(Value::from("Count: 2")));
    assert_eq!(session.prop(&Id::from("double"), "text"), Some(Value::from(4)));
    assert_eq!(
        session.resolved_tree(),
        serde_json::json!({
            "id": "root",
            "type": "Page",
            "props": {},
            "children": [
                {
                    "id": "button",
                    "type": "Button",
                    "props": { "label": "Count: 2", "onClick": "[Function anonymous]" },
                    "children": [],
                },
                {
                    "id": "double",
                    "type": "Text",
                    "props": { "text": 4 },
                    "children": [],
                },
            ],
        })
    );
    assert!(session.errors().is_empty());
}

#[test]
fn app_formulas_cannot_see_page_variables() {
    let mut application = counter_app();
    application
        .variables
        .push(Variable::computed("a2", "echo", "module.exports = label.get()"));
    let Harness { session, .. } = harness(application, EngineConfig::default());
    session.open_page("home", InitialValues::new()).unwrap();

    let errors = session.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].subject,
        ErrorSubject::Variable {
            variable_id: Id::from("a2")
        }
    );
    assert_eq!(errors[0].category, ErrorCategory::Schema);
    assert!(errors[0].message.contains("`label` is not defined"), "{}", errors[0].message);
}

fn detail_app() -> Application {
    let mut application = counter_app();
    application.pages[0].containers = tree(vec![
        Container::new("root", "Page"),
        Container::new("open", "Button")
            .with_property("onClick", "module.exports = (id) => navigate('detail', { id: id })"),
    ]);
    application.pages.push(Page {
        id: "p2".into(),
        name: "detail".to_owned(),
        variables: vec![
            Variable::state("p2v1", "id", "module.exports = 0"),
            Variable::state("p2v2", "note", "module.exports = 'none'"),
        ],
        containers: tree(vec![
            Container::new("root2", "Page"),
            Container::new("heading", "Text").with_property("text", "module.exports = `#${id.get()}`"),
        ]),
        ..Page::default()
    });
    application
}

#[test]
fn initial_values_seed_page_state() {
    let Harness { session, .. } = harness(detail_app(), EngineConfig::default());
    let mut initial = InitialValues::new();
    initial.insert("id".into(), Value::from(7));
    initial.insert("unknown".into(), Value::from(1));
    session.open_page("detail", initial).unwrap();

    assert_eq!(session.variable("id").unwrap().get_untracked(), Value::from(7));
    assert_eq!(session.variable("note").unwrap().get_untracked(), Value::from("none"));
    assert_eq!(
        session.prop(&Id::from("heading"), "text"),
        Some(Value::from("#7"))
    );
}

#[test]
fn navigation_is_applied_on_settle() {
    let Harness { session, .. } = harness(detail_app(), EngineConfig::default());
    session.open_page("home", InitialValues::new()).unwrap();
    session
        .invoke(&Id::from("open"), "onClick", &[Value::from(42)])
        .unwrap();
    assert_eq!(session.page_name().as_deref(), Some("home"));

    assert_eq!(session.settle().unwrap(), 1);
    assert_eq!(session.page_name().as_deref(), Some("detail"));
    assert_eq!(session.variable("id").unwrap().get_untracked(), Value::from(42));
    assert!(session.prop(&Id::from("open"), "onClick").is_none());
    assert_eq!(session.settle().unwrap(), 0);
}

fn two_inputs() -> Application {
    Application {
        variables: vec![
            Variable::state("a1", "a", "module.exports = 1"),
            Variable::state("a2", "b", "module.exports = 1"),
            Variable::computed("a3", "doubled", "module.exports = a.get() * 2"),
        ],
        pages: vec![Page {
            id: "p1".into(),
            name: "home".to_owned(),
            containers: tree(vec![
                Container::new("root", "Page"),
                Container::new("noisy", "Text")
                    .with_property("text", "module.exports = a.get() + Math.random()"),
            ]),
            ..Page::default()
        }],
        ..Application::default()
    }
}

#[test]
fn computed_variables_rerun_only_for_their_dependencies() {
    let Harness { session, .. } = harness(two_inputs(), EngineConfig::default());
    session.open_page("home", InitialValues::new()).unwrap();
    let doubled = session.variable("doubled").unwrap();
    let runs = Rc::new(Cell::new(0));
    let _watch = Effect::new(session.runtime(), {
        let runs = runs.clone();
        move || {
            doubled.get();
            runs.set(runs.get() + 1);
        }
    });
    assert_eq!(runs.get(), 1);

    session.variable("b").unwrap().set(Value::from(5)).unwrap();
    assert_eq!(runs.get(), 1);
    session.variable("a").unwrap().set(Value::from(5)).unwrap();
    assert_eq!(runs.get(), 2);
    assert_eq!(
        session.variable("doubled").unwrap().get_untracked(),
        Value::from(10)
    );
}

#[test]
fn whole_scope_bindings_rerun_on_any_variable() {
    let Harness { session, .. } = harness(two_inputs(), EngineConfig::default());
    session.open_page("home", InitialValues::new()).unwrap();
    let noisy = Id::from("noisy");
    let before = session.prop(&noisy, "text").unwrap();
    session.variable("b").unwrap().set(Value::from(5)).unwrap();
    assert_ne!(session.prop(&noisy, "text").unwrap(), before);
}

#[test]
fn fine_grained_bindings_rerun_only_on_what_they_read() {
    let config = EngineConfig {
        binding_mode: BindingMode::FineGrained,
        ..EngineConfig::default()
    };
    let Harness { session, .. } = harness(two_inputs(), config);
    session.open_page("home", InitialValues::new()).unwrap();
    let noisy = Id::from("noisy");
    let before = session.prop(&noisy, "text").unwrap();
    session.variable("b").unwrap().set(Value::from(5)).unwrap();
    assert_eq!(session.prop(&noisy, "text").unwrap(), before);
    session.variable("a").unwrap().set(Value::from(5)).unwrap();
    assert_ne!(session.prop(&noisy, "text").unwrap(), before);
}

#[test]
fn property_errors_are_upserted_and_cleared() {
    let mut application = counter_app();
    application.pages[0].containers = tree(vec![
        Container::new("root", "Page"),
        Container::new("guard", "Text").with_property(
            "text",
            "if (count.get() > 0) throw new Error(`count is ${count.get()}`); module.exports = 'ok'",
        ),
    ]);
    let Harness { session, .. } = harness(application, EngineConfig::default());
    session.open_page("home", InitialValues::new()).unwrap();
    let count = session.variable("count").unwrap();
    let guard = Id::from("guard");

    count.set(Value::from(1)).unwrap();
    count.set(Value::from(2)).unwrap();
    let errors = session.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].category, ErrorCategory::Value);
    assert_eq!(errors[0].message, "Error: count is 2");
    assert_eq!(session.prop(&guard, "text"), Some(Value::from("ok")));

    count.set(Value::from(0)).unwrap();
    assert!(session.errors().is_empty());

    count.set(Value::from(3)).unwrap();
    assert_eq!(session.errors().len(), 1);
    session
        .set_containers(tree(vec![Container::new("root", "Page")]))
        .unwrap();
    assert!(session.errors().is_empty());
}

#[test]
fn error_bursts_are_capped_per_window() {
    let Harness { session, clock, .. } = harness(Application::default(), EngineConfig::default());
    let ledger = session.ledger();
    let id = Id::from("v1");
    let admitted = (0..15)
        .filter(|attempt| ledger.variable(&id, ErrorCategory::Value, format!("failure {attempt}")))
        .count();
    assert_eq!(admitted, 10);
    assert_eq!(ledger.errors_untracked()[0].message, "failure 9");

    clock.advance_by(100);
    assert!(ledger.variable(&id, ErrorCategory::Value, "recovered"));
}

#[test]
fn a_throwing_computed_cannot_flood_the_ledger() {
    let application = Application {
        pages: vec![Page {
            id: "p1".into(),
            name: "home".to_owned(),
            variables: vec![
                Variable::state("p1v1", "n", "module.exports = 0"),
                Variable::computed(
                    "p1v2",
                    "checked",
                    "if (n.get() > 0) throw new Error('fail ' + n.get()); module.exports = n.get()",
                ),
            ],
            containers: tree(vec![
                Container::new("root", "Page"),
                Container::new("out", "Text").with_property("text", "module.exports = checked.get()"),
            ]),
            ..Page::default()
        }],
        ..Application::default()
    };
    let Harness { session, clock, .. } = harness(application, EngineConfig::default());
    session.open_page("home", InitialValues::new()).unwrap();
    let ledger = session.ledger();
    let before = ledger.revision();
    let n = session.variable("n").unwrap();
    for value in 1..=15 {
        n.set(Value::from(value)).unwrap();
    }

    assert!(ledger.revision() - before <= 10);
    assert_eq!(ledger.len(), 1);
    // Replacements inside a suppressed window are dropped, so the entry lags behind.
    let message = ledger.errors_untracked()[0].message.clone();
    assert!(message.contains("fail") && !message.contains("fail 15"), "{message}");
    assert_eq!(session.prop(&Id::from("out"), "text"), Some(Value::from(0)));

    clock.advance_by(100);
    n.set(Value::from(16)).unwrap();
    assert!(ledger.errors_untracked()[0].message.contains("fail 16"));

    clock.advance_by(100);
    n.set(Value::from(0)).unwrap();
    assert!(ledger.is_empty());
}

#[test]
fn page_state_feeds_a_concatenated_label() {
    let application = Application {
        pages: vec![Page {
            id: "p1".into(),
            name: "home".to_owned(),
            variables: vec![Variable::state("p1v1", "count", "module.exports = 0")],
            containers: tree(vec![
                Container::new("root", "Page"),
                Container::new("label", "Text")
                    .with_property("text", "module.exports = 'Count: ' + count.get()"),
            ]),
            ..Page::default()
        }],
        ..Application::default()
    };
    let Harness { session, .. } = harness(application, EngineConfig::default());
    session.open_page("home", InitialValues::new()).unwrap();
    let label = Id::from("label");
    assert_eq!(session.prop(&label, "text"), Some(Value::from("Count: 0")));

    session.variable("count").unwrap().set(Value::from(5)).unwrap();

    assert_eq!(session.prop(&label, "text"), Some(Value::from("Count: 5")));
    assert!(session.errors().is_empty());
}

#[test]
fn oversized_strings_become_property_errors() {
    let application = Application {
        pages: vec![Page {
            id: "p1".into(),
            name: "home".to_owned(),
            containers: tree(vec![
                Container::new("root", "Page"),
                Container::new("out", "Text").with_property("text", "module.exports = 'x'.repeat(1e300)"),
            ]),
            ..Page::default()
        }],
        ..Application::default()
    };
    let Harness { session, .. } = harness(application, EngineConfig::default());
    session.open_page("home", InitialValues::new()).unwrap();

    let errors = session.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("Invalid string length"), "{}", errors[0].message);
    assert_eq!(
        errors[0].subject,
        ErrorSubject::Property {
            container_id: Id::from("out"),
            property_name: "text".to_owned(),
        }
    );
}

#[test]
fn unchanged_documents_keep_the_composed_scope() {
    let Harness { session, .. } = harness(counter_app(), EngineConfig::default());
    session.open_page("home", InitialValues::new()).unwrap();
    let app = session.app_scope();
    let page = session.page_scope().unwrap();
    let count = session.variable("count").unwrap();
    count.set(Value::from(3)).unwrap();

    session.set_app_variables(session.application().variables);
    session
        .set_page_variables(session.application().pages[0].variables.clone())
        .unwrap();

    assert!(Rc::ptr_eq(&app, &session.app_scope()));
    assert!(Rc::ptr_eq(&page, &session.page_scope().unwrap()));
    assert_eq!(session.variable("count").unwrap().get_untracked(), Value::from(3));
}

#[test]
fn queries_and_fetchers_resolve_through_the_services() {
    let table = Table {
        id: "t1".into(),
        name: "todos".to_owned(),
        columns: vec![Column {
            name: "title".to_owned(),
            kind: "text".to_owned(),
            ..Column::default()
        }],
    };
    let mut fetcher = Fetcher::new("f1", "profile");
    fetcher.domain = "api.example.com".to_owned();
    fetcher.path = "/me".to_owned();
    let application = Application {
        tables: vec![table],
        queries: vec![Query {
            id: "q1".into(),
            name: "todos".to_owned(),
            table: Some("todos".to_owned()),
            ..Query::default()
        }],
        fetchers: vec![fetcher],
        variables: vec![
            Variable::state("a1", "titles", "module.exports = []"),
            Variable::state("a2", "who", "module.exports = ''"),
        ],
        pages: vec![Page {
            id: "p1".into(),
            name: "home".to_owned(),
            containers: tree(vec![
                Container::new("root", "Page"),
                Container::new("load", "Button").with_property(
                    "onClick",
                    "module.exports = () => {
                         app.query.todos({}).then(result => titles.set(result.data.map(row => row.title)))
                         app.fetch.profile().then(body => who.set(body.name))
                     }",
                ),
            ]),
            ..Page::default()
        }],
        ..Application::default()
    };
    let Harness {
        mut pool,
        http,
        session,
        ..
    } = harness(application, EngineConfig::default());
    http.respond("GET", "https://api.example.com/me", HttpResponse::ok(r#"{"name":"Ada"}"#));
    for title in ["write", "ship"] {
        let row = serde_json::json!({ "title": title });
        session
            .context()
            .services
            .database
            .record("todos", row.as_object().cloned().unwrap())
            .unwrap();
    }
    session.open_page("home", InitialValues::new()).unwrap();
    session.invoke(&Id::from("load"), "onClick", &[]).unwrap();
    assert_eq!(session.variable("who").unwrap().get_untracked(), Value::from(""));

    pool.run_until_stalled();

    assert_eq!(
        session.variable("titles").unwrap().get_untracked().to_json(),
        serde_json::json!(["write", "ship"])
    );
    assert_eq!(session.variable("who").unwrap().get_untracked(), Value::from("Ada"));
    assert_eq!(http.requests().len(), 1);
}
