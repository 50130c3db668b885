//! Serializing a page to JSON and parsing it back reproduces the same
//! container tree (structural equality).

use trellis_model::{Application, Container, Id, Page, Variable, VariableKind, tree};

fn sample_page() -> Page {
    let mut root = Container::new("root", "Column");
    root.children = vec![Id::from("title"), Id::from("button")];
    let mut title = Container::new("title", "Text")
        .with_property("label", "module.exports = 'Count: ' + count.get()");
    title.parent = Some(Id::from("root"));
    let mut button = Container::new("button", "Button")
        .with_property("onClick", "module.exports = () => count.set(count.get() + 1)");
    button.parent = Some(Id::from("root"));

    Page {
        id: Id::from("page-1"),
        name: "home".to_owned(),
        containers: vec![root, title, button],
        variables: vec![Variable::state("v1", "count", "module.exports = 0")],
        ..Page::default()
    }
}

#[test]
fn page_round_trips_through_json() {
    let page = sample_page();
    let json = serde_json::to_string_pretty(&page).unwrap();
    let parsed: Page = serde_json::from_str(&json).unwrap();

    assert_eq!(parsed, page);
    assert_eq!(tree::validate_tree(&parsed.containers), Ok(Id::from("root")));
    let order: Vec<&str> = tree::walk(&parsed.containers)
        .iter()
        .map(|container| container.id.as_str())
        .collect();
    assert_eq!(order, vec!["root", "title", "button"]);
}

#[test]
fn editor_document_shape_is_accepted() {
    let json = r#"{
        "id": "app",
        "name": "Demo",
        "variables": [
            {"id": "g", "name": "greeting", "type": "state", "functionCode": "module.exports = 'hi'", "schemaCode": "return z.string()"}
        ],
        "pages": [{
            "id": "p",
            "name": "home",
            "containers": [
                {"id": "root", "parent": "", "children": ["t"], "type": "Column", "properties": {}},
                {"id": "t", "parent": "root", "children": [], "type": "Text",
                 "properties": {"label": {"formula": "module.exports = greeting.get()"}}}
            ]
        }]
    }"#;
    let app: Application = serde_json::from_str(json).unwrap();
    assert_eq!(app.variables[0].kind, VariableKind::State);
    assert_eq!(app.variables[0].schema_code, "return z.string()");

    let page = app.page("home").unwrap();
    assert!(page.containers[0].parent.is_none());
    assert_eq!(tree::validate_tree(&page.containers), Ok(Id::from("root")));
    assert_eq!(
        page.containers[1].properties["label"].formula,
        "module.exports = greeting.get()"
    );
}
