use crate::Id;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: Id,
    pub name: String,
    #[serde(default)]
    pub pages: Vec<Page>,
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub queries: Vec<Query>,
    #[serde(default)]
    pub callables: Vec<Callable>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub fetchers: Vec<Fetcher>,
}

impl Application {
    /// Looks a page up by name first, then by id.
    pub fn page(&self, name_or_id: &str) -> Option<&Page> {
        self.pages
            .iter()
            .find(|page| page.name == name_or_id)
            .or_else(|| self.pages.iter().find(|page| page.id.as_str() == name_or_id))
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|table| table.name == name)
    }
}

/// An independently addressable screen.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: Id,
    pub name: String,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub callables: Vec<Callable>,
    #[serde(default)]
    pub fetchers: Vec<Fetcher>,
    #[serde(default)]
    pub queries: Vec<Query>,
}

/// One node of a page's layout tree.
///
/// The tree is stored flat: `parent` and `children` hold ids of siblings in
/// the same page. The root has no parent; `children` order is render order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: Id,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub parent: Option<Id>,
    #[serde(default)]
    pub children: Vec<Id>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: IndexMap<String, Property>,
}

impl Container {
    pub fn new(id: impl Into<Id>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent: None,
            children: Vec::new(),
            kind: kind.into(),
            properties: IndexMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, formula: impl Into<String>) -> Self {
        self.properties.insert(
            name.into(),
            Property {
                formula: formula.into(),
            },
        );
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Property {
    pub formula: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    State,
    Computed,
    Effect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub id: Id,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VariableKind,
    #[serde(default)]
    pub function_code: String,
    #[serde(default)]
    pub schema_code: String,
}

impl Variable {
    pub fn new(
        id: impl Into<Id>,
        name: impl Into<String>,
        kind: VariableKind,
        function_code: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            function_code: function_code.into(),
            schema_code: String::new(),
        }
    }

    pub fn state(id: impl Into<Id>, name: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(id, name, VariableKind::State, code)
    }

    pub fn computed(id: impl Into<Id>, name: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(id, name, VariableKind::Computed, code)
    }

    pub fn effect(id: impl Into<Id>, name: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(id, name, VariableKind::Effect, code)
    }

    pub fn with_schema(mut self, schema_code: impl Into<String>) -> Self {
        self.schema_code = schema_code.into();
        self
    }
}

/// A named, paginated data query. `source` is opaque to the engine and is
/// interpreted by the query executor collaborator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub id: Id,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_per_page: Option<u32>,
}

/// A named HTTP request template.
///
/// The static fields are the defaults; `function_code` may override any of
/// them per call by exporting an object with the same keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fetcher {
    pub id: Id,
    pub name: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub function_code: String,
}

impl Fetcher {
    pub fn new(id: impl Into<Id>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            protocol: default_protocol(),
            domain: String::new(),
            method: default_method(),
            path: String::new(),
            headers: IndexMap::new(),
            body: None,
            function_code: String::new(),
        }
    }
}

fn default_protocol() -> String {
    "https".to_owned()
}

fn default_method() -> String {
    "GET".to_owned()
}

/// A named function compiled once and exposed as `call.<name>`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Callable {
    pub id: Id,
    pub name: String,
    #[serde(default)]
    pub function_code: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: Id,
    pub name: String,
    #[serde(default)]
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub nullable: bool,
}

// The editor writes the root's parent as "" as often as it omits it.
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<Id>, D::Error>
where
    D: Deserializer<'de>,
{
    let parent = Option::<String>::deserialize(deserializer)?;
    Ok(parent.filter(|parent| !parent.is_empty()).map(Id::from))
}
