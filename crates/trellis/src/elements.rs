//! What each container type accepts: one schema per property, and whether
//! the element is a form.

use crate::error::EngineError;
use crate::formula::FormulaEngine;
use crate::schema::Schema;
use crate::validators::compile_schema;
use indexmap::IndexMap;
use serde::Deserialize;
use std::rc::Rc;

#[derive(Debug, Clone, Default)]
pub struct ElementSpec {
    pub properties: IndexMap<String, Rc<Schema>>,
    /// Descendants of a form get `formContext`.
    pub form: bool,
}

impl ElementSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.properties.insert(name.into(), Rc::new(schema));
        self
    }

    pub fn form(mut self) -> Self {
        self.form = true;
        self
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ElementSource {
    #[serde(default)]
    form: bool,
    #[serde(default)]
    properties: IndexMap<String, String>,
}

/// Element specs by container type. Unknown types bind without validation.
#[derive(Debug, Clone, Default)]
pub struct ElementRegistry {
    elements: IndexMap<String, ElementSpec>,
    unknown: ElementSpec,
}

impl ElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, spec: ElementSpec) -> &mut Self {
        self.elements.insert(kind.into(), spec);
        self
    }

    pub fn get(&self, kind: &str) -> &ElementSpec {
        self.elements.get(kind).unwrap_or(&self.unknown)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.elements.contains_key(kind)
    }

    pub fn is_form(&self, kind: &str) -> bool {
        self.get(kind).form
    }

    /// The stock palette of the builder.
    pub fn standard() -> Self {
        let text = || Schema::string().optional();
        let callback = || Schema::function().optional();
        let flag = || Schema::boolean().optional();
        let mut registry = Self::new();
        registry
            .register("Page", ElementSpec::new())
            .register("Container", ElementSpec::new().property("visible", flag()))
            .register(
                "Text",
                ElementSpec::new()
                    .property("text", Schema::any())
                    .property("visible", flag()),
            )
            .register(
                "Button",
                ElementSpec::new()
                    .property("label", text())
                    .property("disabled", flag())
                    .property("onClick", callback()),
            )
            .register(
                "Input",
                ElementSpec::new()
                    .property("value", Schema::any())
                    .property("placeholder", text())
                    .property("disabled", flag())
                    .property("onChange", callback()),
            )
            .register(
                "Checkbox",
                ElementSpec::new()
                    .property("checked", flag())
                    .property("label", text())
                    .property("onChange", callback()),
            )
            .register(
                "Select",
                ElementSpec::new()
                    .property("options", Schema::array(Schema::any()).optional())
                    .property("value", Schema::any())
                    .property("onChange", callback()),
            )
            .register(
                "Image",
                ElementSpec::new()
                    .property("src", text())
                    .property("alt", text()),
            )
            .register(
                "Table",
                ElementSpec::new()
                    .property("data", Schema::array(Schema::any()).optional())
                    .property("columns", Schema::array(Schema::string()).optional())
                    .property("onRowClick", callback()),
            )
            .register(
                "Form",
                ElementSpec::new()
                    .property("initialValues", Schema::any())
                    .property("onSubmit", callback())
                    .form(),
            );
        registry
    }

    /// Reads `{"<type>": {"form": bool, "properties": {"<name>": "<schema code>"}}}`.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let sources: IndexMap<String, ElementSource> = serde_json::from_str(json)?;
        let engine = FormulaEngine::default();
        let mut registry = Self::new();
        for (kind, source) in sources {
            let mut spec = ElementSpec {
                form: source.form,
                ..ElementSpec::default()
            };
            for (property, code) in source.properties {
                let schema = compile_schema(&engine, &code).map_err(|message| {
                    EngineError::InvalidSchema {
                        element: kind.clone(),
                        property: property.clone(),
                        message,
                    }
                })?;
                spec.properties.insert(property, schema);
            }
            registry.register(kind, spec);
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::Value;

    #[test]
    fn unknown_kinds_accept_anything() {
        let registry = ElementRegistry::standard();
        assert!(registry.is_form("Form"));
        assert!(!registry.is_form("Button"));
        assert!(registry.get("Sparkline").properties.is_empty());
        let label = &registry.get("Button").properties["label"];
        assert!(label.is_valid(&Value::Undefined));
        assert!(!label.is_valid(&Value::from(1)));
    }

    #[test]
    fn registries_load_from_schema_code() {
        let registry = ElementRegistry::from_json(
            r#"{
                "Rating": { "properties": { "stars": "z.number().int().min(0).max(5)" } },
                "Wizard": { "form": true }
            }"#,
        )
        .unwrap();
        let stars = &registry.get("Rating").properties["stars"];
        assert!(stars.is_valid(&Value::from(3)));
        assert!(!stars.is_valid(&Value::from(6)));
        assert!(registry.is_form("Wizard"));

        let error = ElementRegistry::from_json(r#"{ "Rating": { "properties": { "stars": "z.stars()" } } }"#)
            .unwrap_err();
        assert!(
            matches!(&error, EngineError::InvalidSchema { element, property, .. } if element == "Rating" && property == "stars"),
            "{error}"
        );
    }
}
