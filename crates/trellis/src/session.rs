//! A running application: the app level, at most one open page, and the
//! bindings of that page's containers.

use crate::binding::{BindingMode, ContainerBinding, bind};
use crate::config::EngineConfig;
use crate::context::{EngineContext, InitialValues};
use crate::elements::ElementRegistry;
use crate::error::EngineError;
use crate::formula::{EvalError, Signal, Value};
use crate::ledger::{ErrorEntry, ErrorLedger};
use crate::level::{LevelGraph, LevelInputs};
use crate::reactive::{Computed, Effect, Runtime, State};
use crate::scope::{FormulaScope, Level, ScopeInputs, Scopes};
use crate::services::Services;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use trellis_model::tree::{self, validate_tree};
use trellis_model::{Application, Callable, Container, Fetcher, Id, Page, Query, Variable};

/// Navigations one [`Session::settle`] applies before giving up on a page
/// that keeps redirecting.
const MAX_NAVIGATIONS_PER_SETTLE: usize = 16;

type Bindings = Rc<RefCell<IndexMap<Id, ContainerBinding>>>;
type FormContexts = Rc<RefCell<IndexMap<Id, State<Value>>>>;

struct OpenPage {
    id: Id,
    name: String,
    level: LevelGraph,
    containers: State<Rc<Vec<Container>>>,
    scopes: Computed<Scopes>,
    bindings: Bindings,
    forms: FormContexts,
    binder: Effect,
}

impl OpenPage {
    fn dispose(&self) {
        self.binder.dispose();
        let bindings = std::mem::take(&mut *self.bindings.borrow_mut());
        for binding in bindings.values() {
            binding.dispose();
        }
        self.level.dispose();
        log::debug!("closed page `{}`", self.name);
    }
}

pub struct Session {
    context: Rc<EngineContext>,
    elements: Rc<ElementRegistry>,
    application: RefCell<Application>,
    app: LevelGraph,
    page: RefCell<Option<OpenPage>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("application", &self.application.borrow().name)
            .field("page", &self.page_name())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Instantiates and composes the application level. No page is open yet.
    pub fn new(
        application: Application,
        services: Services,
        elements: ElementRegistry,
        config: EngineConfig,
    ) -> Self {
        let context = EngineContext::new(services, config);
        let inputs = LevelInputs::new(
            &context,
            ScopeInputs::new(
                application.variables.clone(),
                application.queries.clone(),
                application.fetchers.clone(),
                application.callables.clone(),
            ),
            InitialValues::new(),
        );
        let app = LevelGraph::new(&context, Level::App, inputs, None);
        log::debug!("started application `{}`", application.name);
        Self {
            context,
            elements: Rc::new(elements),
            application: RefCell::new(application),
            app,
            page: RefCell::new(None),
        }
    }

    pub fn context(&self) -> &Rc<EngineContext> {
        &self.context
    }

    pub fn runtime(&self) -> &Runtime {
        &self.context.runtime
    }

    pub fn ledger(&self) -> &ErrorLedger {
        &self.context.ledger
    }

    /// The document as edited so far.
    pub fn application(&self) -> Application {
        self.application.borrow().clone()
    }

    pub fn page_name(&self) -> Option<String> {
        self.page.borrow().as_ref().map(|page| page.name.clone())
    }

    pub fn app_scope(&self) -> Rc<FormulaScope> {
        self.app.scope()
    }

    pub fn page_scope(&self) -> Option<Rc<FormulaScope>> {
        self.page.borrow().as_ref().map(|page| page.level.scope())
    }

    /// Closes the current page and opens `name` (a page name or id).
    /// `initial_values` seed the page's state variables by name.
    pub fn open_page(&self, name: &str, initial_values: InitialValues) -> Result<(), EngineError> {
        let page = self
            .application
            .borrow()
            .page(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownPage(name.to_owned()))?;
        if !page.containers.is_empty() {
            validate_tree(&page.containers)?;
        }
        let previous = self.page.borrow_mut().take();
        if let Some(previous) = previous {
            previous.dispose();
        }
        let opened = self.build_page(page, initial_values);
        log::debug!("opened page `{}`", opened.name);
        *self.page.borrow_mut() = Some(opened);
        Ok(())
    }

    fn build_page(&self, page: Page, initial_values: InitialValues) -> OpenPage {
        let context = &self.context;
        let inputs = LevelInputs::new(
            context,
            ScopeInputs::new(page.variables, page.queries, page.fetchers, page.callables),
            initial_values,
        );
        let level = LevelGraph::new(
            context,
            Level::Page,
            inputs,
            Some(self.app.scope_signal().clone()),
        );
        let scopes = Computed::new(&context.runtime, {
            let app = self.app.scope_signal().clone();
            let page = level.scope_signal().clone();
            move || Scopes {
                app: app.get(),
                page: Some(page.get()),
            }
        });
        let containers = State::new(&context.runtime, Rc::new(page.containers));
        let bindings = Bindings::default();
        let forms = FormContexts::default();
        let binder = binder(
            context,
            &containers,
            &scopes,
            &self.elements,
            &bindings,
            &forms,
        );
        OpenPage {
            id: page.id,
            name: page.name,
            level,
            containers,
            scopes,
            bindings,
            forms,
            binder,
        }
    }

    /// Applies queued `navigate(..)` calls. Returns how many pages were
    /// opened.
    pub fn settle(&self) -> Result<usize, EngineError> {
        let mut opened = 0;
        while let Some(navigation) = self.context.take_navigation() {
            if opened == MAX_NAVIGATIONS_PER_SETTLE {
                let dropped = self.context.pending_navigations() + 1;
                log::warn!("stopped following navigations after {opened} pages, dropping {dropped}");
                while self.context.take_navigation().is_some() {}
                break;
            }
            self.open_page(&navigation.page, navigation.params)?;
            opened += 1;
        }
        Ok(opened)
    }

    fn with_page<R>(&self, f: impl FnOnce(&OpenPage) -> R) -> Result<R, EngineError> {
        let page = self.page.borrow();
        let page = page.as_ref().ok_or(EngineError::NoOpenPage)?;
        Ok(f(page))
    }

    fn edit_page(
        &self,
        update: impl FnOnce(&OpenPage),
        document: impl FnOnce(&mut Page),
    ) -> Result<(), EngineError> {
        let id = self.with_page(|page| {
            update(page);
            page.id.clone()
        })?;
        if let Some(page) = self
            .application
            .borrow_mut()
            .pages
            .iter_mut()
            .find(|page| page.id == id)
        {
            document(page);
        }
        Ok(())
    }

    pub fn set_app_variables(&self, variables: Vec<Variable>) {
        self.application.borrow_mut().variables = variables.clone();
        self.app.inputs().variables.set(Rc::new(variables));
    }

    pub fn set_app_queries(&self, queries: Vec<Query>) {
        self.application.borrow_mut().queries = queries.clone();
        self.app.inputs().queries.set(Rc::new(queries));
    }

    pub fn set_app_fetchers(&self, fetchers: Vec<Fetcher>) {
        self.application.borrow_mut().fetchers = fetchers.clone();
        self.app.inputs().fetchers.set(Rc::new(fetchers));
    }

    pub fn set_app_callables(&self, callables: Vec<Callable>) {
        self.application.borrow_mut().callables = callables.clone();
        self.app.inputs().callables.set(Rc::new(callables));
    }

    pub fn set_page_variables(&self, variables: Vec<Variable>) -> Result<(), EngineError> {
        let shared = Rc::new(variables);
        self.edit_page(
            |page| page.level.inputs().variables.set(shared.clone()),
            |page| page.variables = shared.as_ref().clone(),
        )
    }

    pub fn set_page_queries(&self, queries: Vec<Query>) -> Result<(), EngineError> {
        let shared = Rc::new(queries);
        self.edit_page(
            |page| page.level.inputs().queries.set(shared.clone()),
            |page| page.queries = shared.as_ref().clone(),
        )
    }

    pub fn set_page_fetchers(&self, fetchers: Vec<Fetcher>) -> Result<(), EngineError> {
        let shared = Rc::new(fetchers);
        self.edit_page(
            |page| page.level.inputs().fetchers.set(shared.clone()),
            |page| page.fetchers = shared.as_ref().clone(),
        )
    }

    pub fn set_page_callables(&self, callables: Vec<Callable>) -> Result<(), EngineError> {
        let shared = Rc::new(callables);
        self.edit_page(
            |page| page.level.inputs().callables.set(shared.clone()),
            |page| page.callables = shared.as_ref().clone(),
        )
    }

    /// Replaces the page's container tree. Containers whose definition did
    /// not change keep their bindings.
    pub fn set_containers(&self, containers: Vec<Container>) -> Result<(), EngineError> {
        validate_tree(&containers)?;
        let shared = Rc::new(containers);
        self.edit_page(
            |page| page.containers.set(shared.clone()),
            |page| page.containers = shared.as_ref().clone(),
        )
    }

    pub fn containers(&self) -> Option<Rc<Vec<Container>>> {
        self.with_page(|page| page.containers.get_untracked()).ok()
    }

    /// A variable visible on the open page (or at app level when no page is
    /// open), page names first.
    pub fn variable(&self, name: &str) -> Option<Signal> {
        let page = self.page_scope();
        let scope = page.unwrap_or_else(|| self.app.scope());
        scope.var(name).cloned()
    }

    pub fn props(&self, container: &Id) -> Option<IndexMap<String, Value>> {
        self.with_page(|page| {
            page.bindings
                .borrow()
                .get(container)
                .map(ContainerBinding::snapshot)
        })
        .ok()
        .flatten()
    }

    pub fn prop(&self, container: &Id, name: &str) -> Option<Value> {
        self.props(container)?.shift_remove(name)
    }

    /// Calls a callback prop. The bindings are not borrowed while the
    /// callback runs, so it may freely change variables or containers.
    pub fn invoke(&self, container: &Id, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        match self.prop(container, name) {
            Some(Value::Function(function)) => function.call(args),
            Some(other) => Err(EvalError::type_error(format!(
                "{container}.{name} is {}, not a function",
                other.type_of()
            ))),
            None => Err(EvalError::type_error(format!(
                "{container} has no bound property `{name}`"
            ))),
        }
    }

    /// The `formContext` signal seen by `container`, if it sits inside a form.
    pub fn form_context(&self, container: &Id) -> Option<State<Value>> {
        self.with_page(|page| {
            let containers = page.containers.get_untracked();
            let by_id = index(&containers);
            let form = enclosing_form(by_id.get(container)?, &by_id, &self.elements)?;
            page.forms.borrow().get(&form).cloned()
        })
        .ok()
        .flatten()
    }

    /// Reactive read of every recorded error.
    pub fn errors(&self) -> Rc<Vec<ErrorEntry>> {
        self.context.ledger.errors()
    }

    /// The open page as `{id, type, props, children}` nodes from the root.
    /// Callback props render as `"[Function name]"`.
    pub fn resolved_tree(&self) -> serde_json::Value {
        self.with_page(|page| {
            let containers = page.containers.get_untracked();
            let bindings = page.bindings.borrow();
            let by_id = index(&containers);
            match tree::root(&containers) {
                Some(root) => resolve_node(root, &by_id, &bindings, 0),
                None => serde_json::Value::Null,
            }
        })
        .unwrap_or(serde_json::Value::Null)
    }

    /// The composed scopes of the open page.
    pub fn scopes(&self) -> Option<Scopes> {
        self.with_page(|page| page.scopes.get_untracked()).ok().flatten()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(page) = self.page.get_mut().take() {
            page.dispose();
        }
        self.app.dispose();
    }
}

fn index(containers: &[Container]) -> HashMap<&Id, &Container> {
    containers
        .iter()
        .map(|container| (&container.id, container))
        .collect()
}

/// The closest form container at or above `container`.
fn enclosing_form(
    container: &Container,
    by_id: &HashMap<&Id, &Container>,
    elements: &ElementRegistry,
) -> Option<Id> {
    let mut current = Some(container);
    for _ in 0..=by_id.len() {
        let node = current?;
        if elements.is_form(&node.kind) {
            return Some(node.id.clone());
        }
        current = node.parent.as_ref().and_then(|parent| by_id.get(parent).copied());
    }
    None
}

fn prop_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Function(function) => serde_json::Value::String(format!("{function:?}")),
        value => value.to_json(),
    }
}

fn resolve_node(
    container: &Container,
    by_id: &HashMap<&Id, &Container>,
    bindings: &IndexMap<Id, ContainerBinding>,
    depth: usize,
) -> serde_json::Value {
    let props: serde_json::Map<String, serde_json::Value> = bindings
        .get(&container.id)
        .map(|binding| {
            binding
                .snapshot()
                .iter()
                .map(|(name, value)| (name.clone(), prop_json(value)))
                .collect()
        })
        .unwrap_or_default();
    let children: Vec<serde_json::Value> = if depth > by_id.len() {
        Vec::new()
    } else {
        container
            .children
            .iter()
            .filter_map(|child| by_id.get(child))
            .map(|child| resolve_node(child, by_id, bindings, depth + 1))
            .collect()
    };
    serde_json::json!({
        "id": container.id,
        "type": container.kind,
        "props": props,
        "children": children,
    })
}

/// Keeps one binding per reachable container in sync with the tree.
fn binder(
    context: &Rc<EngineContext>,
    containers: &State<Rc<Vec<Container>>>,
    scopes: &Computed<Scopes>,
    elements: &Rc<ElementRegistry>,
    bindings: &Bindings,
    forms: &FormContexts,
) -> Effect {
    let context = context.clone();
    let containers = containers.clone();
    let scopes = scopes.clone();
    let elements = elements.clone();
    let bindings = bindings.clone();
    let forms = forms.clone();
    let mode: BindingMode = context.config.binding_mode;
    let mut known: IndexMap<Id, (Container, Option<Id>)> = IndexMap::new();
    let runtime = context.runtime.clone();
    Effect::new(&runtime, move || {
        let containers = containers.get();
        context.runtime.untracked(|| {
            let by_id = index(&containers);
            let mut previous = std::mem::take(&mut *bindings.borrow_mut());
            let mut next_known = IndexMap::new();
            let mut next = IndexMap::new();
            let (mut kept, mut bound) = (0, 0);
            for container in tree::walk(&containers) {
                let form = enclosing_form(container, &by_id, &elements);
                let unchanged = known
                    .get(&container.id)
                    .is_some_and(|(known, known_form)| known == container && *known_form == form);
                let binding = match previous.shift_remove(&container.id) {
                    Some(binding) if unchanged => {
                        kept += 1;
                        binding
                    }
                    stale => {
                        if let Some(stale) = stale {
                            stale.dispose();
                        }
                        let form_context = form.as_ref().map(|form| {
                            forms
                                .borrow_mut()
                                .entry(form.clone())
                                .or_insert_with(|| {
                                    State::new(&context.runtime, Value::empty_object())
                                })
                                .clone()
                        });
                        bound += 1;
                        bind(
                            &context,
                            container,
                            &scopes,
                            elements.get(&container.kind),
                            form_context.as_ref(),
                            mode,
                        )
                    }
                };
                next_known.insert(container.id.clone(), (container.clone(), form));
                next.insert(container.id.clone(), binding);
            }
            let removed = previous.len();
            for binding in previous.values() {
                binding.dispose();
            }
            forms.borrow_mut().retain(|form, _| next_known.contains_key(form));
            known = next_known;
            *bindings.borrow_mut() = next;
            log::debug!("rebound containers: {kept} kept, {bound} bound, {removed} removed");
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::RecordingTransport;
    use futures::executor::LocalPool;

    fn session(application: Application) -> (LocalPool, Session) {
        let pool = LocalPool::new();
        let services = Services::in_memory(
            &application.tables,
            Rc::new(RecordingTransport::new()),
            Rc::new(pool.spawner()),
        );
        let session = Session::new(
            application,
            services,
            ElementRegistry::standard(),
            EngineConfig::default(),
        );
        (pool, session)
    }

    fn form_page() -> Page {
        let mut root = Container::new("root", "Page");
        root.children = vec!["form".into()];
        let mut form = Container::new("form", "Form")
            .with_property("onSubmit", "module.exports = () => submitted.set(formContext.get())");
        form.parent = Some("root".into());
        form.children = vec!["email".into()];
        let mut email = Container::new("email", "Input").with_property(
            "onChange",
            "module.exports = (value) => formContext.set({ ...formContext.get(), email: value })",
        );
        email.parent = Some("form".into());
        Page {
            id: "p1".into(),
            name: "signup".to_owned(),
            containers: vec![root, form, email],
            variables: vec![Variable::state("v1", "submitted", "module.exports = null")],
            ..Page::default()
        }
    }

    #[test]
    fn forms_share_one_context_with_their_fields() {
        let (_pool, session) = session(Application {
            pages: vec![form_page()],
            ..Application::default()
        });
        session.open_page("signup", InitialValues::new()).unwrap();
        let email = Id::from("email");
        session
            .invoke(&email, "onChange", &[Value::from("ada@example.com")])
            .unwrap();
        session.invoke(&Id::from("form"), "onSubmit", &[]).unwrap();
        assert_eq!(
            session.variable("submitted").unwrap().get_untracked().to_json(),
            serde_json::json!({ "email": "ada@example.com" })
        );
        assert!(session.form_context(&Id::from("root")).is_none());
        assert!(session.form_context(&email).is_some());
        assert!(session.errors().is_empty());
    }

    #[test]
    fn unknown_pages_and_broken_trees_are_rejected() {
        let (_pool, session) = session(Application {
            pages: vec![form_page()],
            ..Application::default()
        });
        assert!(matches!(
            session.open_page("nowhere", InitialValues::new()),
            Err(EngineError::UnknownPage(_))
        ));
        assert!(matches!(
            session.set_page_variables(vec![]),
            Err(EngineError::NoOpenPage)
        ));
        session.open_page("signup", InitialValues::new()).unwrap();
        let error = session
            .set_containers(vec![Container::new("a", "Page"), Container::new("b", "Page")])
            .unwrap_err();
        assert!(matches!(error, EngineError::Model(_)), "{error}");
    }

    #[test]
    fn edits_are_written_back_to_the_document() {
        let (_pool, session) = session(Application {
            pages: vec![form_page()],
            ..Application::default()
        });
        session.open_page("p1", InitialValues::new()).unwrap();
        session
            .set_page_variables(vec![Variable::state("v9", "draft", "module.exports = ''")])
            .unwrap();
        session.set_app_variables(vec![Variable::state("a1", "theme", "module.exports = 'dark'")]);
        let document = session.application();
        assert_eq!(document.pages[0].variables[0].name, "draft");
        assert_eq!(document.variables[0].name, "theme");
        assert_eq!(
            session.variable("theme").unwrap().get_untracked(),
            Value::from("dark")
        );
        assert!(session.variable("submitted").is_none());
    }
}
