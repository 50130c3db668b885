mod http;
mod storage;
mod tasks;

use anyhow::{Context, anyhow, bail};
use clap::{Parser as ClapParser, Subcommand};
use indexmap::IndexSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use trellis::context::FormulaKind;
use trellis::formula::FormulaError;
use trellis::services::Services;
use trellis::trellis_model::{Application, Id};
use trellis::{ElementRegistry, EngineConfig, InitialValues, Session, Value};

use crate::http::ReqwestTransport;
use crate::storage::FileSnapshotStore;
use crate::tasks::LocalTasks;

/// Navigations followed after one render before giving up.
const MAX_SETTLE_ROUNDS: usize = 8;

#[derive(ClapParser)]
#[command(name = "trellis")]
#[command(about = "Trellis application CLI")]
struct Cli {
    /// Engine configuration (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Element registry (JSON) replacing the standard one
    #[arg(long, global = true)]
    elements: Option<PathBuf>,
    /// Directory for database snapshots
    #[arg(long, global = true)]
    data: Option<PathBuf>,
    /// Log engine activity to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open every page of an application and report its errors
    Check {
        /// Path to the application document (.json)
        app: PathBuf,
    },
    /// Print the resolved container tree of a page
    Render {
        /// Path to the application document (.json)
        app: PathBuf,
        /// Page name or id, the first page when omitted
        #[arg(long)]
        page: Option<String>,
        /// Initial values for the page's state variables, as a JSON object
        #[arg(long)]
        params: Option<String>,
        /// Callback props to call before printing, as `container.property`
        #[arg(long = "invoke")]
        invocations: Vec<String>,
    },
    /// Evaluate a formula against an application's scope
    Eval {
        /// The formula source
        code: String,
        /// Application whose scope the formula sees
        #[arg(long)]
        app: Option<PathBuf>,
        /// Evaluate in this page's scope instead of the app scope
        #[arg(long)]
        page: Option<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
    tokio::task::LocalSet::new().run_until(run(cli)).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Check { app } => check(&cli, app).await,
        Commands::Render {
            app,
            page,
            params,
            invocations,
        } => render(&cli, app, page.as_deref(), params.as_deref(), invocations).await,
        Commands::Eval { code, app, page } => eval(&cli, code, app.as_deref(), page.as_deref()).await,
    }
}

struct Workspace {
    session: Session,
    tasks: Rc<LocalTasks>,
}

fn read(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn workspace(cli: &Cli, app: Option<&Path>) -> anyhow::Result<Workspace> {
    let application: Application = match app {
        Some(path) => serde_json::from_str(&read(path)?)
            .with_context(|| format!("{} is not an application document", path.display()))?,
        None => Application::default(),
    };
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let elements = match &cli.elements {
        Some(path) => ElementRegistry::from_json(&read(path)?)?,
        None => ElementRegistry::standard(),
    };
    let tasks = Rc::new(LocalTasks::new());
    let mut services = Services::in_memory(
        &application.tables,
        Rc::new(ReqwestTransport::new()),
        tasks.clone(),
    );
    if let Some(data) = &cli.data {
        services = services.with_snapshots(Rc::new(FileSnapshotStore::new(data.clone())));
    }
    Ok(Workspace {
        session: Session::new(application, services, elements, config),
        tasks,
    })
}

impl Workspace {
    /// Runs pending promise work and follows navigations until both are done.
    async fn settle(&self) -> anyhow::Result<()> {
        for _ in 0..MAX_SETTLE_ROUNDS {
            self.tasks.idle().await;
            if self.session.settle()? == 0 {
                return Ok(());
            }
        }
        log::warn!("still navigating after {MAX_SETTLE_ROUNDS} rounds");
        Ok(())
    }

    fn print_errors(&self) {
        for entry in self.session.errors().iter() {
            eprintln!("{entry}");
        }
    }
}

async fn check(cli: &Cli, app: &Path) -> anyhow::Result<()> {
    let workspace = workspace(cli, Some(app))?;
    let session = &workspace.session;
    let mut reported = IndexSet::new();
    let mut problems = 0;
    let mut report = |page: &str, message: String| {
        if reported.insert(message.clone()) {
            println!("{page}: {message}");
            problems += 1;
        }
    };
    workspace.tasks.idle().await;
    for entry in session.errors().iter() {
        report("app", entry.to_string());
    }
    for page in session.application().pages {
        match session.open_page(page.id.as_str(), InitialValues::new()) {
            Ok(()) => {
                workspace.tasks.idle().await;
                for entry in session.errors().iter() {
                    report(&page.name, entry.to_string());
                }
            }
            Err(error) => report(&page.name, error.to_string()),
        }
    }
    if problems > 0 {
        bail!("{problems} problem(s) in {}", app.display());
    }
    eprintln!("{}: ok", app.display());
    Ok(())
}

fn initial_values(params: Option<&str>) -> anyhow::Result<InitialValues> {
    let Some(params) = params else {
        return Ok(InitialValues::new());
    };
    match serde_json::from_str::<serde_json::Value>(params).context("--params is not JSON")? {
        serde_json::Value::Object(map) => Ok(map
            .iter()
            .map(|(name, value)| (name.as_str().into(), Value::from(value)))
            .collect()),
        other => bail!("--params must be a JSON object, got {other}"),
    }
}

async fn render(
    cli: &Cli,
    app: &Path,
    page: Option<&str>,
    params: Option<&str>,
    invocations: &[String],
) -> anyhow::Result<()> {
    let workspace = workspace(cli, Some(app))?;
    let session = &workspace.session;
    let page = match page {
        Some(page) => page.to_owned(),
        None => session
            .application()
            .pages
            .first()
            .map(|page| page.id.to_string())
            .ok_or_else(|| anyhow!("{} has no pages", app.display()))?,
    };
    session.open_page(&page, initial_values(params)?)?;
    workspace.settle().await?;
    for invocation in invocations {
        let (container, property) = invocation
            .split_once('.')
            .ok_or_else(|| anyhow!("`{invocation}` is not `container.property`"))?;
        session
            .invoke(&Id::from(container), property, &[])
            .map_err(|error| anyhow!("{invocation}: {error}"))?;
        workspace.settle().await?;
    }
    println!("{}", serde_json::to_string_pretty(&session.resolved_tree())?);
    workspace.print_errors();
    Ok(())
}

async fn eval(cli: &Cli, code: &str, app: Option<&Path>, page: Option<&str>) -> anyhow::Result<()> {
    let workspace = workspace(cli, app)?;
    let session = &workspace.session;
    if let Some(page) = page {
        session.open_page(page, InitialValues::new())?;
    }
    workspace.tasks.idle().await;
    let scope = session.page_scope().unwrap_or_else(|| session.app_scope());
    let context = session.context();
    let environment = context.environment(FormulaKind::Effect, &scope.view());
    let outcome = match context.evaluator.run(code, &environment) {
        Ok(outcome) => outcome,
        Err(FormulaError::Compile(error)) => {
            eprint!("{}", error.report("<eval>", code));
            bail!("formula does not compile");
        }
        Err(FormulaError::Eval(error)) => bail!("{error}"),
    };
    let exports = match outcome.exports {
        Value::Promise(promise) => {
            let settled = promise.wait();
            workspace.settle().await?;
            settled
                .await
                .map_err(|reason| anyhow!("promise rejected: {}", reason.to_display()))?
        }
        exports => exports,
    };
    workspace.settle().await?;
    println!("{}", serde_json::to_string_pretty(&exports.to_json())?);
    workspace.print_errors();
    Ok(())
}
