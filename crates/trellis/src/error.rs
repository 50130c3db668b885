use std::path::PathBuf;

/// Failures of the engine's own fallible operations.
///
/// Problems inside user formulas never surface here; they are recorded in
/// the [`ErrorLedger`](crate::ledger::ErrorLedger) instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("page `{0}` does not exist")]
    UnknownPage(String),
    #[error("no page is open")]
    NoOpenPage,
    #[error(transparent)]
    Model(#[from] trellis_model::ModelError),
    #[error("schema of {element}.{property} is invalid: {message}")]
    InvalidSchema {
        element: String,
        property: String,
        message: String,
    },
    #[error("{service} failed: {message}")]
    Service {
        service: &'static str,
        message: String,
    },
}

impl EngineError {
    pub fn service(service: &'static str, message: impl Into<String>) -> Self {
        Self::Service {
            service,
            message: message.into(),
        }
    }
}
