use std::time::Duration;

/// Failures of the script source store and the download pipeline.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("a download for this map is already in progress")]
    AlreadyInProgress,

    #[error("invalid script URL: {0}")]
    InvalidUrl(String),

    #[error("script is too large ({reported} bytes, limit is {limit})")]
    TooLarge { limit: u64, reported: u64 },

    #[error("server answered HTTP {0}")]
    HttpStatus(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Failures while building or replacing a map's script context.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no script file exists for this map")]
    NoScriptFile,

    #[error("script failed to load: {0}")]
    ScriptLoad(String),

    #[error("the script file is still being downloaded")]
    Busy,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of invoking an entry point that did not return normally.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("function `{0}` is not defined")]
    NotFound(String),

    #[error("script error: {0}")]
    Runtime(String),

    #[error("script exceeded its execution budget ({0:?})")]
    Timeout(Duration),

    #[error("script context has been stopped")]
    Stopped,
}

/// Raised by host operations invoked through the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// Business-rule violation; its message is shown to the player.
    #[error("{0}")]
    Rule(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Failure of a dispatched host call, caught before it reaches the script.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown operation {target}.{method}")]
    UnknownOperation { target: String, method: String },

    #[error("{0}")]
    Operation(#[from] OperationError),

    #[error("operation panicked")]
    Panicked,
}

impl DispatchError {
    /// Player-visible detail. Only business-rule messages are exposed.
    pub fn public_detail(&self) -> Option<&str> {
        match self {
            DispatchError::Operation(OperationError::Rule(message)) => Some(message),
            _ => None,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
