use thiserror::Error;

/// Errors raised while registering task kinds.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Task kind '{0}' is already registered")]
    DuplicateKind(String),

    #[error("Task kind '{kind}' declares parameter '{param}' more than once")]
    DuplicateParam { kind: String, param: String },

    #[error("Task kind '{kind}' declares output '{output}' more than once")]
    DuplicateOutput { kind: String, output: String },

    #[error("Task kind '{kind}' declares dependency alias '{alias}' more than once")]
    DuplicateAlias { kind: String, alias: String },

    #[error("Task kind '{kind}' declares no outputs")]
    NoOutputs { kind: String },

    #[error("Task kind '{kind}': default for parameter '{param}' does not match its declared type")]
    BadDefault { kind: String, param: String },

    #[error("Name '{0}' is not valid; use ASCII letters, digits, '.', '_' or '-'")]
    InvalidName(String),
}

/// Errors raised while binding concrete values to parameter specs, or while
/// reading typed values back out of a [`Params`](crate::Params) record.
#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("Unknown task kind '{0}'")]
    UnknownKind(String),

    #[error("Unknown parameter '{0}'")]
    Unknown(String),

    #[error("Parameter '{0}' given more than once")]
    Duplicate(String),

    #[error("Missing required parameter '{0}'")]
    Missing(String),

    #[error("Parameter '{param}' expects {expected}, got {found}")]
    Type {
        param: String,
        expected: String,
        found: String,
    },

    #[error("Parameter '{0}' must be a finite number")]
    NonFinite(String),

    #[error("Task kind '{kind}' declares no output named '{output}'")]
    UnknownOutput { kind: String, output: String },
}

/// A task instance depends, transitively, on itself.
///
/// The path runs from the first occurrence of the repeated instance down the
/// expansion chain back to it.
#[derive(Debug, Error)]
#[error("Dependency cycle detected: {}", .path.join(" -> "))]
pub struct CycleError {
    pub path: Vec<String>,
}

/// Errors raised by a completion store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No stored output for {0}")]
    NotFound(String),

    #[error("Couldn't access the store.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode artifact payload.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode artifact payload.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
}

/// Errors raised while expanding a task instance into a dependency graph.
///
/// These abort a run request before any node executes.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("Dependency '{alias}' of task '{kind}': couldn't derive parameters.\n{cause}")]
    Derive {
        kind: String,
        alias: String,
        cause: anyhow::Error,
    },
}

/// Fatal errors of a whole run request.
///
/// Failures of individual run contracts are *not* run errors; they are
/// captured per node in the [`Report`](crate::Report).
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Couldn't start the worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// A node-scoped execution failure, recorded in the report.
#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error("Run contract did not produce declared output '{0}'")]
    MissingOutput(String),

    #[error("Run contract produced undeclared output '{0}'")]
    UnexpectedOutput(String),

    #[error("Run contract failed.\n{0:#}")]
    Error(anyhow::Error),

    #[error("Run contract panicked: {0}")]
    Panic(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised inside run contracts when resolving dependency outputs.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Task has no dependency aliased '{0}'")]
    UnknownDependency(String),

    #[error("Dependency '{alias}' declares no output named '{output}'")]
    UnknownOutput { alias: String, output: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}
