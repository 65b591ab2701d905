/// Core error types for Shaderlink.

/// A specialized Result type for Shaderlink operations.
pub type ShaderlinkResult<T> = Result<T, ShaderlinkError>;

/// Failures of the engine-thread dispatcher itself, as opposed to failures
/// of the task it was running.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("engine dispatcher is shut down")]
    Closed,

    #[error("task abandoned during shutdown")]
    Abandoned,

    #[error("task panicked: {0}")]
    TaskPanicked(String),
}

/// Top-level error type encompassing all Shaderlink subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ShaderlinkError {
    /// Malformed request shape. Raised before any engine work is scheduled.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Shader failed to build. Carries the engine's diagnostic log.
    #[error("{}", .lines.join("\n"))]
    Compile { lines: Vec<String> },

    /// The operation needs a material or parameter that does not exist.
    #[error("invalid state: {0}")]
    State(String),

    /// A shared-memory segment could not be opened or mapped.
    #[error("resource error: {0}")]
    Resource(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("render error: {0}")]
    Render(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl ShaderlinkError {
    /// Create a compile error from an engine log, one entry per line.
    pub fn compile<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ShaderlinkError::Compile {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a compile error by splitting a multi-line diagnostic.
    pub fn compile_log(log: &str) -> Self {
        Self::compile(log.lines().map(str::to_string))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ShaderlinkError::Validation(message.into())
    }

    pub fn state(message: impl Into<String>) -> Self {
        ShaderlinkError::State(message.into())
    }

    pub fn resource(message: impl Into<String>) -> Self {
        ShaderlinkError::Resource(message.into())
    }

    /// True for errors that only cost a single batch variant rather than the
    /// whole batch.
    pub fn is_variant_local(&self) -> bool {
        matches!(
            self,
            ShaderlinkError::Compile { .. }
                | ShaderlinkError::Validation(_)
                | ShaderlinkError::State(_)
        )
    }
}
