//! Per-subsystem error taxonomy.
//!
//! Each component gets its own `thiserror` enum and `Result` alias, mirroring
//! how the rest of this crate's subsystems are split. `CoderAgentError` is
//! the crate-wide wrapper the driver loop returns.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("git command failed: {0}")]
    GitFailed(String),

    #[error("network exhausted after {attempts} attempts: {last_error}")]
    NetworkExhausted { attempts: u32, last_error: String },

    #[error("branch name exhausted after {attempts} attempts starting from '{base}'")]
    BranchExhaustion { base: String, attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

#[derive(Error, Debug)]
pub enum StateStoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("type mismatch reading key '{key}': expected {expected}, stored {stored}")]
    TypeMismatch {
        key: String,
        expected: String,
        stored: String,
    },

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StateStoreResult<T> = Result<T, StateStoreError>;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("tokenizer model '{0}' is unknown")]
    UnknownTokenizer(String),

    #[error("compaction failed: {0}")]
    CompactionFailed(String),
}

pub type ContextResult<T> = Result<T, ContextError>;

#[derive(Error, Debug)]
pub enum ToolLoopError {
    #[error("LLM stream error: {0}")]
    Stream(String),

    #[error("phase timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("no stream activity for {0:?}")]
    Inactivity(std::time::Duration),

    #[error("terminal tool '{0}' produced an undecodable result: {1}")]
    UndecodableResult(String, String),
}

pub type ToolLoopResult<T> = Result<T, ToolLoopError>;

#[derive(Error, Debug)]
pub enum EffectError {
    #[error("effect cancelled")]
    Cancelled,

    #[error("effect timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("reply channel closed before a correlated response arrived")]
    ChannelClosed,

    #[error("unparseable budget-review feedback: {0}")]
    UnparseableFeedback(String),
}

pub type EffectResult<T> = Result<T, EffectError>;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("invalid transition attempted: {from:?} -> {to:?}")]
    InvalidTransition { from: String, to: String },

    #[error("story channel closed")]
    StoryChannelClosed,

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    StateStore(#[from] StateStoreError),

    #[error(transparent)]
    ToolLoop(#[from] ToolLoopError),

    #[error(transparent)]
    Effect(#[from] EffectError),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Crate-wide error wrapper, used by top-level entry points.
#[derive(Error, Debug)]
pub enum CoderAgentError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    StateStore(#[from] StateStoreError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    ToolLoop(#[from] ToolLoopError),

    #[error(transparent)]
    Effect(#[from] EffectError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type CoderAgentResult<T> = Result<T, CoderAgentError>;
