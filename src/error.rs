//! Error types for the kernel runner boundary and the plugin lifecycle.

use thiserror::Error;

use crate::autotuning::identity::GemmIdentity;

/// Failures reported by a kernel runner, a device or a stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("kernel launch failed: {0}")]
    Launch(String),
    #[error("workspace too small: kernel needs {required} bytes, got {provided}")]
    InsufficientWorkspace { required: usize, provided: usize },
    #[error("unsupported kernel configuration: {0}")]
    Unsupported(String),
    #[error("device allocation of {bytes} bytes failed: {reason}")]
    Allocation { bytes: usize, reason: String },
    #[error("stream error: {0}")]
    Stream(String),
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Errors surfaced to the host by the profiler, the plugin and its factory.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("no viable tactic for {identity} at m={m}")]
    NoViableTactic { identity: GemmIdentity, m: usize },
    #[error("{identity} has not been profiled; configure must run before enqueue")]
    NotProfiled { identity: GemmIdentity },
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("serialized plugin is inconsistent: {0}")]
    SerializationMismatch(String),
    #[error("unsupported data type: {0}")]
    UnsupportedType(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid plugin state: {0}")]
    InvalidState(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PluginResult<T> = Result<T, PluginError>;
