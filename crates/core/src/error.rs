use thiserror::Error;

/// Failure categories surfaced by the engine.
///
/// Values travel inside `anyhow::Error` so internal call sites can keep attaching
/// context while callers remain able to `downcast_ref::<EngineError>()` and branch
/// on the kind.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Vocabulary, merge table, config, or projector blob missing, malformed, or
    /// internally inconsistent. Terminal for the affected resource.
    #[error("resource load failed: {0}")]
    ResourceLoad(String),
    /// A collaborator returned a tensor whose shape breaks the expected contract.
    /// Aborts the current `analyze` call only.
    #[error("tensor shape mismatch: {0}")]
    ShapeMismatch(String),
    /// A collaborator call failed outright. Shared read-only resources stay valid.
    #[error("inference call failed: {0}")]
    Inference(String),
    /// The sampling distribution degenerated, usually numerical overflow upstream.
    #[error("token sampling failed: {0}")]
    Sampling(String),
}
