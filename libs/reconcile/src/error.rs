use thiserror::Error;

use crate::handler::HandlerError;

/// Reasons an engine stops with an error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The handler's `init` failed permanently or ran out of attempts.
    #[error("handler initialisation failed: {0}")]
    Init(#[source] HandlerError),

    /// The watch stream ended before the cache ever synced.
    #[error("watch stream ended before the initial listing completed")]
    NeverSynced,
}
