use std::fmt::{Debug, Display};
use std::sync::Arc;

use async_trait::async_trait;
use kube::Resource;
use thiserror::Error;

use crate::event::ChangeSet;

/// Errors returned by handler callbacks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Retried with backoff until the attempt budget runs out.
    #[error("transient error: {0}")]
    Transient(String),

    /// Abandoned immediately.
    #[error("permanent error: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(err: impl Display) -> Self {
        Self::Transient(err.to_string())
    }

    pub fn permanent(err: impl Display) -> Self {
        Self::Permanent(err.to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Resource-specific reconciliation logic driven by an [`Engine`].
///
/// Callbacks receive the object as currently cached, not the payload of the
/// event that triggered them.
///
/// [`Engine`]: crate::Engine
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    type Object: Resource + Clone + Debug + Send + Sync + 'static;
    type Changes: ChangeSet;

    /// Summarise what changed between two cached versions of an object.
    /// An empty summary suppresses the update.
    fn changes(&self, old: &Self::Object, new: &Self::Object) -> Self::Changes;

    /// Called once before the engine starts watching.
    async fn init(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_create(&self, obj: Arc<Self::Object>) -> Result<(), HandlerError>;

    async fn on_update(
        &self,
        obj: Arc<Self::Object>,
        changes: Self::Changes,
    ) -> Result<(), HandlerError>;

    async fn on_delete(&self, last_known: Arc<Self::Object>) -> Result<(), HandlerError>;
}
