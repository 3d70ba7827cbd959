//! Engine handlers.

mod node_labeler;
mod selective_deployment;

pub use node_labeler::{node_addresses, NodeChanges, NodeLabeler};
pub use selective_deployment::{
    inventory_trigger, release_trigger, SdChanges, SelectiveDeploymentHandler,
};

use edgeplane_reconcile::HandlerError;

use crate::cluster::ApiError;

/// Retry what may succeed later, give up on the rest.
fn handler_error(err: ApiError) -> HandlerError {
    if err.is_retryable() {
        HandlerError::transient(err)
    } else {
        HandlerError::permanent(err)
    }
}
