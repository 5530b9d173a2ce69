//! Request pipeline surface: the request/response pair and the stage trait.

pub mod types;

pub use types::*;

use async_trait::async_trait;

/// One step of request processing
#[async_trait]
pub trait Stage: Send + Sync {
    /// Handle the request, usually by passing it on to the next stage
    async fn process(&self, request: &mut Request, response: &mut Response)
    -> Result<(), PipelineError>;

    /// Stage name for logging
    fn stage_name(&self) -> &'static str {
        "stage"
    }
}
