use crate::lock::NotAcquired;
use crate::pipeline::{Request, Response};

/// Produces the response for a request that could not get its session
pub trait RejectionHandler: Send + Sync {
    fn on_not_acquired(&self, request: &Request, response: &mut Response, reason: NotAcquired);
}

/// Default handler: an error status (429 unless configured otherwise)
#[derive(Debug, Clone, Copy)]
pub struct StatusRejection {
    status: u16,
}

impl StatusRejection {
    pub fn new(status: u16) -> Self {
        Self { status }
    }

    pub fn status(&self) -> u16 {
        self.status
    }
}

impl Default for StatusRejection {
    fn default() -> Self {
        Self::new(crate::env::valve::DEFAULT_REJECTION_STATUS)
    }
}

impl RejectionHandler for StatusRejection {
    fn on_not_acquired(&self, _request: &Request, response: &mut Response, _reason: NotAcquired) {
        response.send_error(self.status, "Too Many Requests");
    }
}
