use tokio_util::sync::CancellationToken;

/// The request as seen by pipeline stages
#[derive(Debug, Clone)]
pub struct Request {
    path: String,
    requested_session_id: Option<String>,
    session_id: Option<String>,
    async_pending: bool,
    cancellation: CancellationToken,
}

impl Request {
    /// Create a request for an already decoded path
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            requested_session_id: None,
            session_id: None,
            async_pending: false,
            cancellation: CancellationToken::new(),
        }
    }

    /// Set the session id the client presented
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.requested_session_id = Some(id.into());
        self
    }

    /// Use an externally owned cancellation token (e.g. tied to the connection)
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn decoded_path(&self) -> &str {
        &self.path
    }

    /// Session id presented by the client, if any
    pub fn requested_session_id(&self) -> Option<&str> {
        self.requested_session_id.as_deref()
    }

    /// Associate the request with a session, e.g. after creating a new one
    pub fn bind_session(&mut self, id: impl Into<String>) {
        self.session_id = Some(id.into());
    }

    /// Drop the association with any session
    pub fn unbind_session(&mut self) {
        self.session_id = None;
        self.requested_session_id = None;
    }

    /// The session the request refers to after processing: the one bound by
    /// a stage, otherwise the one the client asked for.
    pub fn resolved_session_id(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .or(self.requested_session_id.as_deref())
    }

    /// Mark the request as continuing after the current call returns
    pub fn start_async(&mut self) {
        self.async_pending = true;
    }

    /// Mark asynchronous processing as finished
    pub fn complete_async(&mut self) {
        self.async_pending = false;
    }

    pub fn is_async_pending(&self) -> bool {
        self.async_pending
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// The response being produced for a request
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    message: Option<String>,
    body: String,
    committed: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: 200,
            message: None,
            body: String::new(),
            committed: false,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn write(&mut self, text: &str) {
        self.body.push_str(text);
    }

    /// Finish the response with an error status
    pub fn send_error(&mut self, status: u16, message: impl Into<String>) {
        self.status = status;
        self.message = Some(message.into());
        self.committed = true;
    }
}

/// Failure raised by a pipeline stage
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A stage failed while handling the request
    #[error("Stage failed: {0}")]
    Stage(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}
