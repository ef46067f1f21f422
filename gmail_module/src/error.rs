#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// Expired or invalid credential. Fatal for the run; never retried.
    #[error("gmail auth failed: {0}")]
    Auth(String),
    #[error("gmail api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("gmail transport error: {0}")]
    Transport(String),
    #[error("unexpected gmail response: {0}")]
    BadResponse(String),
}

impl From<reqwest::Error> for MailError {
    fn from(err: reqwest::Error) -> Self {
        MailError::Transport(err.to_string())
    }
}
