use thiserror::Error;

/// Everything a backend call can fail with.
///
/// These never reach the UI as-is: the gateway turns them into an envelope
/// carrying [`BackendError::user_message`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Rejected input. The message is already fit for display.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not signed in")]
    Unauthorized,

    #[error("insufficient permissions")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    /// A unique constraint rejected a repeated insert.
    #[error("duplicate key")]
    Duplicate,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl BackendError {
    /// The short message shown to the user. Raw backend text only passes
    /// through for validation failures.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::Unauthorized => "Please sign in to continue".to_string(),
            Self::Forbidden => "You don't have permission to do that".to_string(),
            Self::NotFound(_) => "This item is no longer available".to_string(),
            Self::Duplicate => "That already exists".to_string(),
            Self::Transport(_) | Self::Server { .. } | Self::Decode(_) => {
                "Something went wrong. Please try again.".to_string()
            }
        }
    }

    /// Failures the user can fix by signing in, as opposed to retrying.
    pub fn needs_auth(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}
