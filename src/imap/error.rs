use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum ImapError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Operation error: {0}")]
    Operation(String),

    #[error("Bad response: {0}")]
    BadResponse(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing data: {0}")]
    MissingData(String),

    #[error("Invalid message id: {0}")]
    InvalidMessageId(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<async_imap::error::Error> for ImapError {
    fn from(err: async_imap::error::Error) -> Self {
        match err {
            async_imap::error::Error::Parse(e) => ImapError::Parse(e.to_string()),
            async_imap::error::Error::No(msg) => ImapError::Operation(msg),
            async_imap::error::Error::Bad(msg) => ImapError::BadResponse(msg),
            async_imap::error::Error::Io(e) => ImapError::Connection(e.to_string()),
            async_imap::error::Error::Validate(e) => ImapError::Command(e.to_string()),
            _ => ImapError::Unknown(err.to_string()),
        }
    }
}

impl From<tokio_native_tls::native_tls::Error> for ImapError {
    fn from(err: tokio_native_tls::native_tls::Error) -> Self {
        ImapError::Tls(err.to_string())
    }
}

impl From<std::io::Error> for ImapError {
    fn from(err: std::io::Error) -> Self {
        ImapError::Connection(err.to_string())
    }
}
