use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please select a symbol")]
    MissingSymbol,

    #[error("Please enter a valid quantity")]
    InvalidQuantity,

    #[error("Price is required for limit orders")]
    MissingPrice,

    #[error("Stop price is required for stop orders")]
    MissingStopPrice,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    TransportOpen(String),

    #[error("malformed payload: {0}")]
    Parse(String),

    #[error("HTTP {code}: {status_text}")]
    Http { code: u16, status_text: String },

    #[error("{message}")]
    Transport { message: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ClientError {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::TransportOpen(_) => "transport_open",
            ClientError::Parse(_) => "parse",
            ClientError::Http { .. } => "http",
            ClientError::Transport { .. } => "transport",
            ClientError::Validation(_) => "validation",
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Parse(e.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return ClientError::Parse(e.to_string());
        }
        if let Some(status) = e.status() {
            return ClientError::Http {
                code: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
            };
        }
        let message = if e.is_timeout() {
            format!("request timed out: {e}")
        } else {
            e.to_string()
        };
        ClientError::Transport { message }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::TransportOpen(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
