use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("invalid timestamp {value:?}: expected \"%Y-%m-%d %H:%M:%S\"")]
    InvalidTimestamp { value: String },

    #[error("run record error: {0}")]
    RunRecord(#[from] RunRecordError),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl IngestError {
    /// Configuration and connectivity errors abort the run; everything else is
    /// scoped to a single document.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::Fatal(_)
                | IngestError::InvalidChunkConfig(_)
                | IngestError::Tokenizer(_)
                | IngestError::InvalidTimestamp { .. }
                | IngestError::RunRecord(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("search request failed: {0}")]
    Request(String),

    #[error("store not available yet: {0}")]
    NotReady(String),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedError),

    #[error("retrieval failed on both sides: lexical: {lexical}; vector: {vector}")]
    Retrieval { lexical: String, vector: String },
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding service returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("embedding service rejected the request with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed embedding response: {0}")]
    MalformedResponse(String),

    #[error("expected {expected} embeddings, got {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("embedding dimension {actual} does not match model dimension {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("embedding gate is closed")]
    GateClosed,

    #[error("embedding model unavailable: {0}")]
    Unavailable(String),
}

impl EmbedError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EmbedError::Http(_) | EmbedError::Service { .. } | EmbedError::Unavailable(_) => true,
            EmbedError::Rejected { .. }
            | EmbedError::MalformedResponse(_)
            | EmbedError::CountMismatch { .. }
            | EmbedError::Dimension { .. }
            | EmbedError::GateClosed => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid generator endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("generator returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("malformed generator response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Error)]
pub enum RunRecordError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt run record {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
