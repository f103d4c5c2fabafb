use thiserror::Error;

/// Problems that stop a run before any remote call is made.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("SerpApi key missing: set SERPAPI_API_KEY or pass --api-key")]
    MissingApiKey,

    #[error("invalid {field}: {value:?} ({reason})")]
    InvalidLocale {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("access token contains characters not allowed in a header")]
    InvalidToken,

    #[error("invalid endpoint URL {0:?}: {1}")]
    InvalidEndpoint(String, url::ParseError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Failure of a single remote lookup. Always contained to its query's rows.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("API error: {0}")]
    Api(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported query source format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid spreadsheet: {0}")]
    Spreadsheet(String),

    #[error("source has no column named {0:?}")]
    MissingColumn(String),

    #[error("invalid source location {0:?}")]
    InvalidLocation(String),

    #[error("fetching {location} returned HTTP {status}")]
    RemoteStatus { location: String, status: u16 },

    #[error("fetching source failed: {0}")]
    Remote(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("CSV export failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("export failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("spreadsheet export failed: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("no queries to run")]
    NoQueries,
}
