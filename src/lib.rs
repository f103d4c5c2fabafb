pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod export;
pub mod extractor;
pub mod input_loader;
pub mod locale;
pub mod logger;
pub mod pipeline;
pub mod search_engine;

// Exporting types for convenience
pub use cache::{CacheOutcome, ResultCache, RunKey};
pub use config::AppConfig;
pub use dispatcher::{BatchResult, Dispatcher, Progress, QueryReport};
pub use errors::{ConfigError, ExportError, LookupError, PipelineError, SourceError};
pub use extractor::{QueryStatus, ResultRow, RowFields, RowStatus, SENTINEL};
pub use input_loader::Query;
pub use locale::{ExtractionMode, LocaleConfig};
pub use pipeline::Pipeline;
pub use search_engine::{RawResult, SearchBackend, SerpApiClient};
