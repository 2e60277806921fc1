pub mod api;
pub mod citations;
pub mod error;
pub mod job;
pub mod watch;

pub use api::SurveyApiClient;
pub use citations::{process_document, CitationMap, ProcessedDocument};
pub use error::{FetchError, WatchError};
pub use job::{Job, JobReport, JobStatus, SourceRecord};
pub use watch::{ProgressSource, ProgressWatcher, WatchConfig, WatchEvent, WatchHandle, WatchSnapshot};
