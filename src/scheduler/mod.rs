pub mod cleaner;
pub mod ingestion;
pub mod service;

pub use cleaner::{CleanupReport, PairCleanup, RetentionCleaner};
pub use ingestion::{IngestionScheduler, SchedulerState, TickReport};
pub use service::IngestionService;
