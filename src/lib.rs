pub mod types;
pub mod error;
pub mod config;
pub mod data;
pub mod feed;
pub mod scheduler;
pub mod store;
pub mod utils;

pub use types::*;
pub use error::{IngestError, Result};
