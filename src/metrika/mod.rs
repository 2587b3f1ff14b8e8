pub mod client;
pub mod error;
pub mod types;

pub use client::{MetrikaApi, MetrikaClient};
pub use error::MetrikaError;
pub use types::{CounterAuth, LogRequestInfo, LogRequestPart, LogSource, LogTable, UploadingInfo};
