pub mod aggregator;
pub mod api;
pub mod config;
pub mod error;
pub mod indexer;
pub mod models;
pub mod normalizer;
pub mod parser;
pub mod report;
pub mod rpc;
pub mod source;

pub use aggregator::Aggregator;
pub use error::{IndexerError, StreamAborted};
pub use indexer::{cancel_pair, CancelHandle, CancelSignal, RunOutcome, StreamConsumer};
pub use models::{AggregateState, Batch, Record, Subject};
pub use report::{report, Comparison, FilteredView, ThresholdConfig};
pub use source::{BatchStream, EventSource, StreamQuery};
