pub mod activity;
pub mod affinity;
pub mod batch_writer;
pub mod concurrency;
pub mod dispatch;
pub mod pipeline;
pub mod ranker;
pub mod repository;
pub mod retry;

pub use pipeline::{FeedPipeline, PipelineSettings, RunSummary};
