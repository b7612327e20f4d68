pub mod collector;
pub mod join_pipeline;
pub mod table_target;

pub use collector::CollectorTarget;
pub use join_pipeline::{JoinPipeline, PipelineTarget, Source};
pub use table_target::{OutputColumn, TableTarget};
