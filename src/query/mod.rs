pub mod execute;
pub mod import;
pub mod plan;
pub mod query_plan;
