pub mod dpccp;
pub mod query_graph;

pub use query_graph::{PlanPipeline, ProbeInfo, QgInput, QueryGraph, CROSS_PRODUCT_EQ, NO_KEY};
