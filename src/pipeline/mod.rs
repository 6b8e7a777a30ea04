pub mod conform;
pub mod facts;
pub mod normalize;
pub mod orchestrator;
pub mod report;
pub mod validate;
