pub mod condition;
pub mod sgcluster;
pub mod sgconfig;
