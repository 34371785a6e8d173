pub mod cmin;
pub mod corpus;
pub mod dedup;
pub mod directed;
pub mod monitor;
pub mod patch;
pub mod seedgen;
pub mod slice;
pub mod triage;
pub mod worker;
pub mod workspace;
