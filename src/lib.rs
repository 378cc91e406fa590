pub mod advisory;
pub mod bus;
pub mod circuit;
pub mod config;
pub mod drift;
pub mod execution;
pub mod indicators;
pub mod logging;
pub mod pipeline;
pub mod retry;
pub mod risk;
pub mod rollup;
pub mod safety;
pub mod sentiment;
pub mod signal;
pub mod storage;
pub mod strategy;
pub mod trend;
pub mod types;
