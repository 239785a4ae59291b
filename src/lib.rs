pub mod admission;
pub mod app;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod http;
pub mod kb;
pub mod matcher;
pub mod metrics;
pub mod model;
pub mod not_found;
pub mod output;
pub mod parser;
pub mod plugins;
pub mod pool;
pub mod queue;
pub mod runner;
pub mod utils;

#[cfg(test)]
mod tests;
