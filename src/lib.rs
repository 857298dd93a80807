pub mod agent;
pub mod approval;
pub mod codehost;
pub mod config;
pub mod durable;
pub mod environment;
pub mod errors;
pub mod gates;
pub mod llm;
pub mod logging;
pub mod orchestrator;
pub mod phases;
pub mod server;
pub mod store;
pub mod util;
pub mod verdict;

#[cfg(test)]
pub(crate) mod testing;
