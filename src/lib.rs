//! muster-test - behavioral and integration test harness for the muster
//! MCP aggregator.
//!
//! The harness reads declarative YAML scenarios, spawns a dedicated
//! aggregator instance per scenario on an isolated port together with the
//! mock collaborators the scenario declares (OAuth identity providers,
//! child tool servers), drives the scenario's steps through an MCP client,
//! and aggregates the results into a suite report.

pub mod cli;
pub mod client;
pub mod error;
pub mod instance;
pub mod matching;
pub mod mock;
pub mod report;
pub mod runner;
pub mod scenario;
