//! Command implementations.

pub mod list;
pub mod mock_server;
pub mod run;
pub mod validate;
