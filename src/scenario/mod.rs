//! Scenario schema, loading, and filtering.

pub mod loader;
pub mod schema;

pub use loader::{ScenarioFilter, filter_scenarios, load_scenarios, validate_scenario};
pub use schema::{Category, Concept, Expectation, Scenario, Step};
