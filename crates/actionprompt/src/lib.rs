pub mod agent;
pub mod errors;
pub mod generation;
pub mod models;
pub mod providers;
pub mod queue;
