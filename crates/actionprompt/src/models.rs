//! These models represent the objects passed around between agents and providers
//!
//! A conversation is an ordered transcript of messages plus the tool catalogue
//! and generation options for the next request. Providers translate it to and
//! from their own wire formats; the internal models do not match any single
//! provider exactly.
pub mod action;
pub mod conversation;
pub mod message;
pub mod role;
pub mod tool;
