//! Conveyor Core
//!
//! Core types and abstractions for the Conveyor pipeline runner.
//!
//! This crate contains:
//! - Domain types: pipeline templates, runs, parameters, status events
//! - The error taxonomy shared by every Conveyor crate
//! - Variable templating for step arguments

pub mod domain;
pub mod error;
pub mod template;

pub use error::{PipelineError, Result};
