//! Conveyor Lua Definitions
//!
//! This crate loads pipeline definitions written in Lua. It includes:
//! - A restricted sandbox with `pipeline`, `step` and `when` helpers
//! - A parser that turns the returned table into a `PipelineDefinition`
//! - The built-in deployment pipeline

pub mod parser;
pub mod sandbox;

pub use parser::parse_pipeline;
pub use sandbox::create_sandbox;

pub use conveyor_core::domain::pipeline::{PipelineDefinition, Stage, Step};

/// Source of the built-in Checkout/Build/Test/Publish/Deploy pipeline
pub const BUILTIN_PIPELINE: &str = include_str!("../pipelines/default.lua");
