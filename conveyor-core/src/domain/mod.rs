//! Core domain types
//!
//! This module contains the structures shared by the Lua definition parser,
//! the runner and the CLI. Pipeline templates are immutable once parsed;
//! runs are owned and mutated by the executor.

pub mod credential;
pub mod deploy;
pub mod log;
pub mod parameter;
pub mod pipeline;
pub mod run;
pub mod status;
