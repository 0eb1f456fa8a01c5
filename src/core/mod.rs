//! Core engine — types, parsing, resolution, graph building, diffing, execution, state.

pub mod error;
pub mod executor;
pub mod graph;
pub mod instance;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod state;
pub mod types;
