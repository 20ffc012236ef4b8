// src/lib.rs

pub mod buffer;
pub mod collector;
pub mod config;
pub mod constants;
pub mod corpus;
pub mod pacing;
pub mod report;
pub mod run;
pub mod size_parser;
pub mod store;
mod worker;

pub use collector::{OpKind, Operation, Operations};
pub use run::{RunOutcome, Runner};
