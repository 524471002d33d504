#[macro_use]
extern crate tracing;

pub mod cli;
pub mod cloud;
pub mod cmd;
pub mod engine;
pub mod errors;
pub mod inventory;
pub mod runtime;
pub mod selection;
pub mod tracker;
