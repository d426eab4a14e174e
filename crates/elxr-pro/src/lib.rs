//! eLxr Pro command line client.
//!
//! The binary in `main.rs` parses arguments and sets up logging; the command
//! handlers here are generic over the transport and repository configurator
//! so they can be driven from tests.

pub mod cli;
pub mod commands;
pub mod guards;
pub mod output;
