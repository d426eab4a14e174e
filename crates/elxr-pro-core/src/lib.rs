//! eLxr Pro Client Core Library
//!
//! Everything behind the `elxr-pro` command line:
//! - Attachment lifecycle (join / leave / test)
//! - Contract service client
//! - Machine token and state file store
//! - APT repository, auth and proxy configuration
//! - Lock file, secret redaction and logging setup

pub mod actions;
pub mod apt;
pub mod config;
pub mod contract;
pub mod error;
pub mod files;
pub mod lock;
pub mod secrets;
pub mod system;
pub mod tracing_init;

pub use actions::{Attachment, Client, Command, Outcome};
pub use config::Config;
pub use error::{Error, Result};
pub use secrets::SecretRegistry;
