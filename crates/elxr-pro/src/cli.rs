//! Command-line definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Client to manage eLxr Pro services on a machine.
#[derive(Debug, Parser)]
#[command(name = "elxr-pro", version, about)]
pub struct Cli {
    /// show all debug log messages to console
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// attach this machine to an eLxr Pro subscription
    Join(JoinArgs),
    /// remove this machine from an eLxr Pro subscription
    Leave(LeaveArgs),
    /// validate the connection to the API server
    Test(TestArgs),
    /// manage eLxr Pro configuration on this machine
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

impl Commands {
    /// Output format of the command. `config` always prints plain text.
    pub const fn format(&self) -> OutputFormat {
        match self {
            Self::Join(args) => args.format,
            Self::Leave(args) => args.format,
            Self::Test(args) => args.format,
            Self::Config { .. } => OutputFormat::Cli,
        }
    }

    /// Token passed on the command line, if any.
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Join(args) => args.token.as_deref(),
            Self::Test(args) => args.token.as_deref(),
            Self::Leave(_) | Self::Config { .. } => None,
        }
    }
}

/// Output rendering for join/leave/test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Cli,
    Json,
}

#[derive(Debug, Clone, clap::Args)]
pub struct JoinArgs {
    /// token obtained for eLxr Pro authentication
    pub token: Option<String>,

    /// use the provided attach config file instead of passing the token on the cli
    #[arg(long, value_name = "FILE")]
    pub attach_config: Option<PathBuf>,

    /// output in the specified format (default: cli), but json format must require --assume-yes flag.
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, clap::Args)]
pub struct LeaveArgs {
    /// do not prompt for confirmation before performing the leave
    #[arg(long)]
    pub assume_yes: bool,

    /// force to leave from an eLxr Pro subscription.(Just remove local data)
    #[arg(long)]
    pub force: bool,

    /// output in the specified format (default: cli), but json format must require --assume-yes flag.
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, clap::Args)]
pub struct TestArgs {
    /// token obtained for eLxr Pro authentication
    pub token: Option<String>,

    /// do not prompt for confirmation before performing the test
    #[arg(long)]
    pub assume_yes: bool,

    /// output in the specified format (default: cli), but json format must require --assume-yes flag.
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Subcommand)]
pub enum ConfigAction {
    /// Show customizable configuration settings
    Show {
        /// Optional key or key(s) to show configuration settings.
        key: Option<String>,
    },
    /// Set and apply eLxr Pro configuration settings
    Set {
        /// key=value pair to configure for eLxr Pro services.
        key_value_pair: String,
    },
    /// Unset eLxr Pro configuration setting
    Unset {
        /// configuration key to unset from eLxr Pro services.
        key: String,
    },
}
