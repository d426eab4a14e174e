use anyhow::Result;
use dialoguer::Confirm;
use nix::unistd::geteuid;

use elxr_pro_core::Error;

use crate::cli::OutputFormat;

pub const CONFIRM_PROMPT: &str = "Are you sure? (y/N) ";

/// Check if the current process is running as root.
pub fn is_root() -> bool {
    geteuid().is_root()
}

pub fn require_root() -> Result<(), Error> {
    if is_root() {
        Ok(())
    } else {
        Err(Error::NonRootUser)
    }
}

/// JSON output cannot be combined with an interactive prompt.
pub const fn check_json_assume_yes(format: OutputFormat, assume_yes: bool) -> Result<(), Error> {
    match (format, assume_yes) {
        (OutputFormat::Json, false) => Err(Error::JsonFormatRequiresAssumeYes),
        _ => Ok(()),
    }
}

/// Ask for confirmation unless `assume_yes` is set. Defaults to no.
pub fn confirm(assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    Ok(Confirm::new()
        .with_prompt(CONFIRM_PROMPT.trim_end())
        .default(false)
        .interact()?)
}
