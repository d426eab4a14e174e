use std::io::Write;

use elxr_pro_core::apt::RepoConfigurator;
use elxr_pro_core::contract::HttpTransport;
use elxr_pro_core::{Attachment, Client, Command, Error, Outcome};

use crate::cli::LeaveArgs;
use crate::output::Events;

pub const DETACH_SUCCESS: &str = "This machine is now detached.";
pub const FORCE_DETACH: &str = "Force to leave, only remove local elxr-pro data. \
                                You can try join again and leave to detach machine.";

/// Callers check for root and the json/assume-yes combination first.
/// `confirm` is asked once the machine is known to be attached.
pub async fn run<T, R, O, E>(
    args: LeaveArgs,
    client: &mut Client<T, R>,
    events: &mut Events<O, E>,
    confirm: impl FnOnce(bool) -> anyhow::Result<bool>,
) -> anyhow::Result<i32>
where
    T: HttpTransport,
    R: RepoConfigurator,
    O: Write,
    E: Write,
{
    if client.attachment()? == Attachment::Unattached {
        return Err(Error::Unattached.into());
    }
    if !confirm(args.assume_yes)? {
        return Ok(1);
    }

    match client.process(Command::Leave { force: args.force }).await? {
        Outcome::Left { forced: true } => events.info(FORCE_DETACH)?,
        Outcome::Left { forced: false } => events.info(DETACH_SUCCESS)?,
        Outcome::LeaveNotConfirmed { message } => {
            events.warning(&format!(
                "The server did not confirm the leave request: {}",
                message.as_deref().unwrap_or("no message")
            ))?;
            return Ok(1);
        }
        other => tracing::warn!(?other, "unexpected leave outcome"),
    }
    Ok(0)
}
