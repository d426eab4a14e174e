use std::io::Write;
use std::path::Path;

use serde::Deserialize;

use elxr_pro_core::apt::RepoConfigurator;
use elxr_pro_core::config::HOMEPAGE_URL;
use elxr_pro_core::contract::HttpTransport;
use elxr_pro_core::{Client, Command, Error, Outcome};

use crate::cli::JoinArgs;
use crate::output::Events;

/// `--attach-config` file contents.
#[derive(Debug, Deserialize)]
struct AttachConfig {
    token: String,
}

/// Token from the positional argument or the attach config, never both.
pub fn resolve_token(token: Option<String>, attach_config: Option<&Path>) -> Result<String, Error> {
    match (token, attach_config) {
        (Some(_), Some(_)) => Err(Error::AttachTokenXorConfig),
        (None, None) => Err(Error::AttachTokenRequired),
        (Some(token), None) => Ok(token),
        (None, Some(path)) => read_attach_config(path),
    }
}

fn read_attach_config(path: &Path) -> Result<String, Error> {
    let invalid = |error: String| Error::AttachInvalidConfigFile {
        config_name: path.display().to_string(),
        error,
    };
    let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    let config: AttachConfig = toml::from_str(&content).map_err(|e| invalid(e.message().to_string()))?;
    if config.token.trim().is_empty() {
        return Err(invalid("token must not be empty".to_string()));
    }
    Ok(config.token)
}

/// Callers check for root first.
pub async fn run<T, R, O, E>(
    args: JoinArgs,
    client: &mut Client<T, R>,
    events: &mut Events<O, E>,
) -> anyhow::Result<i32>
where
    T: HttpTransport,
    R: RepoConfigurator,
    O: Write,
    E: Write,
{
    let token = resolve_token(args.token, args.attach_config.as_deref())?;

    events.info("Establishing authentication file.")?;
    events.info("Enabling eLxr Pro Package Repository sources.")?;
    let outcome = client.process(Command::Join { token }).await?;
    if let Outcome::Joined {
        machine_id,
        entitlements,
    } = &outcome
    {
        tracing::info!(%machine_id, ?entitlements, "machine attached");
    }
    events.info(&format!(
        "For more information about your eLxr Pro subscription,\ngo to {HOMEPAGE_URL}"
    ))?;
    Ok(0)
}
