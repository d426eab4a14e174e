//! Command handlers.
//!
//! Handlers report through [`Events`](crate::output::Events) and return the
//! process exit status. Errors are left to `main`, which renders them and maps
//! them to an exit code.

pub mod config;
pub mod join;
pub mod leave;

use std::sync::Arc;

use elxr_pro_core::apt::AptRepos;
use elxr_pro_core::contract::{ProxySettings, ReqwestTransport};
use elxr_pro_core::files::user_config::UserConfigFile;
use elxr_pro_core::{Client, Config, SecretRegistry};

use crate::guards::is_root;

pub type CliClient = Client<ReqwestTransport, AptRepos>;

/// Build the production client: `reqwest` transport with the user's proxies
/// and the real APT configurator.
pub fn build_client(config: &Config, secrets: &Arc<SecretRegistry>) -> elxr_pro_core::Result<CliClient> {
    let privileged = is_root();
    let proxies = UserConfigFile::new(&config.data_dir)
        .read(privileged)?
        .client_proxy();
    let transport = ReqwestTransport::new(&ProxySettings {
        http: proxies.http,
        https: proxies.https,
    })?;
    let client = Client::new(
        config.clone(),
        transport,
        AptRepos::new(config.apt.clone()),
        Arc::clone(secrets),
    );
    Ok(if privileged {
        client
    } else {
        client.unprivileged()
    })
}
