//! Attachment lifecycle.
//!
//! [`Client::process`] takes one [`Command`] and moves the machine between
//! the unattached and attached states:
//!
//! - `join` (unattached only): call the service, configure every returned
//!   entitlement, then persist the machine token, machine id and attachment
//!   time. Entitlements are validated before any is applied, and repositories
//!   added in this run are removed again if a later step fails, so an error
//!   leaves the machine unattached with no stray repositories.
//! - `leave` (attached only): call the service and, once it confirms, remove
//!   every entitled repository and the persisted state. `force` skips the
//!   service and only cleans up locally.
//! - `test`: call the service with an optional token. No local state changes
//!   and no lock is taken.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::apt::{self, RepoConfigurator, RepoSpec, is_https_url};
use crate::config::Config;
use crate::contract::{ContractClient, ContractRequest, HttpTransport, MachineInfo};
use crate::error::{Error, Result};
use crate::files::machine_token::{MachineToken, MachineTokenFile};
use crate::files::state_files::StateFiles;
use crate::files::user_config::{ProxyScope, UserConfigFile};
use crate::lock::{HOLDER_JOIN, HOLDER_LEAVE, LockGuard, LockOptions, RetryLock};
use crate::secrets::SecretRegistry;
use crate::system::{self, MachineIdCache};

/// A lifecycle request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join { token: String },
    Leave { force: bool },
    Test { token: Option<String> },
}

/// What a successful [`Client::process`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Joined {
        machine_id: String,
        /// Entitlement names, in the order they were configured.
        entitlements: Vec<String>,
    },
    Left {
        /// The service was not contacted.
        forced: bool,
    },
    /// The service answered the leave request without confirming it. Local
    /// state is untouched.
    LeaveNotConfirmed { message: Option<String> },
    Tested { authenticated: bool },
}

/// Current attachment state as read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    Unattached,
    Attached(MachineToken),
}

/// Runs lifecycle commands against one data directory.
pub struct Client<T, R> {
    config: Config,
    contract: ContractClient<T>,
    repos: R,
    secrets: Arc<SecretRegistry>,
    machine_token: MachineTokenFile,
    state: StateFiles,
    machine_id: MachineIdCache,
    machine_info: Option<MachineInfo>,
    lock_options: LockOptions,
}

impl<T: HttpTransport, R: RepoConfigurator> Client<T, R> {
    pub fn new(config: Config, transport: T, repos: R, secrets: Arc<SecretRegistry>) -> Self {
        let contract = ContractClient::new(transport, &config.contract_url);
        Self {
            machine_token: MachineTokenFile::new(&config.data_dir, true),
            state: StateFiles::new(&config.data_dir),
            contract,
            repos,
            secrets,
            machine_id: MachineIdCache::new(),
            machine_info: None,
            lock_options: LockOptions::default(),
            config,
        }
    }

    /// Read the public projections and refuse writes.
    #[must_use]
    pub fn unprivileged(mut self) -> Self {
        self.machine_token = MachineTokenFile::new(&self.config.data_dir, false);
        self
    }

    /// Use `info` instead of probing the system.
    #[must_use]
    pub fn with_machine_info(mut self, info: MachineInfo) -> Self {
        self.machine_info = Some(info);
        self
    }

    #[must_use]
    pub fn with_machine_id_cache(mut self, cache: MachineIdCache) -> Self {
        self.machine_id = cache;
        self
    }

    #[must_use]
    pub const fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock_options = options;
        self
    }

    #[must_use]
    pub fn with_retry_sleeps(mut self, sleeps: Vec<Duration>) -> Self {
        self.contract = self.contract.with_retry_sleeps(sleeps);
        self
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn machine_token_file(&self) -> &MachineTokenFile {
        &self.machine_token
    }

    pub const fn state_files(&self) -> &StateFiles {
        &self.state
    }

    pub fn attachment(&self) -> Result<Attachment> {
        Ok(self
            .machine_token
            .attached()?
            .map_or(Attachment::Unattached, Attachment::Attached))
    }

    pub async fn process(&mut self, command: Command) -> Result<Outcome> {
        match command {
            Command::Join { token } => {
                let _lock = self.lock(HOLDER_JOIN).await?;
                self.join(&token).await
            }
            Command::Leave { force } => {
                let _lock = self.lock(HOLDER_LEAVE).await?;
                self.leave(force).await
            }
            Command::Test { token } => self.test(token.as_deref()).await,
        }
    }

    async fn lock(&self, holder: &str) -> Result<LockGuard> {
        RetryLock::new(self.config.lock_path(), holder)
            .with_options(self.lock_options)
            .acquire()
            .await
    }

    fn machine_info(&mut self) -> MachineInfo {
        self.machine_info
            .get_or_insert_with(system::machine_info)
            .clone()
    }

    async fn join(&mut self, token: &str) -> Result<Outcome> {
        if let Attachment::Attached(existing) = self.attachment()? {
            return Err(Error::AlreadyAttached {
                account_name: existing.machine_id,
            });
        }
        self.secrets.register(token);

        let machine_id = self.machine_id.get(None);
        let machine_info = self.machine_info();
        let attached_at = Utc::now();
        let response = self
            .contract
            .join(&ContractRequest {
                machine_id: &machine_id,
                machine_info: &machine_info,
                product_token: Some(token),
            })
            .await?;
        let machine_token = MachineToken::from_join(response, &machine_id);
        self.register_token_secrets(&machine_token);

        let entitlements = machine_token.entitlements();
        if let Some(bad) = entitlements.iter().find(|e| !is_https_url(&e.uri)) {
            return Err(Error::InvalidHttpsUrl {
                url: bad.uri.clone(),
            });
        }
        let specs = entitlements
            .iter()
            .map(|ent| RepoSpec::from_entitlement(ent))
            .collect::<Result<Vec<_>>>()?;

        // No await from here on: once a repository is added, the rest of the
        // join runs to completion (or rolls back) within a single poll.
        let mut added: Vec<(String, String)> = Vec::with_capacity(specs.len());
        for spec in &specs {
            if let Err(e) = self.repos.add(spec) {
                tracing::error!(entitlement = %spec.name, "failed to configure repository: {e}");
                self.rollback_repos(&added);
                return Err(e);
            }
            added.push((spec.name.clone(), spec.uri.clone()));
        }

        if let Err(e) = self.persist_attachment(&machine_token, attached_at) {
            tracing::error!("failed to persist attachment: {e}");
            self.rollback_repos(&added);
            self.delete_local_state();
            return Err(e);
        }
        self.refresh_service_proxy(&machine_token);

        Ok(Outcome::Joined {
            machine_id: machine_token.machine_id.clone(),
            entitlements: added.into_iter().map(|(name, _)| name).collect(),
        })
    }

    /// Register the product token and every repository credential.
    fn register_token_secrets(&self, machine_token: &MachineToken) {
        if let Some(product_token) = &machine_token.product_token {
            self.secrets.register(product_token);
        }
        for ent in machine_token.entitlements() {
            if let Some(password) = &ent.password {
                self.secrets.register(password);
            }
        }
    }

    fn persist_attachment(
        &mut self,
        machine_token: &MachineToken,
        attached_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        self.machine_token.write(machine_token)?;
        // The service may have assigned a different id than the one we sent.
        self.machine_id.clear();
        let machine_id = self.machine_id.get(Some(machine_token));
        self.state.record_attachment(&machine_id, attached_at)
    }

    fn rollback_repos(&self, added: &[(String, String)]) {
        for (name, uri) in added.iter().rev() {
            if let Err(e) = self.repos.remove(name, uri) {
                tracing::warn!(entitlement = %name, "rollback failed to remove repository: {e}");
            }
        }
    }

    /// Point service-scoped APT proxies at the new entitlement hosts.
    fn refresh_service_proxy(&self, machine_token: &MachineToken) {
        let user_config = match UserConfigFile::new(&self.config.data_dir).read(true) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("could not read user config: {e}");
                return;
            }
        };
        let proxies = user_config.apt_proxy(ProxyScope::Service);
        if proxies.is_empty() {
            return;
        }
        let hosts = apt::entitlement_hosts(machine_token.entitlements());
        if let Err(e) = apt::setup_apt_proxy(&self.config.apt, ProxyScope::Service, &proxies, &hosts)
        {
            tracing::warn!("could not update APT proxy configuration: {e}");
        }
    }

    async fn leave(&mut self, force: bool) -> Result<Outcome> {
        let Attachment::Attached(machine_token) = self.attachment()? else {
            return Err(Error::Unattached);
        };
        self.register_token_secrets(&machine_token);

        if force {
            tracing::warn!("forced leave: the contract service is not informed");
            self.remove_attachment(&machine_token)?;
            return Ok(Outcome::Left { forced: true });
        }

        let machine_info = self.machine_info();
        let response = self
            .contract
            .leave(&ContractRequest {
                machine_id: &machine_token.machine_id,
                machine_info: &machine_info,
                product_token: machine_token.product_token.as_deref(),
            })
            .await?;
        if !response.is_successful() {
            tracing::warn!(message = ?response.message, "leave not confirmed by the service");
            return Ok(Outcome::LeaveNotConfirmed {
                message: response.message,
            });
        }
        self.remove_attachment(&machine_token)?;
        Ok(Outcome::Left { forced: false })
    }

    /// Remove every entitled repository, then the persisted state.
    ///
    /// Repository failures are logged and skipped so the machine always ends
    /// up unattached.
    fn remove_attachment(&mut self, machine_token: &MachineToken) -> Result<()> {
        for ent in machine_token.entitlements() {
            if let Err(e) = self.repos.remove(&ent.kind, &ent.uri) {
                tracing::warn!(entitlement = %ent.kind, "failed to remove repository: {e}");
            }
        }
        self.machine_token.delete()?;
        self.state.delete_all()?;
        self.machine_id.clear();
        self.clear_service_proxy_hosts();
        Ok(())
    }

    /// Drop the per-host entries of a service-scoped APT proxy. The snippet
    /// keeps its header while the proxy stays configured.
    fn clear_service_proxy_hosts(&self) {
        let proxies = match UserConfigFile::new(&self.config.data_dir).read(true) {
            Ok(c) => c.apt_proxy(ProxyScope::Service),
            Err(e) => {
                tracing::warn!("could not read user config: {e}");
                return;
            }
        };
        if proxies.is_empty() {
            return;
        }
        if let Err(e) = apt::setup_apt_proxy(&self.config.apt, ProxyScope::Service, &proxies, &[]) {
            tracing::warn!("could not update APT proxy configuration: {e}");
        }
    }

    fn delete_local_state(&self) {
        if let Err(e) = self.machine_token.delete().and_then(|()| self.state.delete_all()) {
            tracing::warn!("failed to clean up local state: {e}");
        }
    }

    async fn test(&mut self, token: Option<&str>) -> Result<Outcome> {
        if let Some(token) = token {
            self.secrets.register(token);
        }
        let attached = self.machine_token.attached()?;
        let machine_id = self.machine_id.get(attached.as_ref());
        let machine_info = self.machine_info();
        let response = self
            .contract
            .test(&ContractRequest {
                machine_id: &machine_id,
                machine_info: &machine_info,
                product_token: token,
            })
            .await?;

        if token.is_some() {
            let response_machine_id = response.and_then(|r| r.machine_id).unwrap_or_default();
            if response_machine_id != machine_id {
                return Err(Error::MachineIdUnmatch {
                    request_machine_id: machine_id,
                    response_machine_id,
                });
            }
        }
        Ok(Outcome::Tested {
            authenticated: token.is_some(),
        })
    }
}
