//! APT repository configuration for entitlements.
//!
//! Each entitlement becomes one deb822 `<type>.sources` file plus a
//! `machine … login … password …` line in the APT auth file. Proxy settings
//! from `config set` are rendered into a separate `apt.conf.d` snippet.

use std::path::{Path, PathBuf};

use url::Url;

use crate::contract::Entitlement;
use crate::error::{Error, Result};
use crate::files::{ROOT_READABLE_MODE, WORLD_READABLE_MODE, ensure_file_absent, load_file, write_file};
use crate::files::user_config::{ProxyPair, ProxyScope};

/// Keyring referenced by `Signed-By` for every entitled repository.
pub const DEFAULT_KEYRING: &str = "elxr-pro-archive-keyring.gpg";

/// Suffix marking auth lines owned by this client.
const APT_AUTH_COMMENT: &str = "  # elxr-pro-client";

const SOURCES_HEADER: &str = "# Written by elxr-pro-client\n";

const APT_PROXY_CONFIG_HEADER: &str = "\
/*
 * Autogenerated by elxr-pro-client
 * Do not edit this file directly
 *
 * To change what elxr-pro-client sets, use the `elxr-pro config set`
 * or the `elxr-pro config unset` commands to set/unset either:
 *      global_apt_http_proxy and global_apt_https_proxy
 * for a global apt proxy
 * or
 *      ea_apt_http_proxy and ea_apt_https_proxy
 * for an apt proxy that only applies to eLxr Pro related repos.
 */
";

/// Locations of the APT files this client manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AptPaths {
    pub sources_dir: PathBuf,
    pub auth_file: PathBuf,
    pub keyrings_dir: PathBuf,
    pub proxy_conf: PathBuf,
}

impl Default for AptPaths {
    fn default() -> Self {
        Self {
            sources_dir: PathBuf::from("/etc/apt/sources.list.d"),
            auth_file: PathBuf::from("/etc/apt/auth.conf.d/90elxr-pro"),
            keyrings_dir: PathBuf::from("/usr/share/keyrings"),
            proxy_conf: PathBuf::from("/etc/apt/apt.conf.d/90elxr-pro-aptproxy"),
        }
    }
}

impl AptPaths {
    /// Every path placed under `root`, for tests and chroots.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            sources_dir: root.join("sources.list.d"),
            auth_file: root.join("auth.conf.d").join("90elxr-pro"),
            keyrings_dir: root.join("keyrings"),
            proxy_conf: root.join("apt.conf.d").join("90elxr-pro-aptproxy"),
        }
    }

    pub fn sources_file(&self, name: &str) -> PathBuf {
        self.sources_dir.join(format!("{name}.sources"))
    }

    fn legacy_list_file(&self, name: &str) -> PathBuf {
        self.sources_dir.join(format!("{name}.list"))
    }
}

/// One repository to configure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSpec {
    pub name: String,
    pub uri: String,
    /// `login:password`, or a bare bearer token.
    pub credentials: String,
    pub suites: Vec<String>,
    pub components: Vec<String>,
    pub keyring: String,
}

impl RepoSpec {
    pub fn from_entitlement(ent: &Entitlement) -> Result<Self> {
        check_repo_name(&ent.kind)?;
        Ok(Self {
            name: ent.kind.clone(),
            uri: ent.uri.clone(),
            credentials: ent.credentials(),
            suites: ent.suites.clone(),
            components: ent.components.clone(),
            keyring: DEFAULT_KEYRING.to_string(),
        })
    }
}

/// Reject names that would not stay a single file inside `sources.list.d`.
pub fn check_repo_name(name: &str) -> Result<()> {
    let invalid = name.trim().is_empty()
        || name.contains('/')
        || name.contains('\0')
        || name.starts_with('.');
    if invalid {
        return Err(Error::InvalidEntitlementName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Adds and removes entitled repositories.
pub trait RepoConfigurator {
    fn add(&self, repo: &RepoSpec) -> Result<()>;

    /// Remove everything `add` created. Missing files are not an error.
    fn remove(&self, name: &str, uri: &str) -> Result<()>;
}

/// Whether `uri` parses as an `https` URL.
pub fn is_https_url(uri: &str) -> bool {
    Url::parse(uri).is_ok_and(|u| u.scheme() == "https")
}

/// `host[:port]/path/` as used in APT auth `machine` entries.
fn repo_path(uri: &str) -> String {
    let without_scheme = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    format!("{}/", without_scheme.trim_end_matches('/'))
}

/// [`RepoConfigurator`] writing real APT files.
#[derive(Debug, Clone, Default)]
pub struct AptRepos {
    paths: AptPaths,
}

impl AptRepos {
    pub const fn new(paths: AptPaths) -> Self {
        Self { paths }
    }

    pub const fn paths(&self) -> &AptPaths {
        &self.paths
    }

    fn sources_content(&self, repo: &RepoSpec) -> String {
        format!(
            "{SOURCES_HEADER}Types: deb\nURIs: {}\nSuites: {}\nComponents: {}\nSigned-By: {}\n",
            repo.uri,
            repo.suites.join(" "),
            repo.components.join(" "),
            self.paths.keyrings_dir.join(&repo.keyring).display()
        )
    }

    /// Add or replace the auth entry for `uri`.
    ///
    /// An entry for the same repo path is replaced in place. A sub-route of
    /// an existing entry is inserted before that entry so APT matches the
    /// more specific path first.
    fn add_auth_entry(&self, uri: &str, login: &str, password: &str) -> Result<()> {
        let path = repo_path(uri);
        let auth_line = format!("machine {path} login {login} password {password}{APT_AUTH_COMMENT}");
        let existing = load_file(&self.paths.auth_file)?.unwrap_or_default();

        let mut lines = Vec::new();
        let mut added = false;
        for line in existing.lines() {
            if !added {
                if let Some(machine) = line.split_whitespace().nth(1) {
                    if machine == path {
                        lines.push(auth_line.clone());
                        added = true;
                        continue;
                    }
                    if path.starts_with(machine) {
                        lines.push(auth_line.clone());
                        added = true;
                    }
                }
            }
            lines.push(line.to_string());
        }
        if !added {
            lines.push(auth_line);
        }
        let mut content = lines.join("\n");
        content.push('\n');
        write_file(&self.paths.auth_file, &content, Some(ROOT_READABLE_MODE))?;
        Ok(())
    }

    fn remove_auth_entry(&self, uri: &str) -> Result<()> {
        let Some(existing) = load_file(&self.paths.auth_file)? else {
            return Ok(());
        };
        let path = repo_path(uri);
        let kept: Vec<&str> = existing
            .lines()
            .filter(|line| {
                let tokens: Vec<&str> = line.split_whitespace().collect();
                !tokens.windows(2).any(|w| w[0] == "machine" && w[1] == path)
            })
            .collect();
        if kept.iter().all(|l| l.trim().is_empty()) {
            ensure_file_absent(&self.paths.auth_file)?;
        } else {
            write_file(&self.paths.auth_file, &kept.join("\n"), Some(ROOT_READABLE_MODE))?;
        }
        Ok(())
    }
}

impl RepoConfigurator for AptRepos {
    fn add(&self, repo: &RepoSpec) -> Result<()> {
        check_repo_name(&repo.name)?;
        if !is_https_url(&repo.uri) {
            return Err(Error::InvalidHttpsUrl {
                url: repo.uri.clone(),
            });
        }
        let (login, password) = repo
            .credentials
            .split_once(':')
            .unwrap_or(("bearer", repo.credentials.as_str()));
        tracing::info!(repo = %repo.name, uri = %repo.uri, "adding APT repository");
        self.add_auth_entry(&repo.uri, login, password)?;
        write_file(
            &self.paths.sources_file(&repo.name),
            &self.sources_content(repo),
            Some(WORLD_READABLE_MODE),
        )?;
        Ok(())
    }

    fn remove(&self, name: &str, uri: &str) -> Result<()> {
        check_repo_name(name)?;
        tracing::info!(repo = name, uri, "removing APT repository");
        ensure_file_absent(&self.paths.sources_file(name))?;
        ensure_file_absent(&self.paths.legacy_list_file(name))?;
        self.remove_auth_entry(uri)
    }
}

/// Render the APT proxy snippet for `scope`.
///
/// Service-scoped proxies apply only to `hosts`. An empty pair removes the
/// snippet.
pub fn setup_apt_proxy(
    paths: &AptPaths,
    scope: ProxyScope,
    proxies: &ProxyPair,
    hosts: &[String],
) -> Result<()> {
    if proxies.is_empty() {
        ensure_file_absent(&paths.proxy_conf)?;
        return Ok(());
    }
    tracing::info!("Setting {} APT proxy", scope_name(scope));

    let mut content = APT_PROXY_CONFIG_HEADER.to_string();
    let entries = [("http", &proxies.http), ("https", &proxies.https)];
    for (protocol, url) in entries {
        let Some(url) = url else { continue };
        match scope {
            ProxyScope::Global => {
                content.push_str(&format!("Acquire::{protocol}::Proxy \"{url}\";\n"));
            }
            ProxyScope::Service => {
                for host in hosts {
                    content.push_str(&format!("Acquire::{protocol}::Proxy::{host} \"{url}\";\n"));
                }
            }
        }
    }
    write_file(&paths.proxy_conf, &content, Some(WORLD_READABLE_MODE))?;
    Ok(())
}

const fn scope_name(scope: ProxyScope) -> &'static str {
    match scope {
        ProxyScope::Global => "global",
        ProxyScope::Service => "eLxr Pro",
    }
}

/// Hosts of the entitled repositories, deduplicated, in order.
pub fn entitlement_hosts<'a>(entitlements: impl IntoIterator<Item = &'a Entitlement>) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    for ent in entitlements {
        if let Some(host) = Url::parse(&ent.uri).ok().and_then(|u| u.host_str().map(str::to_string)) {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
    }
    hosts
}
