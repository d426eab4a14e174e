//! `config show|set|unset`.
//!
//! User-facing output uses writeln! to the given writers (stdout/stderr in
//! the binary).

use std::io::Write;

use elxr_pro_core::apt::{entitlement_hosts, setup_apt_proxy};
use elxr_pro_core::files::machine_token::MachineTokenFile;
use elxr_pro_core::files::user_config::{
    CONFIGURABLE_KEYS, ProxyScope, UserConfig, UserConfigFile, validate_proxy_url,
};
use elxr_pro_core::{Config, Error};

use crate::cli::ConfigAction;

pub const CONFLICTING_PROXIES: &str = "\nError: Setting global apt proxy and pro scoped apt proxy at the same time is unsupported. No apt proxy is set.";

/// Execute a config subcommand. Callers check for root before `set`/`unset`.
pub fn run(
    action: ConfigAction,
    config: &Config,
    privileged: bool,
    out: &mut impl Write,
    err: &mut impl Write,
) -> anyhow::Result<i32> {
    match action {
        ConfigAction::Show { key } => show(config, key.as_deref(), privileged, out, err),
        ConfigAction::Set { key_value_pair } => set(config, &key_value_pair, err),
        ConfigAction::Unset { key } => unset(config, &key),
    }
}

fn show(
    config: &Config,
    key: Option<&str>,
    privileged: bool,
    out: &mut impl Write,
    err: &mut impl Write,
) -> anyhow::Result<i32> {
    let user_config = UserConfigFile::new(&config.data_dir).read(privileged)?;
    if let Some(key) = key {
        let value = user_config.get(key)?.unwrap_or("None");
        writeln!(out, "{key} {value}")?;
        return Ok(0);
    }

    let width = CONFIGURABLE_KEYS.iter().map(|k| k.len()).max().unwrap_or(0) + 1;
    for key in CONFIGURABLE_KEYS {
        let value = user_config.get(key)?.unwrap_or("None");
        writeln!(out, "{key:<width$} {value}")?;
    }
    if user_config.has_conflicting_scopes() {
        writeln!(err, "{CONFLICTING_PROXIES}")?;
    }
    Ok(0)
}

/// Split `key=value`, checking the key and that the value is non-empty.
pub fn parse_key_value(pair: &str) -> Result<(&str, &str), Error> {
    let Some((key, value)) = pair.split_once('=') else {
        return Err(Error::InvalidFormat {
            expected: "<key>=<value>".to_string(),
            actual: pair.to_string(),
        });
    };
    let (key, value) = (key.trim(), value.trim());
    UserConfig::default().get(key)?;
    if value.is_empty() {
        return Err(Error::EmptyConfigValue {
            key: key.to_string(),
        });
    }
    Ok((key, value))
}

fn set(config: &Config, pair: &str, err: &mut impl Write) -> anyhow::Result<i32> {
    let (key, value) = parse_key_value(pair)?;
    validate_proxy_url(value)?;

    let file = UserConfigFile::new(&config.data_dir);
    let mut user_config = file.read(true)?;
    let scope = ProxyScope::of_key(key);
    if let (Some(current), Some(previous)) =
        (scope, user_config.assign(key, Some(value.to_string()))?)
    {
        writeln!(
            err,
            "Warning: Setting the {} proxy will overwrite the {}\nproxy previously set via `elxr-pro config`.",
            current.label(),
            previous.label()
        )?;
    }
    file.write(&user_config)?;
    tracing::info!(key, "config value set");

    if let Some(scope) = scope {
        apply_apt_proxy(config, &user_config, scope)?;
    }
    Ok(0)
}

fn unset(config: &Config, key: &str) -> anyhow::Result<i32> {
    let file = UserConfigFile::new(&config.data_dir);
    let mut user_config = file.read(true)?;
    user_config.assign(key, None)?;
    file.write(&user_config)?;
    tracing::info!(key, "config value unset");

    if let Some(scope) = ProxyScope::of_key(key) {
        apply_apt_proxy(config, &user_config, scope)?;
    }
    Ok(0)
}

/// Rewrite the APT proxy snippet for `scope`. Service-scoped proxies target
/// the hosts of the attached entitlements.
fn apply_apt_proxy(config: &Config, user_config: &UserConfig, scope: ProxyScope) -> elxr_pro_core::Result<()> {
    let hosts = match scope {
        ProxyScope::Global => Vec::new(),
        ProxyScope::Service => MachineTokenFile::new(&config.data_dir, true)
            .attached()?
            .map(|token| entitlement_hosts(token.entitlements()))
            .unwrap_or_default(),
    };
    setup_apt_proxy(&config.apt, scope, &user_config.apt_proxy(scope), &hosts)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use elxr_pro_core::apt::AptPaths;

    use super::*;

    fn config(dir: &std::path::Path) -> Config {
        Config {
            apt: AptPaths::rooted_at(&dir.join("apt")),
            ..Config::with_data_dir(dir.join("data"))
        }
    }

    fn run_action(config: &Config, action: ConfigAction) -> (String, String) {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        run(action, config, true, &mut out, &mut err).unwrap();
        (String::from_utf8(out).unwrap(), String::from_utf8(err).unwrap())
    }

    #[test]
    fn key_value_parsing() {
        assert_eq!(
            parse_key_value("http_proxy = http://p:3128").unwrap(),
            ("http_proxy", "http://p:3128")
        );
        assert_eq!(parse_key_value("http_proxy").unwrap_err().code(), "generic-invalid-format");
        assert_eq!(parse_key_value("bogus=x").unwrap_err().code(), "invalid-arg-choice");
        assert_eq!(parse_key_value("http_proxy=").unwrap_err().code(), "empty-value");
    }

    #[test]
    fn show_lists_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let (out, err) = run_action(&config(dir.path()), ConfigAction::Show { key: None });
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), CONFIGURABLE_KEYS.len());
        assert_eq!(lines[0], format!("{:<23} None", "http_proxy"));
        assert!(err.is_empty());
    }

    #[test]
    fn set_global_then_service_warns_and_rewrites_apt_conf() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        run_action(
            &config,
            ConfigAction::Set {
                key_value_pair: "global_apt_http_proxy=http://global:3128".into(),
            },
        );
        let conf = std::fs::read_to_string(&config.apt.proxy_conf).unwrap();
        assert!(conf.contains("Acquire::http::Proxy \"http://global:3128\";"));

        let (_, err) = run_action(
            &config,
            ConfigAction::Set {
                key_value_pair: "ea_apt_http_proxy=http://scoped:3128".into(),
            },
        );
        assert!(err.contains("Setting the pro scoped apt proxy will overwrite the global apt"));

        let (out, _) = run_action(
            &config,
            ConfigAction::Show {
                key: Some("global_apt_http_proxy".into()),
            },
        );
        assert_eq!(out, "global_apt_http_proxy None\n");
        let conf = std::fs::read_to_string(&config.apt.proxy_conf).unwrap();
        assert!(!conf.contains("http://global:3128"));
    }

    #[test]
    fn unset_removes_apt_conf_when_scope_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        run_action(
            &config,
            ConfigAction::Set {
                key_value_pair: "global_apt_https_proxy=http://global:3128".into(),
            },
        );
        assert!(config.apt.proxy_conf.exists());
        run_action(
            &config,
            ConfigAction::Unset {
                key: "global_apt_https_proxy".into(),
            },
        );
        assert!(!config.apt.proxy_conf.exists());
    }

    #[test]
    fn public_copy_masks_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        run_action(
            &config,
            ConfigAction::Set {
                key_value_pair: "https_proxy=http://user:pw@proxy:3128".into(),
            },
        );
        let mut out = Vec::new();
        run(
            ConfigAction::Show {
                key: Some("https_proxy".into()),
            },
            &config,
            false,
            &mut out,
            &mut Vec::new(),
        )
        .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "https_proxy <REDACTED>\n");
    }

    #[test]
    fn invalid_proxy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(
            ConfigAction::Set {
                key_value_pair: "http_proxy=not a url".into(),
            },
            &config(dir.path()),
            true,
            &mut Vec::new(),
            &mut Vec::new(),
        )
        .unwrap_err();
        let err = err.downcast::<Error>().unwrap();
        assert_eq!(err.code(), "invalid-proxy-url");
    }
}
