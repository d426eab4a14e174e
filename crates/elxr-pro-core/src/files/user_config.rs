//! User-settable proxy configuration.
//!
//! APT proxies come in two scopes that cannot be active together: global
//! (`global_apt_*`, applied to every repository) and service scoped
//! (`ea_apt_*`, applied only to entitled repository hosts). Assigning a key
//! of one scope clears the other scope.

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use super::{DataFile, JsonFile};
use crate::config::PRIVATE_SUBDIR;
use crate::error::{Error, Result};
use crate::secrets::REDACTED;

pub const USER_CONFIG_FILE: &str = "user-config.json";

/// Keys accepted by `config show/set/unset`, in display order.
pub const CONFIGURABLE_KEYS: &[&str] = &[
    "http_proxy",
    "https_proxy",
    "global_apt_http_proxy",
    "global_apt_https_proxy",
    "ea_apt_http_proxy",
    "ea_apt_https_proxy",
];

/// Which APT proxy scope a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScope {
    Global,
    Service,
}

impl ProxyScope {
    pub fn of_key(key: &str) -> Option<Self> {
        if key.starts_with("global_apt_") {
            Some(Self::Global)
        } else if key.starts_with("ea_apt_") {
            Some(Self::Service)
        } else {
            None
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Global => "global apt",
            Self::Service => "pro scoped apt",
        }
    }

    pub const fn other(self) -> Self {
        match self {
            Self::Global => Self::Service,
            Self::Service => Self::Global,
        }
    }
}

/// An `http`/`https` proxy pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyPair {
    pub http: Option<String>,
    pub https: Option<String>,
}

impl ProxyPair {
    pub const fn is_empty(&self) -> bool {
        self.http.is_none() && self.https.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_apt_http_proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_apt_https_proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ea_apt_http_proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ea_apt_https_proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
}

impl UserConfig {
    fn slot_mut(&mut self, key: &str) -> Result<&mut Option<String>> {
        Ok(match key {
            "global_apt_http_proxy" => &mut self.global_apt_http_proxy,
            "global_apt_https_proxy" => &mut self.global_apt_https_proxy,
            "ea_apt_http_proxy" => &mut self.ea_apt_http_proxy,
            "ea_apt_https_proxy" => &mut self.ea_apt_https_proxy,
            "http_proxy" => &mut self.http_proxy,
            "https_proxy" => &mut self.https_proxy,
            _ => return Err(invalid_key(key)),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<&str>> {
        let value = match key {
            "global_apt_http_proxy" => &self.global_apt_http_proxy,
            "global_apt_https_proxy" => &self.global_apt_https_proxy,
            "ea_apt_http_proxy" => &self.ea_apt_http_proxy,
            "ea_apt_https_proxy" => &self.ea_apt_https_proxy,
            "http_proxy" => &self.http_proxy,
            "https_proxy" => &self.https_proxy,
            _ => return Err(invalid_key(key)),
        };
        Ok(value.as_deref())
    }

    /// Set or clear `key`.
    ///
    /// Setting an APT proxy clears the opposite scope. Returns that scope if
    /// it had a value, so the caller can warn about the overwrite.
    pub fn assign(&mut self, key: &str, value: Option<String>) -> Result<Option<ProxyScope>> {
        *self.slot_mut(key)? = value.clone();
        let Some(scope) = ProxyScope::of_key(key).filter(|_| value.is_some()) else {
            return Ok(None);
        };
        let cleared = scope.other();
        let previous = self.apt_proxy_mut(cleared).take();
        Ok((!previous.is_empty()).then_some(cleared))
    }

    fn apt_proxy_mut(&mut self, scope: ProxyScope) -> PairMut<'_> {
        match scope {
            ProxyScope::Global => PairMut {
                http: &mut self.global_apt_http_proxy,
                https: &mut self.global_apt_https_proxy,
            },
            ProxyScope::Service => PairMut {
                http: &mut self.ea_apt_http_proxy,
                https: &mut self.ea_apt_https_proxy,
            },
        }
    }

    pub fn apt_proxy(&self, scope: ProxyScope) -> ProxyPair {
        let (http, https) = match scope {
            ProxyScope::Global => (&self.global_apt_http_proxy, &self.global_apt_https_proxy),
            ProxyScope::Service => (&self.ea_apt_http_proxy, &self.ea_apt_https_proxy),
        };
        ProxyPair {
            http: http.clone(),
            https: https.clone(),
        }
    }

    /// Proxies for the client's own HTTP traffic.
    pub fn client_proxy(&self) -> ProxyPair {
        ProxyPair {
            http: self.http_proxy.clone(),
            https: self.https_proxy.clone(),
        }
    }

    /// Both APT scopes carry a value. Only reachable by editing files by hand.
    pub fn has_conflicting_scopes(&self) -> bool {
        !self.apt_proxy(ProxyScope::Global).is_empty()
            && !self.apt_proxy(ProxyScope::Service).is_empty()
    }

    /// Copy with credential-bearing URLs masked.
    pub fn redacted(&self) -> Self {
        let mask = |value: &Option<String>| {
            value.as_ref().map(|v| {
                if has_credentials(v) {
                    REDACTED.to_string()
                } else {
                    v.clone()
                }
            })
        };
        Self {
            global_apt_http_proxy: mask(&self.global_apt_http_proxy),
            global_apt_https_proxy: mask(&self.global_apt_https_proxy),
            ea_apt_http_proxy: mask(&self.ea_apt_http_proxy),
            ea_apt_https_proxy: mask(&self.ea_apt_https_proxy),
            http_proxy: mask(&self.http_proxy),
            https_proxy: mask(&self.https_proxy),
        }
    }
}

/// Mutable view over one scope's pair.
struct PairMut<'a> {
    http: &'a mut Option<String>,
    https: &'a mut Option<String>,
}

impl PairMut<'_> {
    fn take(self) -> ProxyPair {
        ProxyPair {
            http: self.http.take(),
            https: self.https.take(),
        }
    }
}

fn invalid_key(key: &str) -> Error {
    tracing::debug!(key, "unknown config key");
    Error::InvalidArgChoice {
        arg: "<key>".to_string(),
        choices: CONFIGURABLE_KEYS.join(", "),
    }
}

fn has_credentials(value: &str) -> bool {
    Url::parse(value).is_ok_and(|u| !u.username().is_empty() || u.password().is_some())
}

/// Check that `value` is an `http`/`https` URL with a host.
pub fn validate_proxy_url(value: &str) -> Result<()> {
    match Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => Ok(()),
        _ => Err(Error::InvalidProxyUrl {
            url: value.to_string(),
        }),
    }
}

/// Private and public copies of [`UserConfig`].
#[derive(Debug, Clone)]
pub struct UserConfigFile {
    private: JsonFile<UserConfig>,
    public: JsonFile<UserConfig>,
}

impl UserConfigFile {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            private: JsonFile::new(DataFile::new(
                &data_dir.join(PRIVATE_SUBDIR),
                USER_CONFIG_FILE,
                true,
            )),
            public: JsonFile::new(DataFile::new(data_dir, USER_CONFIG_FILE, false)),
        }
    }

    /// Private copy when privileged and present, else the public one.
    pub fn read(&self, privileged: bool) -> Result<UserConfig> {
        if privileged {
            if let Some(config) = self.private.read()? {
                return Ok(config);
            }
        }
        Ok(self.public.read()?.unwrap_or_default())
    }

    pub fn write(&self, config: &UserConfig) -> Result<()> {
        self.private.write(config)?;
        self.public.write(&config.redacted())
    }
}
