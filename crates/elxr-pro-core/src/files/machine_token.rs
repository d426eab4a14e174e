//! The machine token: the persisted record of an attachment.
//!
//! Two copies are kept. The private one (`private/machine-token.json`, 0600)
//! holds everything the service returned. The public one
//! (`machine-token.json`, 0644) is the same record with the product token and
//! every entitlement credential removed.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{DataFile, JsonFile};
use crate::config::PRIVATE_SUBDIR;
use crate::contract::types::null_as_default;
use crate::contract::{Entitlement, JoinResponse};
use crate::error::{Error, Result};

pub const MACHINE_TOKEN_FILE: &str = "machine-token.json";

/// Attachment record as returned by a successful join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineToken {
    #[serde(rename = "machineId", default, deserialize_with = "null_as_default")]
    pub machine_id: String,
    #[serde(
        rename = "productToken",
        alias = "token",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub product_token: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub resources: Vec<Entitlement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MachineToken {
    /// Build the record from a join answer. `machine_id` is used when the
    /// service did not echo one back.
    pub fn from_join(response: JoinResponse, machine_id: &str) -> Self {
        Self {
            machine_id: response
                .machine_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| machine_id.to_string()),
            product_token: response.product_token,
            resources: response.resources,
            message: response.message,
        }
    }

    /// A token without a machine id does not count as an attachment.
    pub fn is_attached(&self) -> bool {
        !self.machine_id.is_empty()
    }

    /// Copy safe to expose to unprivileged users.
    pub fn public_projection(&self) -> Self {
        Self {
            machine_id: self.machine_id.clone(),
            product_token: None,
            resources: self
                .resources
                .iter()
                .map(Entitlement::without_credentials)
                .collect(),
            message: self.message.clone(),
        }
    }

    /// Entitlements keyed by `type`, in first-seen order. A later entry with
    /// the same `type` replaces the earlier one.
    pub fn entitlements(&self) -> Vec<&Entitlement> {
        let mut indexed: Vec<&Entitlement> = Vec::with_capacity(self.resources.len());
        for ent in &self.resources {
            match indexed.iter_mut().find(|seen| seen.kind == ent.kind) {
                Some(slot) => *slot = ent,
                None => indexed.push(ent),
            }
        }
        indexed
    }

    pub fn entitlement(&self, kind: &str) -> Option<&Entitlement> {
        self.resources.iter().rev().find(|e| e.kind == kind)
    }
}

/// Both projections of the machine token.
#[derive(Debug, Clone)]
pub struct MachineTokenFile {
    private: JsonFile<MachineToken>,
    public: JsonFile<MachineToken>,
    privileged: bool,
}

impl MachineTokenFile {
    /// `privileged` selects which copy is read and whether writes are allowed.
    pub fn new(data_dir: &Path, privileged: bool) -> Self {
        Self {
            private: JsonFile::new(DataFile::new(
                &data_dir.join(PRIVATE_SUBDIR),
                MACHINE_TOKEN_FILE,
                true,
            )),
            public: JsonFile::new(DataFile::new(data_dir, MACHINE_TOKEN_FILE, false)),
            privileged,
        }
    }

    pub fn private_path(&self) -> &Path {
        self.private.path()
    }

    pub fn public_path(&self) -> &Path {
        self.public.path()
    }

    pub fn write(&self, token: &MachineToken) -> Result<()> {
        if !self.privileged {
            return Err(Error::NonRootUser);
        }
        self.private.write(token)?;
        self.public.write(&token.public_projection())?;
        tracing::debug!(machine_id = %token.machine_id, "machine token written");
        Ok(())
    }

    /// Read the copy matching the caller's privilege.
    pub fn read(&self) -> Result<Option<MachineToken>> {
        if self.privileged {
            self.private.read()
        } else {
            self.public.read()
        }
    }

    pub fn delete(&self) -> Result<()> {
        if !self.privileged {
            return Err(Error::NonRootUser);
        }
        self.public.delete()?;
        self.private.delete()
    }

    pub fn is_present(&self) -> bool {
        if self.privileged {
            self.public.exists() && self.private.exists()
        } else {
            self.public.exists()
        }
    }

    /// The stored token when it describes an attachment.
    pub fn attached(&self) -> Result<Option<MachineToken>> {
        Ok(self.read()?.filter(MachineToken::is_attached))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn entitlement(kind: &str, uri: &str) -> Entitlement {
        Entitlement {
            kind: kind.into(),
            uri: uri.into(),
            login: Some("user".into()),
            password: Some("hunter2".into()),
            suites: vec!["bookworm".into()],
            components: vec!["main".into()],
            ..Entitlement::default()
        }
    }

    fn sample() -> MachineToken {
        MachineToken {
            machine_id: "mid-1".into(),
            product_token: Some("pt-secret".into()),
            resources: vec![entitlement("elxr-pro", "https://repo.test/pro")],
            message: None,
        }
    }

    #[test]
    fn projections_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let token = sample();
        MachineTokenFile::new(dir.path(), true).write(&token).unwrap();

        let private = MachineTokenFile::new(dir.path(), true).read().unwrap().unwrap();
        assert_eq!(private, token);

        let public = MachineTokenFile::new(dir.path(), false).read().unwrap().unwrap();
        assert_eq!(public, token.public_projection());
        assert!(public.product_token.is_none());
        assert!(public.resources[0].login.is_none());
        assert!(public.resources[0].password.is_none());

        let raw = std::fs::read_to_string(dir.path().join(MACHINE_TOKEN_FILE)).unwrap();
        assert!(!raw.contains("pt-secret"));
        assert!(!raw.contains("hunter2"));
        assert!(!raw.contains("productToken"));
    }

    #[test]
    fn unprivileged_writes_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let file = MachineTokenFile::new(dir.path(), false);
        assert!(matches!(file.write(&sample()), Err(Error::NonRootUser)));
        assert!(matches!(file.delete(), Err(Error::NonRootUser)));
    }

    #[test]
    fn delete_removes_both_copies() {
        let dir = tempfile::tempdir().unwrap();
        let file = MachineTokenFile::new(dir.path(), true);
        file.write(&sample()).unwrap();
        assert!(file.is_present());
        file.delete().unwrap();
        assert!(!file.is_present());
        assert!(!file.private_path().exists());
        assert!(!file.public_path().exists());
        assert!(file.attached().unwrap().is_none());
    }

    #[test]
    fn duplicate_types_keep_last_entry_in_first_position() {
        let token = MachineToken {
            resources: vec![
                entitlement("a", "https://one"),
                entitlement("b", "https://two"),
                entitlement("a", "https://three"),
            ],
            ..sample()
        };
        let uris: Vec<&str> = token.entitlements().iter().map(|e| e.uri.as_str()).collect();
        assert_eq!(uris, vec!["https://three", "https://two"]);
        assert_eq!(token.entitlement("a").unwrap().uri, "https://three");
    }

    #[test]
    fn empty_machine_id_is_not_attached() {
        let dir = tempfile::tempdir().unwrap();
        let file = MachineTokenFile::new(dir.path(), true);
        file.write(&MachineToken::default()).unwrap();
        assert!(file.read().unwrap().is_some());
        assert!(file.attached().unwrap().is_none());
    }

    #[test]
    fn from_join_falls_back_to_local_machine_id() {
        let response = JoinResponse {
            machine_id: None,
            product_token: Some("pt".into()),
            ..JoinResponse::default()
        };
        assert_eq!(MachineToken::from_join(response, "local").machine_id, "local");
    }
}
