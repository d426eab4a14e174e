//! Wire types for the contract service.
//!
//! Field names follow the service's camelCase JSON. The canonical name of the
//! product token is `productToken`; older responses sent `token`, which is
//! accepted as an alias on input only.

use serde::{Deserialize, Deserializer, Serialize};

/// Message the service returns when a leave request completed.
pub const LEAVE_SUCCESSFUL: &str = "Leave successful";

/// Treat an explicit JSON `null` like a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Access grant for one package repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    /// Entitlement name; unique key within a machine token.
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub suites: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub components: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub architectures: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
}

impl Entitlement {
    /// `login:password` as handed to the repository configurator.
    pub fn credentials(&self) -> String {
        format!(
            "{}:{}",
            self.login.as_deref().unwrap_or_default(),
            self.password.as_deref().unwrap_or_default()
        )
    }

    /// Copy without `login`/`password`.
    pub fn without_credentials(&self) -> Self {
        Self {
            login: None,
            password: None,
            ..self.clone()
        }
    }
}

/// Descriptor of the local machine sent with every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub distribution: String,
    pub kernel: String,
    pub series: String,
    pub architecture: String,
    /// `"true"` or `"false"`; the service expects a string.
    pub desktop: String,
    pub virt: String,
    #[serde(rename = "clientVersion")]
    pub client_version: String,
    pub cpu_type: String,
}

/// Body shared by the join, leave and test requests.
#[derive(Debug, Clone, Serialize)]
pub struct ContractRequest<'a> {
    #[serde(rename = "machineId")]
    pub machine_id: &'a str,
    #[serde(rename = "machineInfo")]
    pub machine_info: &'a MachineInfo,
    #[serde(rename = "productToken", skip_serializing_if = "Option::is_none")]
    pub product_token: Option<&'a str>,
}

/// Answer to a join request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JoinResponse {
    #[serde(rename = "machineId", default)]
    pub machine_id: Option<String>,
    #[serde(rename = "productToken", alias = "token", default)]
    pub product_token: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub resources: Vec<Entitlement>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Answer to a leave request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LeaveResponse {
    #[serde(default)]
    pub message: Option<String>,
}

impl LeaveResponse {
    /// Whether the service confirmed the machine was released.
    pub fn is_successful(&self) -> bool {
        self.message.as_deref() == Some(LEAVE_SUCCESSFUL)
    }
}

/// Answer to a test request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TestResponse {
    #[serde(rename = "machineId", default)]
    pub machine_id: Option<String>,
}
