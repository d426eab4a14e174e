//! Contract service client.
//!
//! Three actions are exposed by the service, all `POST` with the same request
//! body: join, leave and test. Socket timeouts are retried on a fixed
//! schedule; any other transport failure surfaces immediately as
//! [`Error::Connectivity`].

pub mod transport;
pub mod types;

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
pub use transport::{HttpResponse, HttpTransport, ProxySettings, ReqwestTransport, TransportError};
pub use types::{
    ContractRequest, Entitlement, JoinResponse, LEAVE_SUCCESSFUL, LeaveResponse, MachineInfo,
    TestResponse,
};

/// Sleeps between attempts after a socket timeout.
pub const DEFAULT_RETRY_SLEEPS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(2),
];

/// Contract service action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Join,
    Leave,
    Test,
}

impl Action {
    pub const fn path(self) -> &'static str {
        match self {
            Self::Join => "/api/v1/actions/join",
            Self::Leave => "/api/v1/actions/leave",
            Self::Test => "/api/v1/actions/test",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Test => "test",
        }
    }
}

/// Client for the contract service.
#[derive(Debug)]
pub struct ContractClient<T> {
    transport: T,
    base_url: String,
    retry_sleeps: Vec<Duration>,
}

impl<T: HttpTransport> ContractClient<T> {
    pub fn new(transport: T, base_url: &str) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry_sleeps: DEFAULT_RETRY_SLEEPS.to_vec(),
        }
    }

    /// Replace the timeout retry schedule.
    #[must_use]
    pub fn with_retry_sleeps(mut self, sleeps: Vec<Duration>) -> Self {
        self.retry_sleeps = sleeps;
        self
    }

    pub fn url(&self, action: Action) -> String {
        format!("{}{}", self.base_url, action.path())
    }

    /// Send `request` for `action`.
    ///
    /// Any status other than 200 is an [`Error::ContractApi`], except a 401
    /// to a `test` request that carried no token.
    pub async fn send(&self, action: Action, request: &ContractRequest<'_>) -> Result<HttpResponse> {
        let url = self.url(action);
        let body = serde_json::to_string(request)?;
        let mut sleeps = self.retry_sleeps.iter();

        let response = loop {
            tracing::debug!(action = action.as_str(), %url, "contract request");
            match self
                .transport
                .post_json(&url, body.clone(), request.product_token)
                .await
            {
                Ok(resp) => break resp,
                Err(TransportError::Timeout(cause)) => {
                    let Some(sleep) = sleeps.next() else {
                        return Err(Error::Connectivity { url, cause });
                    };
                    tracing::debug!(
                        "{cause}: Retrying {} more times.",
                        sleeps.len() + 1
                    );
                    tokio::time::sleep(*sleep).await;
                }
                Err(TransportError::Connect(cause)) => {
                    tracing::warn!(%url, "failed to reach contract service: {cause}");
                    return Err(Error::Connectivity { url, cause });
                }
            }
        };

        tracing::debug!(status = response.status, body = %response.body, "contract response");
        let unauthenticated_test =
            action == Action::Test && request.product_token.is_none() && response.status == 401;
        if response.status != 200 && !unauthenticated_test {
            return Err(Error::ContractApi {
                url: action.path().to_string(),
                code: response.status,
                body: response.body,
            });
        }
        Ok(response)
    }

    async fn send_typed<R>(&self, action: Action, request: &ContractRequest<'_>) -> Result<R>
    where
        R: DeserializeOwned + Default,
    {
        let response = self.send(action, request).await?;
        if response.status != 200 || response.body.trim().is_empty() {
            return Ok(R::default());
        }
        serde_json::from_str(&response.body).map_err(|e| Error::InvalidResponse {
            url: action.path().to_string(),
            reason: e.to_string(),
        })
    }

    pub async fn join(&self, request: &ContractRequest<'_>) -> Result<JoinResponse> {
        self.send_typed(Action::Join, request).await
    }

    pub async fn leave(&self, request: &ContractRequest<'_>) -> Result<LeaveResponse> {
        self.send_typed(Action::Leave, request).await
    }

    /// `None` when the service answered 401 to an unauthenticated test.
    pub async fn test(&self, request: &ContractRequest<'_>) -> Result<Option<TestResponse>> {
        let response = self.send(Action::Test, request).await?;
        if response.status != 200 {
            return Ok(None);
        }
        if response.body.trim().is_empty() {
            return Ok(Some(TestResponse::default()));
        }
        serde_json::from_str(&response.body)
            .map(Some)
            .map_err(|e| Error::InvalidResponse {
                url: Action::Test.path().to_string(),
                reason: e.to_string(),
            })
    }
}
