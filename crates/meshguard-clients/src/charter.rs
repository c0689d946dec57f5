//! Client for the charter policy-enforcement service
//!
//! The charter is the only collaborator allowed to mutate node behavior.
//! Every call carries an idempotency key equal to the policy id, so the
//! executor can safely retry without double-applying actions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meshguard_common::types::{PolicyId, RemediationAction, RemediationPolicy};
use meshguard_common::{Error, Result};
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Opaque handle the charter returns for a submitted policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyHandle {
    pub policy_id: PolicyId,
    pub charter_ref: String,
}

/// Record of one activated action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub policy_id: PolicyId,
    pub action_index: usize,
    pub activated_at: DateTime<Utc>,
}

/// Record of a rollback performed by the charter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub policy_id: PolicyId,
    /// Index of the first action that was NOT rolled back; everything at
    /// and above it up to the applied prefix was undone in reverse order
    pub rolled_back_to: usize,
    pub rolled_back_at: DateTime<Utc>,
}

/// Charter-side state of a policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharterPolicyState {
    Submitted,
    Active,
    RolledBack,
    Superseded,
    Unknown,
}

/// The charter's native action vocabulary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharterAction {
    pub verb: String,
    pub target: String,
    pub parameters: HashMap<String, serde_json::Value>,
}

impl From<&RemediationAction> for CharterAction {
    fn from(action: &RemediationAction) -> Self {
        CharterAction {
            verb: action.action_type.as_str().to_string(),
            target: action.target.clone(),
            parameters: action.parameters.clone(),
        }
    }
}

/// Write access to the charter service
#[async_trait]
pub trait CharterApi: Send + Sync {
    /// Submit a policy. Fails with `Conflict` when a superseding policy is
    /// already active.
    async fn submit(&self, policy: &RemediationPolicy) -> Result<PolicyHandle>;

    /// Activate a single action of a submitted policy
    async fn activate(
        &self,
        handle: &PolicyHandle,
        action_index: usize,
        action: &RemediationAction,
    ) -> Result<ActivationRecord>;

    /// Roll back every applied action with index >= `up_to_action_index`,
    /// in reverse order
    async fn rollback(
        &self,
        handle: &PolicyHandle,
        up_to_action_index: usize,
    ) -> Result<RollbackRecord>;

    /// Read the charter-side state of a policy
    async fn status(&self, handle: &PolicyHandle) -> Result<CharterPolicyState>;
}

/// HTTP implementation of [`CharterApi`]
pub struct CharterClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    policy_id: PolicyId,
    priority: &'a str,
    actions: Vec<CharterAction>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    charter_ref: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    state: CharterPolicyState,
}

impl CharterClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("meshguard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn map_transport(e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(format!("charter: {}", e))
        } else {
            Error::Unavailable(format!("charter: {}", e))
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        match response.status() {
            StatusCode::CONFLICT => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::Conflict(body))
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                Err(Error::Timeout("charter deadline exceeded".into()))
            }
            status if status.is_client_error() => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::PermanentFailure(format!(
                    "charter rejected request ({}): {}",
                    status, body
                )))
            }
            status if status.is_server_error() => Err(Error::Unavailable(format!(
                "charter answered {}",
                status
            ))),
            _ => Ok(response),
        }
    }
}

#[async_trait]
impl CharterApi for CharterClient {
    async fn submit(&self, policy: &RemediationPolicy) -> Result<PolicyHandle> {
        let url = format!("{}/policies", self.base_url);
        let body = SubmitRequest {
            policy_id: policy.policy_id,
            priority: match policy.priority {
                meshguard_common::types::PolicyPriority::Critical => "critical",
                meshguard_common::types::PolicyPriority::High => "high",
                meshguard_common::types::PolicyPriority::Medium => "medium",
                meshguard_common::types::PolicyPriority::Low => "low",
            },
            actions: policy.actions.iter().map(CharterAction::from).collect(),
        };

        debug!(policy_id = %policy.policy_id, "submitting policy to charter");
        let response = self
            .client
            .post(&url)
            .header("Idempotency-Key", policy.policy_id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(Self::map_transport)?;
        let response = Self::check_status(response).await?;

        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| Error::Integrity(format!("malformed charter response: {}", e)))?;

        Ok(PolicyHandle {
            policy_id: policy.policy_id,
            charter_ref: parsed.charter_ref,
        })
    }

    async fn activate(
        &self,
        handle: &PolicyHandle,
        action_index: usize,
        action: &RemediationAction,
    ) -> Result<ActivationRecord> {
        let url = format!("{}/policies/{}/activate", self.base_url, handle.policy_id);
        let response = self
            .client
            .post(&url)
            .header("Idempotency-Key", format!("{}:{}", handle.policy_id, action_index))
            .json(&serde_json::json!({
                "action_index": action_index,
                "action": CharterAction::from(action),
            }))
            .send()
            .await
            .map_err(Self::map_transport)?;
        Self::check_status(response).await?;

        Ok(ActivationRecord {
            policy_id: handle.policy_id,
            action_index,
            activated_at: Utc::now(),
        })
    }

    async fn rollback(
        &self,
        handle: &PolicyHandle,
        up_to_action_index: usize,
    ) -> Result<RollbackRecord> {
        let url = format!(
            "{}/policies/{}/rollback?upTo={}",
            self.base_url, handle.policy_id, up_to_action_index
        );
        warn!(
            policy_id = %handle.policy_id,
            up_to = up_to_action_index,
            "requesting charter rollback"
        );
        let response = self
            .client
            .post(&url)
            .header("Idempotency-Key", format!("{}:rollback", handle.policy_id))
            .send()
            .await
            .map_err(Self::map_transport)?;
        Self::check_status(response).await?;

        Ok(RollbackRecord {
            policy_id: handle.policy_id,
            rolled_back_to: up_to_action_index,
            rolled_back_at: Utc::now(),
        })
    }

    async fn status(&self, handle: &PolicyHandle) -> Result<CharterPolicyState> {
        let url = format!("{}/policies/{}", self.base_url, handle.policy_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Self::map_transport)?;
        let response = Self::check_status(response).await?;

        let parsed: StatusResponse = response
            .json()
            .await
            .map_err(|e| Error::Integrity(format!("malformed charter response: {}", e)))?;
        Ok(parsed.state)
    }
}
