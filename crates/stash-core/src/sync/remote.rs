//! Remote API boundary
//!
//! The remote CRUD service is an external collaborator consumed
//! through the [`RemoteApi`] trait so the engine can be exercised
//! against a fake. [`HttpRemote`] is the production implementation.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use thiserror::Error;

use crate::models::{Entity, EntityId, EntityKind, WorkspaceId};

/// Failure taxonomy of the remote boundary.
///
/// The engine maps each variant to a different queue transition:
/// transient failures retry with backoff, auth pauses the drain
/// without a retry bump, not-found converges local state, validation
/// parks immediately, and a duplicate create is success.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// 401: authentication is required before any further drains
    #[error("Authentication required")]
    AuthRequired,

    /// 404 on update/delete: the remote copy no longer exists
    #[error("Remote entity not found")]
    NotFound,

    /// 409 on create: the entity already exists remotely (a retried
    /// create whose first response was lost); carries the canonical
    /// remote copy
    #[error("Entity already exists remotely")]
    AlreadyExists(RemoteEntity),

    /// Other 4xx: the payload was rejected, retrying cannot help
    #[error("Validation rejected ({status}): {detail}")]
    Validation { status: u16, detail: String },

    /// 5xx / transport error: worth retrying with backoff
    #[error("Transient remote failure: {0}")]
    Transient(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        Self::Transient(error.to_string())
    }
}

/// An entity as the remote service represents it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub id: String,
    pub kind: EntityKind,
    pub payload: serde_json::Value,
    /// Server-authoritative LWW timestamp (Unix ms)
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteEntity {
    /// Build the request body for a local entity
    #[must_use]
    pub fn from_entity(entity: &Entity) -> Self {
        Self {
            id: entity.id.to_string(),
            kind: entity.kind,
            payload: entity.payload.clone(),
            updated_at: entity.updated_at,
            deleted: entity.deleted,
        }
    }

    /// Interpret this remote copy as a local entity in `workspace`
    #[must_use]
    pub fn into_entity(self, workspace: &WorkspaceId) -> Entity {
        Entity {
            id: EntityId::new(self.id),
            workspace: workspace.clone(),
            kind: self.kind,
            payload: self.payload,
            updated_at: self.updated_at,
            deleted: self.deleted,
            locally_modified: false,
            locally_created: false,
            server_version: Some(self.updated_at),
        }
    }
}

/// A page of remote changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Server time of the batch (Unix ms); the next `since` cursor.
    /// Server time, not client clock, to avoid clock-skew bugs.
    pub server_time: i64,
    pub entities: Vec<RemoteEntity>,
}

/// The remote CRUD API consumed by the sync engine
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Fetch entities changed since the given server timestamp
    async fn changes_since(
        &self,
        workspace: &WorkspaceId,
        since: i64,
    ) -> Result<ChangeBatch, RemoteError>;

    /// Lightweight probe: has anything changed since `since`?
    async fn probe(&self, workspace: &WorkspaceId, since: i64) -> Result<bool, RemoteError>;

    /// Create an entity. `idempotency_key` lets the server deduplicate
    /// a retried create. Returns the canonical entity, whose id may
    /// differ from the client-generated one.
    async fn create(
        &self,
        workspace: &WorkspaceId,
        entity: &RemoteEntity,
        idempotency_key: &str,
    ) -> Result<RemoteEntity, RemoteError>;

    /// Update an entity; returns the canonical entity
    async fn update(
        &self,
        workspace: &WorkspaceId,
        entity: &RemoteEntity,
    ) -> Result<RemoteEntity, RemoteError>;

    /// Delete an entity
    async fn delete(
        &self,
        workspace: &WorkspaceId,
        kind: EntityKind,
        id: &str,
    ) -> Result<(), RemoteError>;
}

/// HTTP implementation of [`RemoteApi`]
pub struct HttpRemote {
    base_url: String,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemote")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RemoteError> {
        let base_url = normalize_base_url(base_url.into())?;
        Ok(Self {
            base_url,
            client: reqwest::Client::builder().build()?,
            token: RwLock::new(None),
        })
    }

    /// Install or replace the bearer token. Auth itself is an external
    /// collaborator; the engine only needs the credential.
    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut slot) = self.token.write() {
            *slot = token;
        }
    }

    fn workspace_url(&self, workspace: &WorkspaceId, suffix: &str) -> String {
        format!(
            "{}/v1/workspaces/{}/{suffix}",
            self.base_url,
            workspace.as_str()
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.read().ok().and_then(|token| token.clone()) {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Map a non-success response to the failure taxonomy
    async fn classify_failure(response: reqwest::Response) -> RemoteError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED => RemoteError::AuthRequired,
            StatusCode::NOT_FOUND => RemoteError::NotFound,
            StatusCode::CONFLICT => match serde_json::from_str::<RemoteEntity>(&body) {
                Ok(existing) => RemoteError::AlreadyExists(existing),
                Err(_) => RemoteError::Validation {
                    status: status.as_u16(),
                    detail: body,
                },
            },
            other if other.is_client_error() => RemoteError::Validation {
                status: other.as_u16(),
                detail: body,
            },
            other => RemoteError::Transient(format!("HTTP {}", other.as_u16())),
        }
    }

    async fn entity_response(response: reqwest::Response) -> Result<RemoteEntity, RemoteError> {
        if response.status().is_success() {
            Ok(response.json::<RemoteEntity>().await?)
        } else {
            Err(Self::classify_failure(response).await)
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn changes_since(
        &self,
        workspace: &WorkspaceId,
        since: i64,
    ) -> Result<ChangeBatch, RemoteError> {
        let url = self.workspace_url(workspace, "changes");
        let response = self
            .authorize(self.client.get(url).query(&[("since", since)]))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response.json::<ChangeBatch>().await?)
        } else {
            Err(Self::classify_failure(response).await)
        }
    }

    async fn probe(&self, workspace: &WorkspaceId, since: i64) -> Result<bool, RemoteError> {
        #[derive(Deserialize)]
        struct ProbeResponse {
            changed: bool,
        }

        let url = self.workspace_url(workspace, "changes/head");
        let response = self
            .authorize(self.client.get(url).query(&[("since", since)]))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response.json::<ProbeResponse>().await?.changed)
        } else {
            Err(Self::classify_failure(response).await)
        }
    }

    async fn create(
        &self,
        workspace: &WorkspaceId,
        entity: &RemoteEntity,
        idempotency_key: &str,
    ) -> Result<RemoteEntity, RemoteError> {
        let url = self.workspace_url(workspace, &format!("{}s", entity.kind));
        let response = self
            .authorize(
                self.client
                    .post(url)
                    .header("Idempotency-Key", idempotency_key)
                    .json(entity),
            )
            .send()
            .await?;
        Self::entity_response(response).await
    }

    async fn update(
        &self,
        workspace: &WorkspaceId,
        entity: &RemoteEntity,
    ) -> Result<RemoteEntity, RemoteError> {
        let url = self.workspace_url(workspace, &format!("{}s/{}", entity.kind, entity.id));
        let response = self
            .authorize(self.client.patch(url).json(entity))
            .send()
            .await?;
        Self::entity_response(response).await
    }

    async fn delete(
        &self,
        workspace: &WorkspaceId,
        kind: EntityKind,
        id: &str,
    ) -> Result<(), RemoteError> {
        let url = self.workspace_url(workspace, &format!("{kind}s/{id}"));
        let response = self.authorize(self.client.delete(url)).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::classify_failure(response).await)
        }
    }
}

fn normalize_base_url(raw: String) -> Result<String, RemoteError> {
    let trimmed = raw.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.trim_end_matches('/').to_string())
    } else {
        Err(RemoteError::Validation {
            status: 0,
            detail: "base URL must include http:// or https://".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("https://api.example.com/".to_string()).unwrap(),
            "https://api.example.com"
        );
        assert!(normalize_base_url("api.example.com".to_string()).is_err());
    }

    #[test]
    fn test_http_remote_debug_redacts_token() {
        let remote = HttpRemote::new("https://api.example.com").unwrap();
        remote.set_token(Some("secret".to_string()));
        let debug = format!("{remote:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_remote_entity_round_trip_local_view() {
        let workspace = WorkspaceId::from("ws-1");
        let remote = RemoteEntity {
            id: "srv-1".to_string(),
            kind: EntityKind::Card,
            payload: serde_json::json!({ "title": "t" }),
            updated_at: 99,
            deleted: false,
        };

        let entity = remote.clone().into_entity(&workspace);
        assert_eq!(entity.id.as_str(), "srv-1");
        assert_eq!(entity.server_version, Some(99));
        assert!(!entity.locally_modified);
        assert_eq!(RemoteEntity::from_entity(&entity), remote);
    }
}
