use crate::ingest::truncate;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Longest slice of a response body kept in error messages
const ERROR_BODY_LIMIT: usize = 500;

/// Error from a config API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Connection, DNS or timeout failure; no response was received
    Transport(String),
    /// Non-success HTTP response
    Status { status: u16, body: String },
    /// Success response whose body could not be interpreted
    Malformed(String),
}

impl ApiError {
    /// Create rejected because a resource with that name already exists.
    ///
    /// 409 always counts; some versions answer 400 with an "already exists" message.
    pub fn is_conflict(&self) -> bool {
        match self {
            ApiError::Status { status: 409, .. } => true,
            ApiError::Status { status: 400, body } => {
                body.to_ascii_lowercase().contains("already exists")
            }
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Transport(reason) => write!(f, "request failed: {}", reason),
            ApiError::Status { status, body } if *status == 401 || *status == 403 => {
                write!(f, "credential rejected (HTTP {}): {}", status, body)
            }
            ApiError::Status { status, body } => write!(f, "HTTP {}: {}", status, body),
            ApiError::Malformed(reason) => write!(f, "malformed response: {}", reason),
        }
    }
}

impl std::error::Error for ApiError {}

/// A named remote resource (org, project, table or transform).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub name: String,
}

impl Resource {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
        }
    }
}

/// Config API operations the provisioning orchestrator depends on.
#[async_trait]
pub trait ProvisioningApi: Send + Sync {
    /// Orgs visible to the credential. Doubles as the credential check.
    async fn list_orgs(&self) -> Result<Vec<Resource>, ApiError>;

    async fn list_projects(&self, org_id: &str) -> Result<Vec<Resource>, ApiError>;

    async fn create_project(&self, org_id: &str, name: &str) -> Result<Resource, ApiError>;

    async fn list_tables(&self, org_id: &str, project_id: &str)
        -> Result<Vec<Resource>, ApiError>;

    async fn create_table(
        &self,
        org_id: &str,
        project_id: &str,
        name: &str,
    ) -> Result<Resource, ApiError>;

    async fn list_transforms(
        &self,
        org_id: &str,
        project_id: &str,
        table_id: &str,
    ) -> Result<Vec<Resource>, ApiError>;

    async fn create_transform(
        &self,
        org_id: &str,
        project_id: &str,
        table_id: &str,
        body: &Value,
    ) -> Result<Resource, ApiError>;
}

/// HTTP client for the cluster's `/config/v1` REST API.
pub struct ConfigApiClient {
    http_client: Client,
    base_url: String,
    token: String,
}

impl ConfigApiClient {
    /// Create a client for `host`, using https unless `use_ssl` is false.
    pub fn new(host: &str, token: impl Into<String>, use_ssl: bool, timeout: Duration) -> Result<Self> {
        let scheme = if use_ssl { "https" } else { "http" };
        Self::with_base_url(format!("{}://{}", scheme, host), token, timeout)
    }

    /// Create a client with a custom base URL (for testing with a mock server).
    pub fn with_base_url(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent("hydrolix-history/0.1")
            .timeout(timeout)
            .build()
            .context("Failed to build config API HTTP client")?;

        Ok(Self {
            http_client,
            base_url: format!("{}/config/v1", base_url.into().trim_end_matches('/')),
            token: token.into(),
        })
    }

    async fn get(&self, path: &str) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Config API GET");

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        read_body(response).await
    }

    async fn post(&self, path: &str, payload: &Value) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Config API POST");

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        read_body(response).await
    }
}

#[async_trait]
impl ProvisioningApi for ConfigApiClient {
    async fn list_orgs(&self) -> Result<Vec<Resource>, ApiError> {
        let body = self.get("/orgs/").await?;
        Ok(resources(unwrap_list(body)))
    }

    async fn list_projects(&self, org_id: &str) -> Result<Vec<Resource>, ApiError> {
        let body = self.get(&format!("/orgs/{}/projects/", org_id)).await?;
        Ok(resources(unwrap_list(body)))
    }

    async fn create_project(&self, org_id: &str, name: &str) -> Result<Resource, ApiError> {
        let body = self
            .post(
                &format!("/orgs/{}/projects/", org_id),
                &super::schema::project_body(name),
            )
            .await?;
        resource(unwrap_single(body))
    }

    async fn list_tables(
        &self,
        org_id: &str,
        project_id: &str,
    ) -> Result<Vec<Resource>, ApiError> {
        let body = self
            .get(&format!("/orgs/{}/projects/{}/tables/", org_id, project_id))
            .await?;
        Ok(resources(unwrap_list(body)))
    }

    async fn create_table(
        &self,
        org_id: &str,
        project_id: &str,
        name: &str,
    ) -> Result<Resource, ApiError> {
        let body = self
            .post(
                &format!("/orgs/{}/projects/{}/tables/", org_id, project_id),
                &super::schema::table_body(name),
            )
            .await?;
        resource(unwrap_single(body))
    }

    async fn list_transforms(
        &self,
        org_id: &str,
        project_id: &str,
        table_id: &str,
    ) -> Result<Vec<Resource>, ApiError> {
        let body = self
            .get(&format!(
                "/orgs/{}/projects/{}/tables/{}/transforms/",
                org_id, project_id, table_id
            ))
            .await?;
        Ok(resources(unwrap_list(body)))
    }

    async fn create_transform(
        &self,
        org_id: &str,
        project_id: &str,
        table_id: &str,
        body: &Value,
    ) -> Result<Resource, ApiError> {
        let response = self
            .post(
                &format!(
                    "/orgs/{}/projects/{}/tables/{}/transforms/",
                    org_id, project_id, table_id
                ),
                body,
            )
            .await?;
        resource(unwrap_single(response))
    }
}

async fn read_body(response: reqwest::Response) -> Result<Value, ApiError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| ApiError::Transport(e.to_string()))?;

    if !status.is_success() {
        return Err(ApiError::Status {
            status: status.as_u16(),
            body: truncate(&text, ERROR_BODY_LIMIT).to_string(),
        });
    }

    if text.trim().is_empty() || status == StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }

    serde_json::from_str(&text)
        .map_err(|e| ApiError::Malformed(format!("invalid JSON ({}): {}", e, truncate(&text, 200))))
}

/// Normalize a list response: paginated `{"results": [...]}`, bare array,
/// or a single object.
pub fn unwrap_list(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) => items,
            Some(_) => Vec::new(),
            None => vec![Value::Object(map)],
        },
        _ => Vec::new(),
    }
}

/// Normalize a create response: bare object, one-element array, or paginated.
pub fn unwrap_single(body: Value) -> Option<Value> {
    match body {
        Value::Array(items) => items.into_iter().next(),
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) if !items.is_empty() => items.into_iter().next(),
            Some(other) => {
                map.insert("results".to_string(), other);
                Some(Value::Object(map))
            }
            None => Some(Value::Object(map)),
        },
        _ => None,
    }
}

fn resources(items: Vec<Value>) -> Vec<Resource> {
    items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect()
}

fn resource(item: Option<Value>) -> Result<Resource, ApiError> {
    let item = item.ok_or_else(|| ApiError::Malformed("empty create response".to_string()))?;
    let parsed: Resource = serde_json::from_value(item.clone())
        .map_err(|e| ApiError::Malformed(format!("unexpected create response: {}", e)))?;

    if parsed.uuid.is_empty() {
        return Err(ApiError::Malformed(format!(
            "create response has no uuid: {}",
            truncate(&item.to_string(), 200)
        )));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn client(server: &Server) -> ConfigApiClient {
        ConfigApiClient::with_base_url(server.url(), "test_token", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_list_orgs_paginated() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/config/v1/orgs/")
            .match_header("authorization", "Bearer test_token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "count": 1,
                    "next": null,
                    "previous": null,
                    "results": [{"uuid": "org-1", "name": "acme"}]
                }"#,
            )
            .create_async()
            .await;

        let orgs = client(&server).list_orgs().await.unwrap();
        assert_eq!(orgs, vec![Resource::new("org-1", "acme")]);
    }

    #[tokio::test]
    async fn test_list_projects_bare_array() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/config/v1/orgs/org-1/projects/")
            .with_status(200)
            .with_body(
                r#"[
                    {"uuid": "p-1", "name": "homeassistant", "description": "x"},
                    {"uuid": "p-2", "name": "other"}
                ]"#,
            )
            .create_async()
            .await;

        let projects = client(&server).list_projects("org-1").await.unwrap();
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].uuid, "p-1");
        assert_eq!(projects[1].name, "other");
    }

    #[tokio::test]
    async fn test_create_table_sends_settings() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/config/v1/orgs/org-1/projects/p-1/tables/")
            .match_header("content-type", "application/json")
            .match_body(Matcher::PartialJson(json!({
                "name": "state_history",
                "settings": { "sort_keys": ["entity_id"] }
            })))
            .with_status(201)
            .with_body(r#"[{"uuid": "t-1", "name": "state_history"}]"#)
            .create_async()
            .await;

        let table = client(&server)
            .create_table("org-1", "p-1", "state_history")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(table, Resource::new("t-1", "state_history"));
    }

    #[tokio::test]
    async fn test_create_conflict_detected() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/config/v1/orgs/org-1/projects/")
            .with_status(400)
            .with_body(r#"{"name": ["project with this name already exists."]}"#)
            .create_async()
            .await;

        let err = client(&server)
            .create_project("org-1", "homeassistant")
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(400));
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/config/v1/orgs/")
            .with_status(401)
            .with_body(r#"{"detail": "Invalid token."}"#)
            .create_async()
            .await;

        let err = client(&server).list_orgs().await.unwrap_err();
        assert!(!err.is_conflict());
        assert!(err.to_string().contains("credential rejected"));
        assert!(err.to_string().contains("Invalid token."));
    }

    #[tokio::test]
    async fn test_create_without_uuid_is_malformed() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/config/v1/orgs/org-1/projects/")
            .with_status(201)
            .with_body(r#"{"name": "homeassistant"}"#)
            .create_async()
            .await;

        let err = client(&server)
            .create_project("org-1", "homeassistant")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_invalid_json_is_malformed() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/config/v1/orgs/")
            .with_status(200)
            .with_body("<html>gateway</html>")
            .create_async()
            .await;

        let err = client(&server).list_orgs().await.unwrap_err();
        assert!(matches!(err, ApiError::Malformed(_)));
    }

    #[test]
    fn test_unwrap_list_shapes() {
        assert_eq!(unwrap_list(json!([{"uuid": "a"}])).len(), 1);
        assert_eq!(unwrap_list(json!({"results": [{"uuid": "a"}, {"uuid": "b"}]})).len(), 2);
        assert_eq!(unwrap_list(json!({"uuid": "a"})), vec![json!({"uuid": "a"})]);
        assert!(unwrap_list(json!(null)).is_empty());
        assert!(unwrap_list(json!("text")).is_empty());
    }

    #[test]
    fn test_unwrap_single_shapes() {
        assert_eq!(unwrap_single(json!({"uuid": "a"})), Some(json!({"uuid": "a"})));
        assert_eq!(unwrap_single(json!([{"uuid": "b"}])), Some(json!({"uuid": "b"})));
        assert_eq!(
            unwrap_single(json!({"results": [{"uuid": "c"}]})),
            Some(json!({"uuid": "c"}))
        );
        assert_eq!(unwrap_single(json!([])), None);
        assert_eq!(unwrap_single(json!(null)), None);
    }

    #[test]
    fn test_conflict_detection() {
        let conflict = ApiError::Status {
            status: 409,
            body: String::new(),
        };
        let duplicate = ApiError::Status {
            status: 400,
            body: "Table Already Exists".to_string(),
        };
        let invalid = ApiError::Status {
            status: 400,
            body: "name: invalid characters".to_string(),
        };

        assert!(conflict.is_conflict());
        assert!(duplicate.is_conflict());
        assert!(!invalid.is_conflict());
        assert!(!ApiError::Transport("refused".into()).is_conflict());
    }
}
