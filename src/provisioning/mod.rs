//! One-time setup of the remote resources history is shipped into.
//!
//! `Orchestrator::run` walks org → project → table → transform strictly in
//! order. Every stage lists before it creates and never updates or deletes,
//! so a full rerun after any failure is safe and converges without
//! duplicates.

use crate::ingest::IngestTarget;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub mod api;
pub mod schema;


pub use api::{ApiError, ConfigApiClient, ProvisioningApi, Resource};
pub use schema::TRANSFORM_NAME;

/// Provisioning stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    VerifyCredential,
    ResolveProject,
    ResolveTable,
    EnsureTransform,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::VerifyCredential => "VERIFY_CREDENTIAL",
            Stage::ResolveProject => "RESOLVE_PROJECT",
            Stage::ResolveTable => "RESOLVE_TABLE",
            Stage::EnsureTransform => "ENSURE_TRANSFORM",
        };
        f.write_str(name)
    }
}

/// Setup failed at `stage`. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningError {
    pub stage: Stage,
    pub reason: String,
    /// Shutdown was requested before `stage` started
    pub cancelled: bool,
}

impl ProvisioningError {
    fn new(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
            cancelled: false,
        }
    }

    fn cancelled(stage: Stage) -> Self {
        Self {
            stage,
            reason: "shutdown requested".to_string(),
            cancelled: true,
        }
    }
}

impl fmt::Display for ProvisioningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.reason)
    }
}

impl std::error::Error for ProvisioningError {}

/// How the operator chose a project or table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceChoice {
    /// Use a resource picked from a listing; no round trip
    Existing { id: String, name: String },
    /// Find by name or create it
    Create { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningRequest {
    pub project: ResourceChoice,
    pub table: ResourceChoice,
}

impl Default for ProvisioningRequest {
    fn default() -> Self {
        Self {
            project: ResourceChoice::Create {
                name: schema::DEFAULT_PROJECT.to_string(),
            },
            table: ResourceChoice::Create {
                name: schema::DEFAULT_TABLE.to_string(),
            },
        }
    }
}

/// Identifiers produced by a successful run. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningState {
    pub org_id: String,
    pub project_id: String,
    pub project_name: String,
    pub table_id: String,
    pub table_name: String,
    pub transform_name: String,
}

impl ProvisioningState {
    /// Coordinates the ingest client posts to.
    pub fn ingest_target(&self) -> IngestTarget {
        IngestTarget {
            project: self.project_name.clone(),
            table: self.table_name.clone(),
            transform: self.transform_name.clone(),
        }
    }
}

/// Where a project or table lives.
enum Scope<'a> {
    Projects { org_id: &'a str },
    Tables { org_id: &'a str, project_id: &'a str },
}

impl Scope<'_> {
    fn stage(&self) -> Stage {
        match self {
            Scope::Projects { .. } => Stage::ResolveProject,
            Scope::Tables { .. } => Stage::ResolveTable,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Scope::Projects { .. } => "project",
            Scope::Tables { .. } => "table",
        }
    }
}

/// Sequential provisioning state machine over a config API.
pub struct Orchestrator<A> {
    api: A,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<A: ProvisioningApi> Orchestrator<A> {
    pub fn new(api: A) -> Self {
        Self { api, shutdown: None }
    }

    /// Stop at the next stage boundary once `shutdown` turns true.
    ///
    /// A stage already in flight always finishes its round trips.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Run every stage once and return the completed state.
    ///
    /// Stops at the first failing stage; nothing is rolled back because
    /// nothing destructive was done.
    pub async fn run(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningState, ProvisioningError> {
        info!("Provisioning started");

        self.checkpoint(Stage::VerifyCredential)?;
        let org_id = self.verify_credential().await?;

        self.checkpoint(Stage::ResolveProject)?;
        let project = self
            .resolve(Scope::Projects { org_id: &org_id }, &request.project)
            .await?;

        self.checkpoint(Stage::ResolveTable)?;
        let table = self
            .resolve(
                Scope::Tables {
                    org_id: &org_id,
                    project_id: &project.uuid,
                },
                &request.table,
            )
            .await?;

        self.checkpoint(Stage::EnsureTransform)?;
        self.ensure_transform(&org_id, &project.uuid, &table.uuid)
            .await?;

        let state = ProvisioningState {
            org_id,
            project_id: project.uuid,
            project_name: project.name,
            table_id: table.uuid,
            table_name: table.name,
            transform_name: TRANSFORM_NAME.to_string(),
        };

        info!(
            org_id = %state.org_id,
            project = %state.project_name,
            table = %state.table_name,
            transform = %state.transform_name,
            "Provisioning complete"
        );
        Ok(state)
    }

    fn checkpoint(&self, next: Stage) -> Result<(), ProvisioningError> {
        match &self.shutdown {
            Some(rx) if *rx.borrow() => {
                info!(stage = %next, "Provisioning stopped for shutdown");
                Err(ProvisioningError::cancelled(next))
            }
            _ => Ok(()),
        }
    }

    async fn verify_credential(&self) -> Result<String, ProvisioningError> {
        let stage = Stage::VerifyCredential;

        let orgs = self
            .api
            .list_orgs()
            .await
            .map_err(|e| ProvisioningError::new(stage, e.to_string()))?;

        let org = orgs
            .into_iter()
            .find(|org| !org.uuid.is_empty())
            .ok_or_else(|| {
                ProvisioningError::new(stage, "no organization visible to this credential")
            })?;

        debug!(org_id = %org.uuid, org_name = %org.name, "Credential verified");
        Ok(org.uuid)
    }

    async fn resolve(
        &self,
        scope: Scope<'_>,
        choice: &ResourceChoice,
    ) -> Result<Resource, ProvisioningError> {
        let stage = scope.stage();
        let kind = scope.kind();

        let name = match choice {
            ResourceChoice::Existing { id, name } => {
                if id.is_empty() {
                    return Err(ProvisioningError::new(
                        stage,
                        format!("selected {} '{}' has no id", kind, name),
                    ));
                }
                debug!(kind = kind, id = %id, name = %name, "Using selected resource");
                return Ok(Resource::new(id.as_str(), name.as_str()));
            }
            ResourceChoice::Create { name } => name,
        };

        if name.is_empty() {
            return Err(ProvisioningError::new(
                stage,
                format!("{} name must not be empty", kind),
            ));
        }

        let existing = self
            .list(&scope)
            .await
            .map_err(|e| ProvisioningError::new(stage, format!("failed to list {}s: {}", kind, e)))?;

        if let Some(found) = find_named(existing, name) {
            info!(kind = kind, name = %name, id = %found.uuid, "Reusing existing resource");
            return Ok(found);
        }

        match self.create(&scope, name).await {
            Ok(created) => {
                info!(kind = kind, name = %name, id = %created.uuid, "Created resource");
                Ok(Resource::new(created.uuid, name.as_str()))
            }
            Err(e) if e.is_conflict() => {
                // Someone else created it between our list and create
                warn!(kind = kind, name = %name, error = %e, "Name collision, resolving by name");

                let existing = self.list(&scope).await.map_err(|le| {
                    ProvisioningError::new(stage, format!("failed to list {}s: {}", kind, le))
                })?;

                find_named(existing, name).ok_or_else(|| {
                    ProvisioningError::new(
                        stage,
                        format!("name collision on {} '{}' could not be resolved: {}", kind, name, e),
                    )
                })
            }
            Err(e) => Err(ProvisioningError::new(
                stage,
                format!("failed to create {} '{}': {}", kind, name, e),
            )),
        }
    }

    async fn list(&self, scope: &Scope<'_>) -> Result<Vec<Resource>, ApiError> {
        match scope {
            Scope::Projects { org_id } => self.api.list_projects(org_id).await,
            Scope::Tables { org_id, project_id } => self.api.list_tables(org_id, project_id).await,
        }
    }

    async fn create(&self, scope: &Scope<'_>, name: &str) -> Result<Resource, ApiError> {
        match scope {
            Scope::Projects { org_id } => self.api.create_project(org_id, name).await,
            Scope::Tables { org_id, project_id } => {
                self.api.create_table(org_id, project_id, name).await
            }
        }
    }

    async fn ensure_transform(
        &self,
        org_id: &str,
        project_id: &str,
        table_id: &str,
    ) -> Result<(), ProvisioningError> {
        let stage = Stage::EnsureTransform;

        let existing = self
            .api
            .list_transforms(org_id, project_id, table_id)
            .await
            .map_err(|e| ProvisioningError::new(stage, format!("failed to list transforms: {}", e)))?;

        if has_transform(&existing) {
            debug!(transform = TRANSFORM_NAME, "Transform already present");
            return Ok(());
        }

        match self
            .api
            .create_transform(org_id, project_id, table_id, &schema::transform_body())
            .await
        {
            Ok(_) => {
                info!(transform = TRANSFORM_NAME, table_id = %table_id, "Created transform");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                let existing = self
                    .api
                    .list_transforms(org_id, project_id, table_id)
                    .await
                    .map_err(|le| {
                        ProvisioningError::new(stage, format!("failed to list transforms: {}", le))
                    })?;

                if has_transform(&existing) {
                    Ok(())
                } else {
                    Err(ProvisioningError::new(
                        stage,
                        format!("transform '{}' conflicts but is not listed: {}", TRANSFORM_NAME, e),
                    ))
                }
            }
            Err(e) => Err(ProvisioningError::new(
                stage,
                format!("failed to create transform '{}': {}", TRANSFORM_NAME, e),
            )),
        }
    }
}

fn find_named(resources: Vec<Resource>, name: &str) -> Option<Resource> {
    resources
        .into_iter()
        .find(|r| r.name == name && !r.uuid.is_empty())
}

fn has_transform(transforms: &[Resource]) -> bool {
    transforms.iter().any(|t| t.name == TRANSFORM_NAME)
}
