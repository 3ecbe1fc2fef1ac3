//! Role resolution.
//!
//! The reconciler needs to know which organization a user is billed through:
//! the one where the user holds the Member role. Roles live in an external
//! service reached over HTTP; tests use `StaticRoleResolver`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sourcing_core::{CompanyId, UserId};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Role of a user within a company.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompanyRole {
    CompanyOwner,
    MemberAdmin,
    Member,
    DataUploader,
}

/// One role assignment as returned by the role service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyRoleAssignment {
    pub company_role: CompanyRole,
    pub company_id: CompanyId,
    pub user_id: UserId,
}

/// Errors from role resolution. All of them are worth a retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoleError {
    #[error("role service unreachable: {0}")]
    Unreachable(String),

    #[error("role service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid role service response: {0}")]
    InvalidResponse(String),
}

/// Organizations a user has roles in.
pub type RolesByCompany = HashMap<CompanyId, HashSet<CompanyRole>>;

#[async_trait]
pub trait RoleResolver: Send + Sync {
    async fn resolve_roles(&self, user_id: UserId) -> Result<RolesByCompany, RoleError>;
}

/// The organization `user_id` is billed through, if any.
///
/// A user with Member role in several organizations is billed through the
/// one with the smallest id, so repeated resolutions agree.
pub async fn member_organization(
    resolver: &dyn RoleResolver,
    user_id: UserId,
) -> Result<Option<CompanyId>, RoleError> {
    let roles = resolver.resolve_roles(user_id).await?;
    let mut members: Vec<CompanyId> = roles
        .into_iter()
        .filter(|(_, roles)| roles.contains(&CompanyRole::Member))
        .map(|(company, _)| company)
        .collect();
    members.sort();

    if members.len() > 1 {
        warn!(
            "User {} is member of {} organizations, billing {}",
            user_id,
            members.len(),
            members[0]
        );
    }
    Ok(members.first().copied())
}

fn group_assignments(assignments: Vec<CompanyRoleAssignment>) -> RolesByCompany {
    let mut roles = RolesByCompany::new();
    for assignment in assignments {
        roles
            .entry(assignment.company_id)
            .or_default()
            .insert(assignment.company_role);
    }
    roles
}

// =============================================================================
// HTTP resolver
// =============================================================================

/// Resolver backed by the role service's `company-role-assignments` endpoint.
#[derive(Clone)]
pub struct HttpRoleResolver {
    client: Client,
    base_url: String,
}

impl HttpRoleResolver {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RoleError> {
        let client = Client::builder()
            .user_agent(concat!("sourcing-server/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RoleError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RoleResolver for HttpRoleResolver {
    async fn resolve_roles(&self, user_id: UserId) -> Result<RolesByCompany, RoleError> {
        let url = format!("{}/company-role-assignments", self.base_url);
        debug!("Resolving roles of user {}", user_id);

        let response = self
            .client
            .get(&url)
            .query(&[("userId", user_id.to_string())])
            .send()
            .await
            .map_err(|e| RoleError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Role lookup for user {} failed: {} - {}", user_id, status, body);
            return Err(RoleError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let assignments: Vec<CompanyRoleAssignment> = response
            .json()
            .await
            .map_err(|e| RoleError::InvalidResponse(e.to_string()))?;
        Ok(group_assignments(assignments))
    }
}

// =============================================================================
// Static resolver
// =============================================================================

/// Deterministic in-process resolver.
#[derive(Default)]
pub struct StaticRoleResolver {
    assignments: RwLock<BTreeMap<UserId, Vec<(CompanyId, CompanyRole)>>>,
    unavailable: RwLock<bool>,
}

impl StaticRoleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn assign(&self, user_id: UserId, company_id: CompanyId, role: CompanyRole) {
        self.assignments
            .write()
            .await
            .entry(user_id)
            .or_default()
            .push((company_id, role));
    }

    /// Make every lookup fail with `RoleError::Unreachable`.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }
}

#[async_trait]
impl RoleResolver for StaticRoleResolver {
    async fn resolve_roles(&self, user_id: UserId) -> Result<RolesByCompany, RoleError> {
        if *self.unavailable.read().await {
            return Err(RoleError::Unreachable("role service is down".to_string()));
        }
        let assignments = self.assignments.read().await;
        Ok(group_assignments(
            assignments
                .get(&user_id)
                .into_iter()
                .flatten()
                .map(|(company_id, role)| CompanyRoleAssignment {
                    company_role: *role,
                    company_id: *company_id,
                    user_id,
                })
                .collect(),
        ))
    }
}
