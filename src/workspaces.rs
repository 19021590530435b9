use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::billing::models::MemberRole;
use crate::billing::store::WorkspaceStore;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

/// key: workspace-membership-guard -> caller to workspace authorization
///
/// Ownership comes from `workspaces.owner_id` only; membership rows are consulted for
/// existence, never for owner authority.
#[derive(Clone)]
pub struct MembershipGuard {
    store: Arc<dyn WorkspaceStore>,
}

impl MembershipGuard {
    pub fn new(store: Arc<dyn WorkspaceStore>) -> Self {
        Self { store }
    }

    pub async fn authorize_member(
        &self,
        workspace_id: Uuid,
        caller: Option<&AuthUser>,
    ) -> AppResult<MemberRole> {
        let caller = caller.ok_or(AppError::Unauthorized)?;
        let membership = self
            .store
            .membership(workspace_id, caller.user_id)
            .await?
            .ok_or_else(|| {
                debug!(%workspace_id, user_id = %caller.user_id, "caller is not a workspace member");
                AppError::Unauthorized
            })?;
        Ok(membership.role)
    }

    pub async fn authorize_owner(
        &self,
        workspace_id: Uuid,
        caller: Option<&AuthUser>,
    ) -> AppResult<()> {
        let caller = caller.ok_or(AppError::Unauthorized)?;
        let workspace = self
            .store
            .workspace(workspace_id)
            .await?
            .ok_or(AppError::Unauthorized)?;
        if workspace.owner_id != caller.user_id {
            debug!(%workspace_id, user_id = %caller.user_id, "caller is not the workspace owner");
            return Err(AppError::Unauthorized);
        }
        Ok(())
    }
}
