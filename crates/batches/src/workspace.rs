//! Workspace resolution: turning a batch spec into per-repository workspaces.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use batchforge_core::{BatchSpecId, ChangesetSpecId, RepoId};

use crate::batch_spec::{BatchSpecDocument, Step};

/// A workspace as produced by the resolver, before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoWorkspace {
    pub repo_id: RepoId,
    pub branch: String,
    pub commit: String,
    /// Path of the workspace root inside the repository; empty for the root.
    pub path: String,
    pub file_matches: Vec<String>,
    pub steps: Vec<Step>,
    pub only_fetch_workspace: bool,
    pub unsupported: bool,
    pub ignored: bool,
}

/// A persisted workspace of one batch spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSpecWorkspace {
    pub batch_spec_id: BatchSpecId,
    pub changeset_spec_ids: Vec<ChangesetSpecId>,
    pub repo_id: RepoId,
    pub branch: String,
    pub commit: String,
    pub path: String,
    pub file_matches: Vec<String>,
    pub steps: Vec<Step>,
    pub only_fetch_workspace: bool,
    pub unsupported: bool,
    pub ignored: bool,
}

impl BatchSpecWorkspace {
    /// Copy a resolved workspace verbatim; no changeset specs exist yet.
    pub fn from_resolved(batch_spec_id: BatchSpecId, ws: RepoWorkspace) -> Self {
        Self {
            batch_spec_id,
            changeset_spec_ids: Vec::new(),
            repo_id: ws.repo_id,
            branch: ws.branch,
            commit: ws.commit,
            path: ws.path,
            file_matches: ws.file_matches,
            steps: ws.steps,
            only_fetch_workspace: ws.only_fetch_workspace,
            unsupported: ws.unsupported,
            ignored: ws.ignored,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    pub allow_unsupported: bool,
    pub allow_ignored: bool,
}

/// Resolver output. Repositories skipped for being unsupported or ignored are
/// reported separately from the workspaces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub workspaces: Vec<RepoWorkspace>,
    pub unsupported: Vec<RepoId>,
    pub ignored: Vec<RepoId>,
}

/// Expands the `on` section of a batch spec into concrete workspaces.
#[async_trait]
pub trait WorkspaceResolver: Send + Sync + 'static {
    async fn resolve(
        &self,
        spec: &BatchSpecDocument,
        opts: ResolveOptions,
    ) -> anyhow::Result<Resolution>;
}
