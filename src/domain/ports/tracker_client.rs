//! Port for Orca's one external tracker collaborator.
//!
//! Unlike the generic `IngestionAdapter`/`EgressAdapter` pair this is
//! descended from, Orca talks to exactly one tracker, so the fetch and
//! write-back surfaces are collapsed into a single trait.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{EgressAction, EgressResult, ExternalIssue, WorkflowStateCatalog};

/// HTTP/GraphQL client boundary for the external issue tracker.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Fetch all issues in scope for a project, plus its workflow state
    /// catalog (used by `mapStateToPhase`).
    async fn fetch_issues(
        &self,
        project_id: &str,
    ) -> DomainResult<(Vec<ExternalIssue>, WorkflowStateCatalog)>;

    /// Execute a write-back action against the tracker.
    async fn execute(&self, action: &EgressAction) -> DomainResult<EgressResult>;
}
