#![forbid(unsafe_code)]

use super::{truncate_for_db, Store, StoreError};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

/// Closed artifact lifecycle vocabulary. Every mutation goes through
/// [`Store::transition_artifact`], which validates the edge against
/// [`ArtifactStatus::can_transition_to`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactStatus {
    Created,
    Building,
    BuildFailed,
    Testing,
    TestFailed,
    SelfChecking,
    SelfCheckFailed,
    Staged,
    Approved,
    Deploying,
    DeployedUnstable,
    Promoted,
    RollbackPending,
    RolledBack,
    DeployFailed,
    Cancelled,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Building => "building",
            Self::BuildFailed => "build_failed",
            Self::Testing => "testing",
            Self::TestFailed => "test_failed",
            Self::SelfChecking => "self_checking",
            Self::SelfCheckFailed => "self_check_failed",
            Self::Staged => "staged",
            Self::Approved => "approved",
            Self::Deploying => "deploying",
            Self::DeployedUnstable => "deployed_unstable",
            Self::Promoted => "promoted",
            Self::RollbackPending => "rollback_pending",
            Self::RolledBack => "rolled_back",
            Self::DeployFailed => "deploy_failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "created" => Self::Created,
            "building" => Self::Building,
            "build_failed" => Self::BuildFailed,
            "testing" => Self::Testing,
            "test_failed" => Self::TestFailed,
            "self_checking" => Self::SelfChecking,
            "self_check_failed" => Self::SelfCheckFailed,
            "staged" => Self::Staged,
            "approved" => Self::Approved,
            "deploying" => Self::Deploying,
            "deployed_unstable" => Self::DeployedUnstable,
            "promoted" => Self::Promoted,
            "rollback_pending" => Self::RollbackPending,
            "rolled_back" => Self::RolledBack,
            "deploy_failed" => Self::DeployFailed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    pub fn can_transition_to(&self, to: ArtifactStatus) -> bool {
        use ArtifactStatus::*;
        matches!(
            (self, to),
            (Created, Building)
                | (Building, Testing)
                | (Building, BuildFailed)
                | (Testing, SelfChecking)
                | (Testing, TestFailed)
                | (SelfChecking, Staged)
                | (SelfChecking, SelfCheckFailed)
                | (Staged, Approved)
                | (Staged, Cancelled)
                | (Approved, Deploying)
                | (Deploying, DeployedUnstable)
                | (Deploying, DeployFailed)
                | (DeployedUnstable, Promoted)
                | (DeployedUnstable, RollbackPending)
                | (RollbackPending, RolledBack)
        )
    }
}

impl std::fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One candidate worker binary and its lifecycle record.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub id: i64,
    pub tx_id: String,
    pub base_tx_id: Option<String>,
    pub bin_path: String,
    pub sha256: Option<String>,
    pub git_revision: Option<String>,
    pub build_started_at: Option<i64>,
    pub build_finished_at: Option<i64>,
    pub test_summary: Option<String>,
    pub self_check_summary: Option<String>,
    pub approval_chat_id: Option<i64>,
    pub approval_message_id: Option<i64>,
    pub deploy_started_at: Option<i64>,
    pub deploy_finished_at: Option<i64>,
    pub status: String,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Artifact {
    pub fn status(&self) -> Option<ArtifactStatus> {
        ArtifactStatus::parse(&self.status)
    }
}

const ARTIFACT_COLUMNS: &str = "id, tx_id, base_tx_id, bin_path, sha256, git_revision,
    build_started_at, build_finished_at, test_summary, self_check_summary,
    approval_chat_id, approval_message_id, deploy_started_at, deploy_finished_at,
    status, last_error, created_at, updated_at";

fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<Artifact> {
    Ok(Artifact {
        id: row.get(0)?,
        tx_id: row.get(1)?,
        base_tx_id: row.get(2)?,
        bin_path: row.get(3)?,
        sha256: row.get(4)?,
        git_revision: row.get(5)?,
        build_started_at: row.get(6)?,
        build_finished_at: row.get(7)?,
        test_summary: row.get(8)?,
        self_check_summary: row.get(9)?,
        approval_chat_id: row.get(10)?,
        approval_message_id: row.get(11)?,
        deploy_started_at: row.get(12)?,
        deploy_finished_at: row.get(13)?,
        status: row.get(14)?,
        last_error: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn null_if_empty(v: &str) -> Option<&str> {
    let trimmed = v.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

impl Store {
    pub fn insert_artifact(
        &self,
        tx_id: &str,
        base_tx_id: &str,
        bin_path: &str,
        status: ArtifactStatus,
    ) -> Result<(), StoreError> {
        let tx_id = tx_id.trim();
        let bin_path = bin_path.trim();
        if tx_id.is_empty() {
            return Err(StoreError::InvalidInput("tx_id cannot be empty"));
        }
        if bin_path.is_empty() {
            return Err(StoreError::InvalidInput("bin_path cannot be empty"));
        }
        self.conn.execute(
            "INSERT INTO artifacts (tx_id, base_tx_id, bin_path, status) VALUES (?1, ?2, ?3, ?4)",
            params![tx_id, null_if_empty(base_tx_id), bin_path, status.as_str()],
        )?;
        Ok(())
    }

    /// Artifact insert plus event append in one transaction.
    pub fn insert_artifact_with_event(
        &mut self,
        parent_event_id: Option<i64>,
        tx_id: &str,
        base_tx_id: &str,
        bin_path: &str,
        status: ArtifactStatus,
        event_type: &str,
        payload: &Value,
    ) -> Result<(), StoreError> {
        let tx_id = tx_id.trim();
        let bin_path = bin_path.trim();
        if tx_id.is_empty() {
            return Err(StoreError::InvalidInput("tx_id cannot be empty"));
        }
        if bin_path.is_empty() {
            return Err(StoreError::InvalidInput("bin_path cannot be empty"));
        }
        let payload_json = serde_json::to_string(payload)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO artifacts (tx_id, base_tx_id, bin_path, status) VALUES (?1, ?2, ?3, ?4)",
            params![tx_id, null_if_empty(base_tx_id), bin_path, status.as_str()],
        )?;
        tx.execute(
            "INSERT INTO events (parent_id, event_type, payload) VALUES (?1, ?2, ?3)",
            params![parent_event_id, event_type, payload_json],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_artifact(&self, tx_id: &str) -> Result<Artifact, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE tx_id = ?1"),
                params![tx_id],
                artifact_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                entity: "artifact",
                id: tx_id.to_string(),
            })
    }

    /// Conditional status move. Returns `false` when the row is not at
    /// `from` (a concurrent claimant won); an edge missing from the DAG is
    /// an error.
    pub fn transition_artifact(
        &self,
        tx_id: &str,
        from: ArtifactStatus,
        to: ArtifactStatus,
        last_error: &str,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        let affected = self.conn.execute(
            "UPDATE artifacts SET status = ?1, last_error = ?2, updated_at = unixepoch()
             WHERE tx_id = ?3 AND status = ?4",
            params![
                to.as_str(),
                null_if_empty(truncate_for_db(last_error)),
                tx_id,
                from.as_str()
            ],
        )?;
        Ok(affected > 0)
    }

    /// Conditional transition plus event append in one transaction; the
    /// event is only written when the row actually moved.
    pub fn transition_artifact_with_event(
        &mut self,
        parent_event_id: Option<i64>,
        tx_id: &str,
        from: ArtifactStatus,
        to: ArtifactStatus,
        last_error: &str,
        event_type: &str,
        payload: &Value,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        let payload_json = serde_json::to_string(payload)?;
        let tx = self.conn.transaction()?;
        let affected = tx.execute(
            "UPDATE artifacts SET status = ?1, last_error = ?2, updated_at = unixepoch()
             WHERE tx_id = ?3 AND status = ?4",
            params![
                to.as_str(),
                null_if_empty(truncate_for_db(last_error)),
                tx_id,
                from.as_str()
            ],
        )?;
        if affected == 0 {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO events (parent_id, event_type, payload) VALUES (?1, ?2, ?3)",
            params![parent_event_id, event_type, payload_json],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// `staged -> approved` that also stamps the approving chat and records
    /// `update.approved`.
    pub fn approve_artifact_with_event(
        &mut self,
        parent_event_id: Option<i64>,
        tx_id: &str,
        approval_chat_id: i64,
    ) -> Result<bool, StoreError> {
        let payload = serde_json::json!({"tx_id": tx_id, "approval_chat_id": approval_chat_id});
        let payload_json = serde_json::to_string(&payload)?;
        let tx = self.conn.transaction()?;
        let affected = tx.execute(
            "UPDATE artifacts SET status = ?1, approval_chat_id = ?2, updated_at = unixepoch()
             WHERE tx_id = ?3 AND status = ?4",
            params![
                ArtifactStatus::Approved.as_str(),
                approval_chat_id,
                tx_id,
                ArtifactStatus::Staged.as_str()
            ],
        )?;
        if affected == 0 {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO events (parent_id, event_type, payload) VALUES (?1, ?2, ?3)",
            params![parent_event_id, "update.approved", payload_json],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Transactionally take the oldest approved artifact into `deploying`.
    /// The conditional update inside the transaction is what guarantees at
    /// most one row is ever at `deploying`.
    pub fn claim_approved_for_deploy(&mut self) -> Result<Option<Artifact>, StoreError> {
        let tx = self.conn.transaction()?;
        let candidate: Option<Artifact> = tx
            .query_row(
                &format!(
                    "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE status = ?1
                     ORDER BY created_at ASC, id ASC LIMIT 1"
                ),
                params![ArtifactStatus::Approved.as_str()],
                artifact_from_row,
            )
            .optional()?;
        let Some(mut artifact) = candidate else {
            return Ok(None);
        };
        let affected = tx.execute(
            "UPDATE artifacts SET status = ?1, deploy_started_at = unixepoch(), updated_at = unixepoch()
             WHERE tx_id = ?2 AND status = ?3",
            params![
                ArtifactStatus::Deploying.as_str(),
                artifact.tx_id,
                ArtifactStatus::Approved.as_str()
            ],
        )?;
        if affected == 0 {
            return Ok(None);
        }
        tx.commit()?;
        artifact.status = ArtifactStatus::Deploying.as_str().to_string();
        Ok(Some(artifact))
    }

    pub fn mark_deploy_completed(&self, tx_id: &str) -> Result<bool, StoreError> {
        let affected = self.conn.execute(
            "UPDATE artifacts SET status = ?1, deploy_finished_at = unixepoch(), updated_at = unixepoch()
             WHERE tx_id = ?2 AND status = ?3",
            params![
                ArtifactStatus::DeployedUnstable.as_str(),
                tx_id,
                ArtifactStatus::Deploying.as_str()
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn mark_deploy_failed(&self, tx_id: &str, last_error: &str) -> Result<bool, StoreError> {
        let affected = self.conn.execute(
            "UPDATE artifacts SET status = ?1, deploy_finished_at = unixepoch(),
             updated_at = unixepoch(), last_error = ?2
             WHERE tx_id = ?3 AND status = ?4",
            params![
                ArtifactStatus::DeployFailed.as_str(),
                truncate_for_db(last_error),
                tx_id,
                ArtifactStatus::Deploying.as_str()
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn mark_promoted(&self, tx_id: &str) -> Result<bool, StoreError> {
        self.transition_artifact(
            tx_id,
            ArtifactStatus::DeployedUnstable,
            ArtifactStatus::Promoted,
            "",
        )
    }

    pub fn mark_rollback_pending(&self, tx_id: &str) -> Result<bool, StoreError> {
        self.transition_artifact(
            tx_id,
            ArtifactStatus::DeployedUnstable,
            ArtifactStatus::RollbackPending,
            "",
        )
    }

    pub fn mark_rolled_back(&self, tx_id: &str) -> Result<bool, StoreError> {
        self.transition_artifact(
            tx_id,
            ArtifactStatus::RollbackPending,
            ArtifactStatus::RolledBack,
            "",
        )
    }

    /// Highest-id artifact at the given status.
    pub fn latest_artifact_by_status(
        &self,
        status: ArtifactStatus,
    ) -> Result<Option<Artifact>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE status = ?1
                     ORDER BY id DESC LIMIT 1"
                ),
                params![status.as_str()],
                artifact_from_row,
            )
            .optional()?)
    }

    pub fn latest_promoted_tx_id(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT tx_id FROM artifacts WHERE status = ?1 ORDER BY id DESC LIMIT 1",
                params![ArtifactStatus::Promoted.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Idempotent insert of the starting binary as `promoted`, so rollback
    /// always has a `base_tx_id` target.
    pub fn ensure_bootstrap_promoted(&self, tx_id: &str, bin_path: &str) -> Result<(), StoreError> {
        let tx_id = tx_id.trim();
        let bin_path = bin_path.trim();
        if tx_id.is_empty() {
            return Err(StoreError::InvalidInput("tx_id cannot be empty"));
        }
        if bin_path.is_empty() {
            return Err(StoreError::InvalidInput("bin_path cannot be empty"));
        }
        self.conn.execute(
            "INSERT OR IGNORE INTO artifacts (tx_id, bin_path, status) VALUES (?1, ?2, ?3)",
            params![tx_id, bin_path, ArtifactStatus::Promoted.as_str()],
        )?;
        Ok(())
    }

    /// Startup normalization: any artifact caught mid-flight by a crash
    /// moves to its matching failed state.
    pub fn cleanup_in_progress(&self) -> Result<i64, StoreError> {
        let affected = self.conn.execute(
            "UPDATE artifacts SET status = CASE status
                 WHEN 'building' THEN 'build_failed'
                 WHEN 'testing' THEN 'test_failed'
                 WHEN 'self_checking' THEN 'self_check_failed'
                 WHEN 'deploying' THEN 'deploy_failed'
                 ELSE status
             END,
             updated_at = unixepoch(),
             last_error = 'interrupted during startup cleanup'
             WHERE status IN ('building', 'testing', 'self_checking', 'deploying')",
            [],
        )?;
        Ok(affected as i64)
    }

    pub fn set_artifact_build_metadata(
        &self,
        tx_id: &str,
        sha256_hex: &str,
        git_revision: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE artifacts SET sha256 = ?1, git_revision = ?2,
             build_finished_at = unixepoch(), updated_at = unixepoch()
             WHERE tx_id = ?3",
            params![null_if_empty(sha256_hex), null_if_empty(git_revision), tx_id],
        )?;
        Ok(())
    }

    pub fn set_artifact_test_summary(&self, tx_id: &str, summary: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE artifacts SET test_summary = ?1, updated_at = unixepoch() WHERE tx_id = ?2",
            params![null_if_empty(summary), tx_id],
        )?;
        Ok(())
    }

    pub fn set_artifact_self_check_summary(
        &self,
        tx_id: &str,
        summary: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE artifacts SET self_check_summary = ?1, updated_at = unixepoch() WHERE tx_id = ?2",
            params![null_if_empty(summary), tx_id],
        )?;
        Ok(())
    }
}
