//! Reorg detection and recovery logic.
//!
//! Handles two situations:
//! 1. **Parent mismatch**: the next remote block does not name the local tip
//!    as its parent while advancing.
//! 2. **Tip mismatch**: at startup, the remote block at the local tip height
//!    has a different hash.
//!
//! Either way exactly one block is rolled back per step; the scanner re-fetches
//! and asks again until the chains agree.

use tracing::{debug, warn};

use crate::error::LedgerError;
use crate::types::BlockHeader;
use crate::window::ConfirmationWindow;

/// Describes one rollback step of a chain reorganization.
#[derive(Debug, Clone)]
pub struct ReorgEvent {
    /// Height of the remote block that exposed the fork.
    pub detected_at: u64,
    /// The local block that was rolled back.
    pub dropped: BlockHeader,
    /// Consecutive rollback steps so far, this one included.
    pub depth: u64,
    pub reorg_type: ReorgType,
}

/// Classification of the reorg type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgType {
    ParentMismatch,
    TipMismatch,
}

impl std::fmt::Display for ReorgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ParentMismatch => write!(f, "parent mismatch"),
            Self::TipMismatch => write!(f, "tip mismatch"),
        }
    }
}

/// Outcome of a continuity check.
#[derive(Debug, Clone)]
pub enum ReorgStep {
    /// Local and remote chains agree.
    Continuous,
    /// The local tip was dropped; re-fetch above the new tip.
    RolledBack(ReorgEvent),
}

/// Tracks consecutive rollbacks and drives the window back one block at a time.
pub struct ReorgResolver {
    max_depth: u64,
    consecutive: u64,
}

impl ReorgResolver {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth as u64,
            consecutive: 0,
        }
    }

    /// Rollback steps taken since the chains last agreed.
    pub fn consecutive(&self) -> u64 {
        self.consecutive
    }

    /// Check that `remote` extends the local tip.
    pub async fn check(
        &mut self,
        remote: &BlockHeader,
        window: &ConfirmationWindow,
    ) -> Result<ReorgStep, LedgerError> {
        let Some(local) = window.latest().await? else {
            self.consecutive = 0;
            return Ok(ReorgStep::Continuous);
        };
        if remote.height != local.height + 1 {
            // Skipping ahead to the configured start height.
            debug!(
                remote = remote.height,
                local = local.height,
                "remote block does not follow the local tip, no parent to compare"
            );
            self.consecutive = 0;
            return Ok(ReorgStep::Continuous);
        }
        if remote.parent_hash == local.hash {
            self.consecutive = 0;
            return Ok(ReorgStep::Continuous);
        }
        self.roll_back(remote.height, local, ReorgType::ParentMismatch, window)
            .await
    }

    /// Startup check: `remote` is the remote block at the local tip height.
    pub async fn verify_tip(
        &mut self,
        remote: &BlockHeader,
        window: &ConfirmationWindow,
    ) -> Result<ReorgStep, LedgerError> {
        let Some(local) = window.latest().await? else {
            self.consecutive = 0;
            return Ok(ReorgStep::Continuous);
        };
        if remote.height != local.height || remote.hash == local.hash {
            self.consecutive = 0;
            return Ok(ReorgStep::Continuous);
        }
        self.roll_back(remote.height, local, ReorgType::TipMismatch, window)
            .await
    }

    async fn roll_back(
        &mut self,
        detected_at: u64,
        local: BlockHeader,
        reorg_type: ReorgType,
        window: &ConfirmationWindow,
    ) -> Result<ReorgStep, LedgerError> {
        self.consecutive += 1;
        let too_deep = || LedgerError::ReorgTooDeep {
            height: local.height,
            depth: self.consecutive,
        };
        if self.consecutive > self.max_depth {
            return Err(too_deep());
        }
        // The tip only exists durably: it can no longer be rolled back.
        if window.tip().as_ref() != Some(&local) {
            return Err(too_deep());
        }
        window.delete_block(&local).map_err(|_| too_deep())?;

        warn!(
            detected_at,
            dropped = local.height,
            hash = %local.hash,
            depth = self.consecutive,
            reorg_type = %reorg_type,
            "reorg: rolled back local tip"
        );
        Ok(ReorgStep::RolledBack(ReorgEvent {
            detected_at,
            dropped: local,
            depth: self.consecutive,
            reorg_type,
        }))
    }
}
