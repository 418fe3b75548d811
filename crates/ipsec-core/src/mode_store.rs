//! Accessor over the cluster-wide desired IPsec mode
//!
//! All writes are read-modify-write against the record's version token. A
//! conflicting concurrent writer forces the whole sequence to run again, so a
//! requested change is either applied or reported as failed.

use crate::api::NetworkConfigApi;
use crate::config::RetrySettings;
use crate::error::RolloutError;
use crate::types::SecurityMode;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of `set_mode`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeChange {
    /// Record already held the desired mode; nothing written
    Unchanged,
    /// Record written after `attempts` tries
    Applied { attempts: u32 },
}

impl ModeChange {
    #[inline]
    #[must_use]
    pub fn was_written(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Owning handle to the mode record
#[derive(Clone)]
pub struct ModeStore {
    api: Arc<dyn NetworkConfigApi>,
    retry: RetrySettings,
}

impl ModeStore {
    #[must_use]
    pub fn new(api: Arc<dyn NetworkConfigApi>, retry: RetrySettings) -> Self {
        Self { api, retry }
    }

    /// Current effective mode
    pub async fn get_mode(&self) -> Result<SecurityMode, RolloutError> {
        self.api.get_network_config().await?.effective_mode()
    }

    /// Request `desired`, retrying on version conflicts.
    ///
    /// # Errors
    /// - `RolloutError::ConflictBudgetExhausted` when every attempt conflicted
    /// - any non-conflict backend error, unchanged
    pub async fn set_mode(&self, desired: SecurityMode) -> Result<ModeChange, RolloutError> {
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let mut config = self.api.get_network_config().await?;
            if !config.apply_mode(desired) {
                tracing::debug!(mode = %desired, "ipsec mode already set");
                return Ok(ModeChange::Unchanged);
            }

            match self.api.update_network_config(&config).await {
                Ok(_) => {
                    tracing::info!(mode = %desired, attempt, "ipsec mode updated");
                    return Ok(ModeChange::Applied { attempts: attempt });
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(mode = %desired, attempt, "conflict on mode update, retrying");
                    if attempt < max_attempts {
                        tokio::time::sleep(Duration::from_millis(self.retry.backoff_ms)).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(RolloutError::ConflictBudgetExhausted {
            attempts: max_attempts,
        })
    }
}

impl std::fmt::Debug for ModeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeStore")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
