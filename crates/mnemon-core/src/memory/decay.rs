//! Salience decay
//!
//! Per-sector exponential decay modulated by importance, with an
//! access-count protection term and a hard floor. A background task applies
//! decay in bounded batches on a fixed interval; runs never overlap and the
//! task is cancellable.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::DecayConfig;
use crate::storage::Store;

use super::types::{Memory, SALIENCE_FLOOR, SALIENCE_MAX};

// ============================================================================
// DECAY MATH
// ============================================================================

/// Compute the decayed salience of a memory at `now`.
///
/// `salience · exp(−k / (importance + 0.1) · days) + min(0.1, ln(1 + accesses) · 0.02)`,
/// clamped to `[0.05, 1.0]`. Importance slows decay; frequent access adds a
/// bounded protection term.
pub fn decay_salience(memory: &Memory, now: DateTime<Utc>) -> f64 {
    let days = (now - memory.last_accessed).num_seconds().max(0) as f64 / 86_400.0;
    let k = memory.sector.decay_constant();
    let decayed = memory.salience * (-k / (memory.importance + 0.1) * days).exp();
    let protection = (((1.0 + memory.access_count as f64).ln()) * 0.02).min(0.1);
    (decayed + protection).clamp(SALIENCE_FLOOR, SALIENCE_MAX)
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Outcome of one decay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecayStats {
    /// Memories examined
    pub scanned: usize,
    /// Memories whose salience actually dropped
    pub decayed: usize,
}

/// Background decay task. One pass per interval; a slow pass delays the next
/// tick instead of stacking.
pub struct DecayTask {
    store: Arc<Store>,
    config: DecayConfig,
    cancel: CancellationToken,
}

impl DecayTask {
    pub fn new(store: Arc<Store>, config: DecayConfig, cancel: CancellationToken) -> Self {
        Self {
            store,
            config,
            cancel,
        }
    }

    /// Spawn the task onto the runtime
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays quiet
        interval.tick().await;

        tracing::info!(
            interval_secs = self.config.interval_secs,
            batch_size = self.config.batch_size,
            "Decay task started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    tracing::info!("Decay task stopped");
                    return;
                }

                _ = interval.tick() => {
                    match self.run_once() {
                        Ok(stats) if stats.decayed > 0 => {
                            tracing::debug!(scanned = stats.scanned, decayed = stats.decayed, "Decay pass complete");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "Decay pass failed"),
                    }
                }
            }
        }
    }

    /// One decay pass over the next batch. Memories at or below the floor are
    /// excluded by the batch query, so decaying them is a no-op by
    /// construction.
    pub fn run_once(&self) -> crate::storage::Result<DecayStats> {
        let now = Utc::now();
        let batch = self
            .store
            .decay_batch(self.config.floor, self.config.batch_size)?;

        let mut stats = DecayStats {
            scanned: batch.len(),
            decayed: 0,
        };

        for memory in &batch {
            let next = decay_salience(memory, now);
            if next < memory.salience {
                self.store.set_decayed_salience(&memory.id, next)?;
                stats.decayed += 1;
            }
        }

        Ok(stats)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::Sector;
    use tempfile::TempDir;

    fn memory_with(
        sector: Sector,
        salience: f64,
        importance: f64,
        days_idle: i64,
        access_count: i64,
    ) -> Memory {
        let now = Utc::now();
        Memory {
            id: "m".to_string(),
            project_id: "p".to_string(),
            content: "content".to_string(),
            summary: None,
            content_hash: String::new(),
            simhash: None,
            sector,
            tier: Default::default(),
            memory_type: None,
            importance,
            salience,
            access_count,
            created_at: now,
            updated_at: now,
            last_accessed: now - chrono::Duration::days(days_idle),
            valid_from: None,
            valid_until: None,
            is_deleted: false,
            deleted_at: None,
            tags: vec![],
            concepts: vec![],
            files: vec![],
            categories: vec![],
        }
    }

    #[test]
    fn fresh_memory_barely_decays() {
        let m = memory_with(Sector::Semantic, 1.0, 0.5, 0, 0);
        let decayed = decay_salience(&m, Utc::now());
        assert!((decayed - 1.0).abs() < 0.001);
    }

    #[test]
    fn decay_respects_floor() {
        let m = memory_with(Sector::Episodic, 0.06, 0.0, 3650, 0);
        assert!(decay_salience(&m, Utc::now()) >= SALIENCE_FLOOR);
    }

    #[test]
    fn episodic_decays_faster_than_semantic() {
        let now = Utc::now();
        let episodic = memory_with(Sector::Episodic, 1.0, 0.5, 30, 0);
        let semantic = memory_with(Sector::Semantic, 1.0, 0.5, 30, 0);
        assert!(decay_salience(&episodic, now) < decay_salience(&semantic, now));
    }

    #[test]
    fn importance_slows_decay() {
        let now = Utc::now();
        let trivial = memory_with(Sector::Episodic, 1.0, 0.0, 60, 0);
        let critical = memory_with(Sector::Episodic, 1.0, 1.0, 60, 0);
        assert!(decay_salience(&critical, now) > decay_salience(&trivial, now));
    }

    #[test]
    fn access_count_protection_is_capped() {
        let now = Utc::now();
        let hot = memory_with(Sector::Episodic, 0.05, 0.0, 3650, 1_000_000);
        // Fully decayed but heavily accessed: floor + capped 0.1 boost
        let salience = decay_salience(&hot, now);
        assert!(salience <= 0.05 + 0.1 + 0.001);
        assert!(salience > 0.05);
    }

    #[test]
    fn decay_never_exceeds_ceiling() {
        let m = memory_with(Sector::Emotional, 1.0, 1.0, 0, 1_000_000);
        assert!(decay_salience(&m, Utc::now()) <= SALIENCE_MAX);
    }

    #[test]
    fn run_once_skips_floor_memories() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(Store::open(temp.path().join("memories.db")).unwrap());
        let project = store.upsert_project("/p", "p").unwrap();

        let mut stale = memory_with(Sector::Episodic, 0.8, 0.0, 90, 0);
        stale.id = uuid::Uuid::new_v4().to_string();
        stale.project_id = project.id.clone();
        let mut floored = memory_with(Sector::Episodic, SALIENCE_FLOOR, 0.0, 90, 0);
        floored.id = uuid::Uuid::new_v4().to_string();
        floored.project_id = project.id.clone();
        store.insert_memory(&stale).unwrap();
        store.insert_memory(&floored).unwrap();

        let task = DecayTask::new(
            store.clone(),
            DecayConfig::default(),
            CancellationToken::new(),
        );
        let stats = task.run_once().unwrap();

        // The floored memory is not even scanned
        assert_eq!(stats.scanned, 1);
        assert_eq!(stats.decayed, 1);

        let decayed = store.get_memory(&stale.id).unwrap().unwrap();
        assert!(decayed.salience < 0.8);
        assert!(decayed.salience >= SALIENCE_FLOOR);
    }
}
