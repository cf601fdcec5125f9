//! Process-wide engine state: status, counters, per-cycle progress, and the
//! per-job recovery maps.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use cadence_api::{EscalationLevel, TokenUsage};

/// Lifecycle status of the engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    #[default]
    Stopped,
    Running,
    Paused,
    Error,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Cumulative counters since engine construction.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub jobs_processed: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub endpoint_calls: u64,
    pub agent_calls: u64,
    pub token_usage: TokenUsage,
}

/// Progress of one endpoint within the current cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointProgressEntry {
    pub status: String,
    pub attempts: u32,
    pub last_updated: DateTime<Utc>,
}

/// Transient progress of the cycle currently in flight.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleProgress {
    pub total: usize,
    pub completed: usize,
    pub endpoints: HashMap<String, EndpointProgressEntry>,
}

/// Serializable snapshot of the whole engine state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub status: EngineStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_processing_at: Option<DateTime<Utc>>,
    pub stats: EngineStats,
    pub progress: CycleProgress,
}

/// State shared between the cycle runner and job pipelines.
///
/// All maps are process-local: escalation levels and disabled endpoints
/// survive for the engine's lifetime only. Anything that must outlive a
/// restart belongs to the persistence collaborator.
#[derive(Default)]
pub struct SharedState {
    pub stats: Mutex<EngineStats>,
    pub progress: Mutex<CycleProgress>,
    disabled_endpoints: Mutex<HashMap<Uuid, HashSet<String>>>,
    escalation_levels: Mutex<HashMap<Uuid, EscalationLevel>>,
}

impl SharedState {
    /// Fold a model call's token usage into the cumulative counters.
    pub fn add_token_usage(&self, usage: &TokenUsage) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        stats.token_usage.add(usage);
    }

    /// Snapshot of the disabled-endpoint set for a job.
    pub fn disabled_endpoints(&self, job_id: Uuid) -> HashSet<String> {
        self.disabled_endpoints
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Add endpoints to a job's disabled set.
    pub fn disable_endpoints<I: IntoIterator<Item = String>>(&self, job_id: Uuid, ids: I) {
        let mut map = self
            .disabled_endpoints
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        map.entry(job_id).or_default().extend(ids);
    }

    /// Record the new escalation level, returning the previous one.
    pub fn swap_escalation_level(&self, job_id: Uuid, level: EscalationLevel) -> EscalationLevel {
        let mut map = self
            .escalation_levels
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        map.insert(job_id, level).unwrap_or_default()
    }

    /// Reset per-cycle progress at the start of a cycle.
    pub fn begin_cycle(&self, total: usize) {
        let mut progress = self.progress.lock().unwrap_or_else(|p| p.into_inner());
        *progress = CycleProgress {
            total,
            completed: 0,
            endpoints: HashMap::new(),
        };
    }

    /// Increment the completed-jobs counter for the current cycle and return
    /// the updated (total, completed) pair.
    pub fn job_completed(&self) -> (usize, usize) {
        let mut progress = self.progress.lock().unwrap_or_else(|p| p.into_inner());
        progress.completed += 1;
        (progress.total, progress.completed)
    }

    /// Update the per-endpoint progress entry.
    pub fn update_endpoint_progress(&self, endpoint_id: &str, status: &str, attempt: u32) {
        let mut progress = self.progress.lock().unwrap_or_else(|p| p.into_inner());
        progress.endpoints.insert(
            endpoint_id.to_string(),
            EndpointProgressEntry {
                status: status.to_string(),
                attempts: attempt,
                last_updated: Utc::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_endpoints_accumulate_across_cycles() {
        let state = SharedState::default();
        let job = Uuid::new_v4();

        state.disable_endpoints(job, ["a".to_string()]);
        state.disable_endpoints(job, ["b".to_string(), "a".to_string()]);

        let disabled = state.disabled_endpoints(job);
        assert_eq!(disabled.len(), 2);
        assert!(disabled.contains("a"));
        assert!(disabled.contains("b"));

        // Other jobs are unaffected.
        assert!(state.disabled_endpoints(Uuid::new_v4()).is_empty());
    }

    #[test]
    fn escalation_swap_returns_previous_level() {
        let state = SharedState::default();
        let job = Uuid::new_v4();

        assert_eq!(
            state.swap_escalation_level(job, EscalationLevel::Warn),
            EscalationLevel::None
        );
        assert_eq!(
            state.swap_escalation_level(job, EscalationLevel::Critical),
            EscalationLevel::Warn
        );
    }

    #[test]
    fn begin_cycle_resets_progress() {
        let state = SharedState::default();
        state.update_endpoint_progress("e1", "started", 1);
        state.begin_cycle(4);

        let progress = state.progress.lock().unwrap();
        assert_eq!(progress.total, 4);
        assert_eq!(progress.completed, 0);
        assert!(progress.endpoints.is_empty());
    }

    #[test]
    fn token_usage_is_monotonic() {
        let state = SharedState::default();
        let usage = TokenUsage {
            input_tokens: 5,
            output_tokens: 3,
            total_tokens: 8,
            ..Default::default()
        };
        state.add_token_usage(&usage);
        state.add_token_usage(&usage);

        let stats = state.stats.lock().unwrap();
        assert_eq!(stats.token_usage.total_tokens, 16);
    }
}
