use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dsa_core::{District, InvalidTransition, JobState};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::{ConfigError, JobConfig};

/// One user-requested export run over a fixed district selection.
#[derive(Debug)]
pub struct ScrapeJob {
    id: Uuid,
    created_at: DateTime<Utc>,
    districts: Vec<District>,
    config: JobConfig,
    state: Mutex<JobState>,
    cancel: CancellationToken,
}

impl ScrapeJob {
    /// Validate `config` against the selection. Nothing is created on failure.
    pub fn new(districts: Vec<District>, config: JobConfig) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let districts: Vec<District> = districts
            .into_iter()
            .filter(|d| seen.insert(d.code.clone()))
            .collect();
        config.validate(&districts)?;
        Ok(Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            districts,
            config,
            state: Mutex::new(JobState::Pending),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn districts(&self) -> &[District] {
        &self.districts
    }

    pub fn district_codes(&self) -> Vec<String> {
        self.districts.iter().map(|d| d.code.clone()).collect()
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop issuing requests. Requests already in flight run to completion.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!(job_id = %self.id, "cancellation requested");
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn transition(&self, to: JobState) -> Result<JobState, InvalidTransition> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = state.advance(to)?;
        Ok(*state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn district(code: &str) -> District {
        District {
            county: "Alameda".into(),
            name: format!("District {code}"),
            code: code.into(),
        }
    }

    #[test]
    fn selection_is_a_set_in_first_seen_order() {
        let job = ScrapeJob::new(
            vec![district("360"), district("3672"), district("360")],
            JobConfig::default(),
        )
        .unwrap();
        assert_eq!(job.district_codes(), vec!["360", "3672"]);
        assert_eq!(job.state(), JobState::Pending);
    }

    #[test]
    fn invalid_config_creates_no_job() {
        let err = ScrapeJob::new(Vec::new(), JobConfig::default()).unwrap_err();
        assert_eq!(err, ConfigError::EmptySelection);
    }

    #[test]
    fn transitions_are_monotonic() {
        let job = ScrapeJob::new(vec![district("360")], JobConfig::default()).unwrap();
        assert_eq!(job.transition(JobState::Running), Ok(JobState::Running));
        assert_eq!(job.transition(JobState::Completed), Ok(JobState::Completed));
        assert!(job.transition(JobState::Running).is_err());
        assert_eq!(job.state(), JobState::Completed);
    }

    #[test]
    fn cancel_is_visible_through_token() {
        let job = ScrapeJob::new(vec![district("360")], JobConfig::default()).unwrap();
        let token = job.cancellation_token();
        job.cancel();
        assert!(token.is_cancelled());
        assert!(job.is_cancelled());
    }
}
