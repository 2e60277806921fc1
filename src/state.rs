use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use survey_watch::api::SurveyApiClient;
use survey_watch::job::JobId;
use survey_watch::watch::{WatchConfig, WatchStopper};

/// Running watches by survey id, so they can be stopped from another command.
#[derive(Default)]
pub struct WatchRegistry {
    active: RwLock<HashMap<JobId, WatchStopper>>,
}

impl WatchRegistry {
    /// Track a watch. An older watch on the same survey is stopped.
    pub async fn insert(&self, job_id: &str, stopper: WatchStopper) {
        let previous = self.active.write().await.insert(job_id.to_string(), stopper);
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    /// Stop and forget the watch on `job_id`. Returns whether one was running.
    pub async fn stop(&self, job_id: &str) -> bool {
        match self.active.write().await.remove(job_id) {
            Some(stopper) => {
                let was_running = stopper.is_alive();
                stopper.stop();
                was_running
            }
            None => false,
        }
    }

    /// Forget a finished watch, unless it has already been replaced.
    pub async fn release(&self, job_id: &str, stopper: &WatchStopper) {
        let mut active = self.active.write().await;
        if active.get(job_id).is_some_and(|s| s.same_watch(stopper)) {
            active.remove(job_id);
        }
    }

    /// Ids of running watches. Watches that ended without being released
    /// (their handle was dropped) are pruned here.
    pub async fn active(&self) -> Vec<JobId> {
        let mut active = self.active.write().await;
        active.retain(|_, stopper| stopper.is_alive());
        let mut ids: Vec<JobId> = active.keys().cloned().collect();
        ids.sort();
        ids
    }
}

pub struct AppState {
    pub api: Arc<SurveyApiClient>,
    pub admin_ids: HashSet<u64>,
    pub watch_config: Arc<RwLock<WatchConfig>>,
    pub watches: WatchRegistry,
}

impl AppState {
    pub fn is_admin(&self, user_id: u64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}

pub type Context<'a> = poise::Context<'a, AppState, anyhow::Error>;
