//! Permit checks and attempt bookkeeping on top of the store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cooldown::{ActionClass, CooldownChange, CooldownRecord};
use crate::db::Database;
use crate::error::DatabaseError;

/// Per-service view for the query boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CooldownSummary {
    pub service: String,
    pub restarts_in_window: usize,
    pub redeploys_in_window: usize,
    pub restart_permitted: bool,
    pub redeploy_permitted: bool,
    pub consecutive_healthy: u32,
}

impl CooldownSummary {
    pub fn from_record(record: &CooldownRecord, now: DateTime<Utc>) -> Self {
        Self {
            service: record.service.clone(),
            restarts_in_window: record.attempts_within(ActionClass::Restart, now),
            redeploys_in_window: record.attempts_within(ActionClass::Redeploy, now),
            restart_permitted: record.permits(ActionClass::Restart, now),
            redeploy_permitted: record.permits(ActionClass::Redeploy, now),
            consecutive_healthy: record.consecutive_healthy,
        }
    }
}

fn service_key(service: &str) -> String {
    service.trim().to_ascii_lowercase()
}

/// Sliding-window rate limiter for remediation actions.
///
/// Unknown services are unthrottled; there is no registration step.
#[derive(Clone)]
pub struct CooldownEngine {
    store: Arc<dyn Database>,
}

impl CooldownEngine {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    pub async fn permit(&self, service: &str, action: ActionClass) -> Result<bool, DatabaseError> {
        self.permit_at(service, action, Utc::now()).await
    }

    /// Whether another `action` on `service` is allowed at `now`.
    pub async fn permit_at(
        &self,
        service: &str,
        action: ActionClass,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let record = self.store.get_cooldown(&service_key(service)).await?;
        let permitted = record.permits(action, now);
        if !permitted {
            tracing::info!(
                service = %record.service,
                action = %action,
                attempts = record.attempts_within(action, now),
                limit = action.limit(),
                "Cooldown denies remediation"
            );
        }
        Ok(permitted)
    }

    pub async fn record(
        &self,
        service: &str,
        action: ActionClass,
        success: bool,
        error: Option<String>,
    ) -> Result<CooldownRecord, DatabaseError> {
        self.record_at(service, action, success, error, Utc::now())
            .await
    }

    /// Record one attempt, successful or not.
    pub async fn record_at(
        &self,
        service: &str,
        action: ActionClass,
        success: bool,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<CooldownRecord, DatabaseError> {
        let key = service_key(service);
        let record = self
            .store
            .modify_cooldown(
                &key,
                &CooldownChange::Attempt {
                    action,
                    success,
                    error,
                    at,
                },
            )
            .await?;
        tracing::debug!(
            service = %key,
            action = %action,
            success,
            in_window = record.attempts_within(action, at),
            "Remediation attempt recorded"
        );
        Ok(record)
    }

    /// Feed one health check result into the healthy streak.
    pub async fn on_health_evaluation(
        &self,
        service: &str,
        healthy: bool,
    ) -> Result<CooldownRecord, DatabaseError> {
        let key = service_key(service);
        let record = self
            .store
            .modify_cooldown(&key, &CooldownChange::Health { healthy })
            .await?;
        if healthy && record.consecutive_healthy == 0 {
            tracing::info!(service = %key, "Service stable, cooldown history cleared");
        }
        Ok(record)
    }

    pub async fn summary(&self, service: &str) -> Result<CooldownSummary, DatabaseError> {
        let record = self.store.get_cooldown(&service_key(service)).await?;
        Ok(CooldownSummary::from_record(&record, Utc::now()))
    }

    /// Summaries for every service with a stored record.
    pub async fn summaries(&self) -> Result<Vec<CooldownSummary>, DatabaseError> {
        self.summaries_at(Utc::now()).await
    }

    pub async fn summaries_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<CooldownSummary>, DatabaseError> {
        let records = self.store.list_cooldowns().await?;
        Ok(records
            .iter()
            .map(|r| CooldownSummary::from_record(r, now))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::db::JsonStore;

    async fn engine() -> (tempfile::TempDir, CooldownEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Database> = Arc::new(JsonStore::open(dir.path()).await.unwrap());
        (dir, CooldownEngine::new(store))
    }

    #[tokio::test]
    async fn test_unknown_service_is_unthrottled() {
        let (_dir, engine) = engine().await;
        assert!(engine.permit("never-seen", ActionClass::Restart).await.unwrap());
        assert!(engine.permit("never-seen", ActionClass::Redeploy).await.unwrap());
        assert!(engine.summaries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nginx_restart_window() {
        let (_dir, engine) = engine().await;
        let t = Utc::now();

        engine
            .record_at("nginx", ActionClass::Restart, true, None, t - Duration::minutes(200))
            .await
            .unwrap();
        engine
            .record_at(
                "nginx",
                ActionClass::Restart,
                false,
                Some("exit 1".into()),
                t - Duration::minutes(10),
            )
            .await
            .unwrap();

        assert!(!engine.permit_at("nginx", ActionClass::Restart, t).await.unwrap());

        // The T-200min attempt falls out of the window 40 minutes later.
        let later = t + Duration::minutes(41);
        assert!(engine.permit_at("nginx", ActionClass::Restart, later).await.unwrap());
        assert!(engine.permit_at("NGINX", ActionClass::Redeploy, t).await.unwrap());
    }

    #[tokio::test]
    async fn test_health_streak_clears_history() {
        let (_dir, engine) = engine().await;
        let now = Utc::now();
        engine
            .record_at("jellyfin", ActionClass::Redeploy, true, None, now)
            .await
            .unwrap();
        assert!(!engine.permit_at("jellyfin", ActionClass::Redeploy, now).await.unwrap());

        engine.on_health_evaluation("jellyfin", true).await.unwrap();
        assert!(!engine.permit_at("jellyfin", ActionClass::Redeploy, now).await.unwrap());

        let record = engine.on_health_evaluation("jellyfin", true).await.unwrap();
        assert!(record.redeploys.is_empty());
        assert!(engine.permit_at("jellyfin", ActionClass::Redeploy, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_summary_reports_window_counts() {
        let (_dir, engine) = engine().await;
        let now = Utc::now();
        engine
            .record_at("nginx", ActionClass::Restart, true, None, now - Duration::hours(1))
            .await
            .unwrap();
        engine
            .record_at("nginx", ActionClass::Restart, true, None, now - Duration::hours(5))
            .await
            .unwrap();

        let summaries = engine.summaries_at(now).await.unwrap();
        assert_eq!(
            summaries,
            vec![CooldownSummary {
                service: "nginx".into(),
                restarts_in_window: 1,
                redeploys_in_window: 0,
                restart_permitted: true,
                redeploy_permitted: true,
                consecutive_healthy: 0,
            }]
        );
    }
}
