//! Daily execution trigger.
//!
//! A background task that reads the cron expression from settings, sleeps
//! until the next firing in the service timezone (UTC-3), and runs one
//! execution. The expression is re-read every cycle so edits take effect
//! without a restart. Mutual exclusion with manual triggers is not enforced
//! here; the one-firing-a-day cadence is the serialization.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::core::{Orchestrator, service_offset};
use crate::store::Storage;

/// Sleep before re-checking when settings are missing or the expression is
/// unparseable.
const RETRY_PAUSE: Duration = Duration::from_secs(300);

/// Next firing of a cron expression in the service timezone.
pub fn next_fire(expression: &str) -> Result<Option<DateTime<FixedOffset>>, String> {
    let schedule =
        cron::Schedule::from_str(expression).map_err(|e| format!("invalid cron: {e}"))?;
    Ok(schedule.upcoming(service_offset()).next())
}

/// Spawn the daily trigger loop.
pub fn spawn_daily_trigger(store: Arc<dyn Storage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let expression = match store.load_settings().await {
                Ok(Some(settings)) => settings.daily_cron,
                Ok(None) => {
                    info!("No settings saved yet; daily trigger idle");
                    tokio::time::sleep(RETRY_PAUSE).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Failed to load settings for the daily trigger");
                    tokio::time::sleep(RETRY_PAUSE).await;
                    continue;
                }
            };

            let fire_at = match next_fire(&expression) {
                Ok(Some(at)) => at,
                Ok(None) => {
                    warn!(cron = %expression, "Cron expression has no upcoming firing");
                    tokio::time::sleep(RETRY_PAUSE).await;
                    continue;
                }
                Err(e) => {
                    error!(cron = %expression, error = %e, "Bad cron expression");
                    tokio::time::sleep(RETRY_PAUSE).await;
                    continue;
                }
            };

            let wait = (fire_at.with_timezone(&Utc) - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            info!(fire_at = %fire_at, "Daily trigger armed");
            tokio::time::sleep(wait).await;

            // Settings may have changed while we slept.
            match store.load_settings().await {
                Ok(Some(settings)) => {
                    let orchestrator = Orchestrator::from_settings(store.clone(), &settings);
                    match orchestrator.run(None).await {
                        Ok(execution) => info!(
                            execution = %execution.id,
                            sent = execution.messages_sent,
                            errors = execution.errors,
                            "Scheduled execution finished"
                        ),
                        Err(e) => error!(error = %e, "Scheduled execution failed"),
                    }
                }
                Ok(None) => warn!("Settings disappeared before firing; skipping"),
                Err(e) => error!(error = %e, "Failed to load settings at fire time"),
            }
        }
    })
}
