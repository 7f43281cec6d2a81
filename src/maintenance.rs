// =============================================================================
// Maintenance Scheduler — hourly housekeeping across collaborators
// =============================================================================
//
// Passes are anchored to a fixed schedule: the n-th pass is due n hours after
// the scheduler started, whatever the previous pass took. Each registered
// delegate runs once per pass; one failing delegate is logged and never
// stops its siblings or the schedule.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::notify::{notify_best_effort, SystemEvent};
use crate::ports::{Maintainable, MaintenanceContext, NotificationSink};
use crate::run_flag::RunFlag;
use crate::runtime_config::PolledConfig;
use crate::types::now_ms;

pub const MAINTENANCE_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Summary of one maintenance pass.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenancePass {
    pub started_at: DateTime<Utc>,
    pub context: MaintenanceContext,
    pub succeeded: Vec<&'static str>,
    pub failed: Vec<&'static str>,
}

pub struct MaintenanceScheduler {
    delegates: Vec<Arc<dyn Maintainable>>,
    config: Arc<PolledConfig>,
    notifier: Arc<dyn NotificationSink>,
    period: Duration,
    last_pass: RwLock<Option<MaintenancePass>>,
}

impl MaintenanceScheduler {
    pub fn new(
        delegates: Vec<Arc<dyn Maintainable>>,
        config: Arc<PolledConfig>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            delegates,
            config,
            notifier,
            period: MAINTENANCE_PERIOD,
            last_pass: RwLock::new(None),
        }
    }

    pub fn last_pass(&self) -> Option<MaintenancePass> {
        self.last_pass.read().clone()
    }

    pub async fn run(&self, shutdown: &RunFlag) {
        let names: Vec<&'static str> = self.delegates.iter().map(|d| d.name()).collect();
        info!(
            period_secs = self.period.as_secs(),
            delegates = ?names,
            "maintenance scheduler started"
        );

        // First pass one period from now, then on the same grid.
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.stopped() => break,
            }
            if !shutdown.is_running() {
                break;
            }
            self.run_pass(now_ms()).await;
        }

        info!("maintenance scheduler stopped");
    }

    /// Invoke every delegate once with a shared context.
    pub async fn run_pass(&self, now_ms: i64) -> MaintenancePass {
        let cfg = self.config.current();
        let context = MaintenanceContext {
            now_ms,
            retention_ms: cfg.effective_retention_ms(),
        };

        let mut pass = MaintenancePass {
            started_at: Utc::now(),
            context,
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        for delegate in &self.delegates {
            match delegate.cleanup(&context).await {
                Ok(()) => pass.succeeded.push(delegate.name()),
                Err(e) => {
                    error!(component = delegate.name(), error = %e, "cleanup failed");
                    pass.failed.push(delegate.name());
                }
            }
        }

        info!(
            succeeded = pass.succeeded.len(),
            failed = pass.failed.len(),
            retention_ms = context.retention_ms,
            "maintenance pass complete"
        );
        notify_best_effort(
            self.notifier.as_ref(),
            SystemEvent::MaintenanceCompleted {
                succeeded: pass.succeeded.len(),
                failed: pass.failed.len(),
            },
        );
        *self.last_pass.write() = Some(pass.clone());
        pass
    }
}
