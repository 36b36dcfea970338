//! Fallback sweep loop.
//!
//! The timer adapter owns the primary trigger path; this loop re-scans active
//! schedules and dispatches any whose next run time has passed. Each due
//! schedule has its next run advanced BEFORE execution so a slow run cannot
//! be double-dispatched.

use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::runner::TestRunner;

use super::ScheduleManager;

pub async fn run_sweep_loop(manager: ScheduleManager, runner: TestRunner, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "schedule sweep started");

    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        let now = Utc::now();
        let due = match manager.due_schedules(now) {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "failed to scan for due schedules");
                continue;
            }
        };

        for schedule in due {
            info!(schedule = %schedule.id, name = %schedule.name, "schedule due");

            if let Err(e) = manager.advance_next_run(schedule.id, now) {
                error!(schedule = %schedule.id, error = %e, "failed to advance next run, skipping dispatch");
                continue;
            }

            let manager = manager.clone();
            let runner = runner.clone();

            tokio::spawn(async move {
                let rec = runner
                    .run(
                        Some(schedule.id),
                        schedule.url.clone(),
                        schedule.form_config.clone(),
                        schedule.user_data.clone(),
                    )
                    .await;

                if let Err(e) = manager.record_run_completion(schedule.id, rec.id, rec.status) {
                    warn!(schedule = %schedule.id, run = %rec.id, error = %e, "failed to record run completion");
                }
            });
        }
    }
}
