//! Worker loop of a bulk job's pool.
//!
//! A worker only claims and runs: every decision about job/task state is taken
//! by the manager under the job's runtime lock.

use std::sync::Arc;

use tracing::{Instrument, debug, error, info_span};

use specscout_core::JobId;

use super::manager::{JobRuntime, ManagerCore, Step};
use super::runners::TaskOutcome;
use crate::emit::BusSink;

pub(super) async fn run_worker(core: Arc<ManagerCore>, runtime: Arc<JobRuntime>, job_id: JobId, worker: u32) {
    let span = info_span!("bulk_worker", job_id = %job_id, worker);
    async move {
        debug!("worker started");
        loop {
            let step = match core.next_step(&runtime, job_id) {
                Ok(step) => step,
                Err(e) => {
                    error!(error = %e, "worker stopped on manager error");
                    if let Ok(mut state) = runtime.lock() {
                        state.active = state.active.saturating_sub(1);
                    }
                    break;
                }
            };

            match step {
                Step::Exit => break,
                Step::Idle(wait) => {
                    tokio::select! {
                        _ = runtime.wake.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Step::Run(job, task) => {
                    let outcome = match core.runner(job.job_type) {
                        Some(runner) => {
                            let sink = BusSink::new(Arc::clone(&core.bus), job_id.to_string())
                                .for_task(task.external_id.clone());
                            runner.run(&job, &task, &sink).await
                        }
                        None => TaskOutcome::failed(format!("no runner for {} jobs", job.job_type)),
                    };
                    debug!(task = %task.external_id, done = outcome.is_done(), "task finished");
                    if let Err(e) = core.apply_outcome(&runtime, job_id, task.id, outcome) {
                        error!(task = %task.external_id, error = %e, "failed to apply task outcome");
                    }
                }
            }
        }
        debug!("worker exited");
    }
    .instrument(span)
    .await
}
