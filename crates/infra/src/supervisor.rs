//! Drives a render from submission to a terminal lifecycle call.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use reelgen_core::{JobId, UserId, VideoJob};

use crate::lifecycle::LifecycleHandler;
use crate::reaper::ReaperService;
use crate::records::JobRepository;
use crate::render::{RenderParams, RenderProvider, RenderUpdate};

pub struct RenderSupervisor {
    provider: Arc<dyn RenderProvider>,
    records: Arc<dyn JobRepository>,
    lifecycle: Arc<LifecycleHandler>,
    reaper: Arc<ReaperService>,
}

impl RenderSupervisor {
    pub fn new(
        provider: Arc<dyn RenderProvider>,
        records: Arc<dyn JobRepository>,
        lifecycle: Arc<LifecycleHandler>,
        reaper: Arc<ReaperService>,
    ) -> Self {
        Self {
            provider,
            records,
            lifecycle,
            reaper,
        }
    }

    /// Submit a render for a job already marked `processing` and watch it.
    ///
    /// A rejected submission finalizes the job as failed with a refund.
    pub fn launch(self: &Arc<Self>, job: VideoJob) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let deadline = Instant::now() + this.reaper.zombie_timeout();
            let provider_job_id = match this.provider.submit(RenderParams::from(&job)).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "render submission failed");
                    let message = format!("Failed to start video generation: {e}");
                    this.lifecycle.fail_kickoff(job.id, &message).await;
                    return;
                }
            };
            info!(job_id = %job.id, %provider_job_id, "render started");

            if let Err(e) = this
                .records
                .set_provider_job_id(job.id, &provider_job_id)
                .await
            {
                warn!(job_id = %job.id, error = %e, "could not store provider job id");
            }

            this.watch(job.id, job.user_id, &provider_job_id, deadline)
                .await;
        })
    }

    /// Reattach to a render started by a previous process.
    ///
    /// Returns `false` when the provider no longer knows the render; the
    /// caller decides what happens to the job then.
    pub async fn resume(
        self: &Arc<Self>,
        job_id: JobId,
        user_id: UserId,
        provider_job_id: &str,
        remaining: Duration,
    ) -> bool {
        match self.provider.resume(provider_job_id, job_id).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                warn!(%job_id, provider_job_id, error = %e, "render resume failed");
                return false;
            }
        }

        let this = Arc::clone(self);
        let provider_job_id = provider_job_id.to_string();
        let deadline = Instant::now() + remaining;
        tokio::spawn(async move {
            this.watch(job_id, user_id, &provider_job_id, deadline).await;
        });
        true
    }

    async fn watch(&self, job_id: JobId, user_id: UserId, provider_job_id: &str, deadline: Instant) {
        match self.provider.subscribe(provider_job_id).await {
            Ok(rx) => self.supervise(job_id, user_id, rx, deadline).await,
            // The render may still report through the webhook; the reaper
            // covers the case where it never does.
            Err(e) => warn!(%job_id, provider_job_id, error = %e, "render status subscription failed"),
        }
    }

    async fn supervise(
        &self,
        job_id: JobId,
        user_id: UserId,
        mut rx: mpsc::Receiver<RenderUpdate>,
        deadline: Instant,
    ) {
        let timer = tokio::time::sleep_until(deadline);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                update = rx.recv() => match update {
                    Some(RenderUpdate::Progress { percent }) => {
                        debug!(%job_id, percent, "render progress");
                    }
                    Some(RenderUpdate::Complete { artifact_url }) => {
                        self.lifecycle.complete(job_id, Some(artifact_url)).await;
                        return;
                    }
                    Some(RenderUpdate::Error { message }) => {
                        self.lifecycle.fail(job_id, &message).await;
                        return;
                    }
                    None => {
                        warn!(%job_id, "render status stream closed without a result");
                        return;
                    }
                },
                _ = &mut timer => {
                    if self.settled_elsewhere(job_id).await {
                        return;
                    }
                    warn!(%job_id, "render exceeded the processing timeout");
                    self.reaper.handle_zombie(job_id, user_id).await;
                    return;
                }
            }
        }
    }

    /// True when the job was finalized through another path (webhook,
    /// operator) while this watcher waited on a silent stream.
    async fn settled_elsewhere(&self, job_id: JobId) -> bool {
        match self.records.get(job_id).await {
            Ok(Some(job)) if job.is_terminal() => {
                debug!(%job_id, status = %job.status, "render deadline passed after finalization");
                true
            }
            Ok(None) => {
                debug!(%job_id, "render deadline passed for a missing record");
                true
            }
            Ok(Some(_)) => false,
            // Unknown state: let the reaper's own checks decide.
            Err(e) => {
                debug!(%job_id, error = %e, "record read failed at render deadline");
                false
            }
        }
    }
}
