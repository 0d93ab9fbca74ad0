//! Title/description generation for new jobs.
//!
//! The AI call races a short synchronous budget. On timeout the job is created
//! with synthesized defaults and the still-running call is kept; a background
//! upgrade writes its result later, but only while the record still holds the
//! default. A call that failed outright gets a separate retry loop instead.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use reelgen_ai::{AiError, GeneratedMetadata, MetadataRequest, SmartDefaults, TextGenerator};
use reelgen_core::{JobId, MetadataStatus};

use crate::jobs::RetryPolicy;
use crate::records::JobRepository;

#[derive(Debug, Clone)]
pub struct MetadataConfig {
    pub sync_budget: Duration,
    /// How long a late AI call may keep running after the budget expired.
    pub upgrade_ceiling: Duration,
    /// Per-call timeout for the retry path.
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            sync_budget: Duration::from_secs(10),
            upgrade_ceiling: Duration::from_secs(5 * 60),
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// The AI call that lost the race but is still running.
#[derive(Debug)]
pub struct PendingUpgrade {
    handle: JoinHandle<Result<GeneratedMetadata, AiError>>,
}

#[derive(Debug)]
pub struct MetadataOutcome {
    pub metadata: GeneratedMetadata,
    pub status: MetadataStatus,
    pub pending: Option<PendingUpgrade>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum UpgradeOutcome {
    Applied,
    /// The record had already left `timeout_default`.
    Discarded,
    TimedOut,
    GeneratorFailed(String),
    WriteFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RetryOutcome {
    Upgraded { attempt: u32 },
    AlreadyFinal,
    RecordMissing,
    /// Every attempt failed; the fallback text stays.
    Exhausted { attempts: u32 },
}

/// What follow-up work was started for a new job.
#[derive(Debug)]
pub enum FollowUp {
    None,
    Upgrade(JoinHandle<UpgradeOutcome>),
    Retry(JoinHandle<RetryOutcome>),
}

pub struct MetadataGenerator {
    generator: Arc<dyn TextGenerator>,
    records: Arc<dyn JobRepository>,
    config: MetadataConfig,
}

impl MetadataGenerator {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        records: Arc<dyn JobRepository>,
        config: MetadataConfig,
    ) -> Self {
        Self {
            generator,
            records,
            config,
        }
    }

    /// Race the AI call against the synchronous budget.
    #[instrument(skip(self, request), fields(template = %request.template_name, locale = %request.locale))]
    pub async fn generate(&self, request: &MetadataRequest) -> MetadataOutcome {
        let generator = Arc::clone(&self.generator);
        let owned = request.clone();
        let mut handle = tokio::spawn(async move {
            generator
                .generate(&owned)
                .await
                .and_then(GeneratedMetadata::sanitized)
        });

        match timeout(self.config.sync_budget, &mut handle).await {
            Ok(Ok(Ok(metadata))) => MetadataOutcome {
                metadata,
                status: MetadataStatus::AiGenerated,
                pending: None,
            },
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "metadata generation failed; using defaults");
                fallback(request, MetadataStatus::ErrorFallback, None)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "metadata task aborted; using defaults");
                fallback(request, MetadataStatus::ErrorFallback, None)
            }
            Err(_) => {
                info!(
                    budget_ms = self.config.sync_budget.as_millis() as u64,
                    "metadata generation exceeded budget; using defaults"
                );
                fallback(
                    request,
                    MetadataStatus::TimeoutDefault,
                    Some(PendingUpgrade { handle }),
                )
            }
        }
    }

    /// Start whatever background work the outcome calls for.
    ///
    /// Must run after the job record exists; every write here is conditional
    /// on the stored metadata status.
    pub fn follow_up(
        &self,
        job_id: JobId,
        outcome: MetadataOutcome,
        request: MetadataRequest,
    ) -> FollowUp {
        match (outcome.status, outcome.pending) {
            (MetadataStatus::TimeoutDefault, Some(pending)) => {
                FollowUp::Upgrade(self.spawn_upgrade(job_id, pending))
            }
            (MetadataStatus::ErrorFallback, _) => {
                FollowUp::Retry(self.spawn_retry(job_id, request, outcome.metadata))
            }
            _ => FollowUp::None,
        }
    }

    pub fn spawn_upgrade(&self, job_id: JobId, pending: PendingUpgrade) -> JoinHandle<UpgradeOutcome> {
        let records = Arc::clone(&self.records);
        let ceiling = self.config.upgrade_ceiling;
        tokio::spawn(async move {
            let mut handle = pending.handle;
            let outcome = match timeout(ceiling, &mut handle).await {
                Ok(Ok(Ok(metadata))) => match records
                    .update_metadata_if(
                        job_id,
                        MetadataStatus::TimeoutDefault,
                        &metadata,
                        MetadataStatus::AiGenerated,
                    )
                    .await
                {
                    Ok(true) => UpgradeOutcome::Applied,
                    Ok(false) => UpgradeOutcome::Discarded,
                    Err(e) => UpgradeOutcome::WriteFailed(e.to_string()),
                },
                Ok(Ok(Err(e))) => UpgradeOutcome::GeneratorFailed(e.to_string()),
                Ok(Err(e)) => UpgradeOutcome::GeneratorFailed(e.to_string()),
                Err(_) => {
                    handle.abort();
                    UpgradeOutcome::TimedOut
                }
            };
            match &outcome {
                UpgradeOutcome::Applied => info!(%job_id, "late metadata applied"),
                UpgradeOutcome::Discarded => debug!(%job_id, "late metadata discarded"),
                other => warn!(%job_id, outcome = ?other, "late metadata not applied"),
            }
            outcome
        })
    }

    /// Retry a failed generation with backoff.
    ///
    /// Each attempt first checks that the record is still non-final. When all
    /// attempts fail, `fallback` is written back as the permanent value.
    pub fn spawn_retry(
        &self,
        job_id: JobId,
        request: MetadataRequest,
        fallback: GeneratedMetadata,
    ) -> JoinHandle<RetryOutcome> {
        let generator = Arc::clone(&self.generator);
        let records = Arc::clone(&self.records);
        let policy = self.config.retry.clone();
        let call_timeout = self.config.call_timeout;

        tokio::spawn(async move {
            for attempt in 1..=policy.max_attempts {
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;

                match records.metadata_status(job_id).await {
                    Ok(Some(status)) if status.is_final() => return RetryOutcome::AlreadyFinal,
                    Ok(Some(_)) => {}
                    Ok(None) => return RetryOutcome::RecordMissing,
                    Err(e) => {
                        warn!(%job_id, attempt, error = %e, "metadata status unavailable");
                        continue;
                    }
                }

                let generated = match timeout(call_timeout, generator.generate(&request)).await {
                    Ok(Ok(metadata)) => metadata.sanitized(),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(AiError::InferenceFailed("call timed out".to_string())),
                };
                let metadata = match generated {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        warn!(%job_id, attempt, error = %e, "metadata retry failed");
                        continue;
                    }
                };

                match records
                    .update_metadata_if(
                        job_id,
                        MetadataStatus::ErrorFallback,
                        &metadata,
                        MetadataStatus::AiGenerated,
                    )
                    .await
                {
                    Ok(true) => {
                        info!(%job_id, attempt, "metadata upgraded on retry");
                        return RetryOutcome::Upgraded { attempt };
                    }
                    Ok(false) => return RetryOutcome::AlreadyFinal,
                    Err(e) => warn!(%job_id, attempt, error = %e, "metadata write failed"),
                }
            }

            if let Err(e) = records
                .update_metadata_if(
                    job_id,
                    MetadataStatus::ErrorFallback,
                    &fallback,
                    MetadataStatus::ErrorFallback,
                )
                .await
            {
                warn!(%job_id, error = %e, "could not persist fallback metadata");
            }
            RetryOutcome::Exhausted {
                attempts: policy.max_attempts,
            }
        })
    }
}

fn fallback(
    request: &MetadataRequest,
    status: MetadataStatus,
    pending: Option<PendingUpgrade>,
) -> MetadataOutcome {
    MetadataOutcome {
        metadata: SmartDefaults::synthesize_default(request),
        status,
        pending,
    }
}
