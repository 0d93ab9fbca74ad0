//! End-to-end tests over the wired service.
//!
//! Tests: submit → admit/queue → render → finalize → drain
//!
//! Verifies:
//! - The system cap queues work and the drain loop picks it up
//! - Stuck renders are reaped and refunded exactly once
//! - Slow metadata is upgraded after the job is accepted
//! - Memory and storage agree once work settles

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::Map;

    use reelgen_ai::{GeneratedMetadata, InMemoryTextGenerator};
    use reelgen_core::{JobId, JobStatus, MetadataStatus, NewVideoJob, Tier, UserId};

    use crate::config::SchedulerConfig;
    use crate::ledger::CreditReason;
    use crate::reaper::SweepReport;
    use crate::records::JobRepository;
    use crate::render::{InMemoryRenderProvider, RenderUpdate};
    use crate::scheduler::{SubmitError, SubmitRequest, SubmitStatus};
    use crate::service::{GenerationService, InMemoryPorts};

    fn config(system_max: usize) -> SchedulerConfig {
        SchedulerConfig {
            system_max_concurrent: system_max,
            ..SchedulerConfig::default()
        }
    }

    fn setup(system_max: usize, ports: &InMemoryPorts) -> Arc<GenerationService> {
        GenerationService::new(config(system_max), ports.ports()).unwrap()
    }

    fn request(user_id: UserId) -> SubmitRequest {
        SubmitRequest {
            user_id,
            template_name: "product-showcase".to_string(),
            prompt: "espresso machine on a kitchen counter".to_string(),
            parameters: Map::new(),
            credits_cost: 10,
            priority: 0,
            ui_locale: Some("en".to_string()),
        }
    }

    fn funded(ports: &InMemoryPorts) -> UserId {
        let user = UserId::new();
        ports.ledger.set_balance(user, 100);
        user
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_job_is_promoted_after_the_first_completes() {
        let ports = InMemoryPorts::new(
            InMemoryRenderProvider::new().with_auto_complete(Duration::from_secs(60)),
            InMemoryTextGenerator::new(),
        );
        let service = setup(1, &ports);
        let handle = service.start().await.unwrap();
        let (alice, bob) = (funded(&ports), funded(&ports));

        let first = service.scheduler().submit(request(alice)).await.unwrap();
        let second = service.scheduler().submit(request(bob)).await.unwrap();
        assert_eq!(first.status, SubmitStatus::Processing);
        assert_eq!(second.status, SubmitStatus::Queued);
        assert_eq!(second.queue_position, Some(1));

        // Render finishes at 60s, the drain follows after the configured delay.
        tokio::time::sleep(Duration::from_secs(62)).await;
        settle().await;

        let first_record = ports.records.snapshot(first.job_id).unwrap();
        assert_eq!(first_record.status, JobStatus::Completed);
        assert!(first_record.result_url.is_some());

        let second_record = ports.records.snapshot(second.job_id).unwrap();
        assert_eq!(second_record.status, JobStatus::Processing);
        assert_eq!(second_record.queue_position, None);
        assert!(service.store().is_active(second.job_id));
        assert_eq!(service.store().queued_len(), 0);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn basic_tier_allows_two_then_refuses() {
        let ports = InMemoryPorts::default();
        let service = setup(5, &ports);
        let user = funded(&ports);
        ports.directory.set_tier(user, Tier::Basic);

        service.scheduler().submit(request(user)).await.unwrap();
        service.scheduler().submit(request(user)).await.unwrap();
        let err = service.scheduler().submit(request(user)).await.unwrap_err();

        assert!(matches!(
            err,
            SubmitError::ConcurrencyLimit {
                active_count: 2,
                max_allowed: 2,
                ..
            }
        ));
        assert_eq!(ports.ledger.balance(user), 80);
    }

    #[tokio::test]
    async fn stuck_render_is_reaped_and_refunded_once() {
        let ports = InMemoryPorts::default();
        let service = setup(5, &ports);
        let user = UserId::new();
        ports.ledger.set_balance(user, 0);

        let started = Utc::now() - chrono::Duration::minutes(45);
        let mut job = NewVideoJob {
            id: JobId::new(),
            user_id: user,
            credits_charged: 10,
            template_name: "promo".to_string(),
            prompt: "left running by a crashed worker".to_string(),
            parameters: Map::new(),
            priority: 0,
            locale: "en".to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            metadata_status: MetadataStatus::AiGenerated,
        }
        .into_record(started);
        job.status = JobStatus::Processing;
        job.processing_started_at = Some(started);
        ports.records.insert(job.clone());
        service.store().add_active(job.id, user, started);

        let report = match service.reaper().sweep().await {
            SweepReport::Completed(report) => report,
            SweepReport::Skipped { .. } => panic!("first sweep must run"),
        };
        assert_eq!(report.zombies.len(), 1);

        let record = ports.records.snapshot(job.id).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(!service.store().is_active(job.id));
        assert_eq!(ports.ledger.refunded_for(job.id), 10);

        // A late completion from the provider must not refund or revive it.
        let late = service.lifecycle().complete(job.id, Some("memory://late.mp4".to_string())).await;
        assert!(!late.has_failures());
        assert_eq!(ports.ledger.refunded_for(job.id), 10);
        assert_eq!(
            ports.records.snapshot(job.id).unwrap().status,
            JobStatus::Failed
        );
        assert!(matches!(service.reaper().sweep().await, SweepReport::Skipped { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_metadata_is_upgraded_after_acceptance() {
        let text = InMemoryTextGenerator::new();
        text.push_reply(
            Duration::from_secs(20),
            GeneratedMetadata::new("Espresso, Reimagined", "A slow pan across chrome."),
        );
        let ports = InMemoryPorts::new(InMemoryRenderProvider::new(), text);
        let service = setup(5, &ports);
        let user = funded(&ports);

        let began = tokio::time::Instant::now();
        let result = service.scheduler().submit(request(user)).await.unwrap();
        assert!(began.elapsed() < Duration::from_secs(11));
        assert_eq!(
            ports.records.snapshot(result.job_id).unwrap().metadata_status,
            MetadataStatus::TimeoutDefault
        );

        tokio::time::sleep(Duration::from_secs(11)).await;
        settle().await;

        let record = ports.records.snapshot(result.job_id).unwrap();
        assert_eq!(record.metadata_status, MetadataStatus::AiGenerated);
        assert_eq!(record.title, "Espresso, Reimagined");
    }

    #[tokio::test]
    async fn kickoff_and_creation_failures_leak_no_credits() {
        let ports = InMemoryPorts::default();
        let service = setup(5, &ports);
        let (kicked, created) = (funded(&ports), funded(&ports));

        ports.provider.fail_submissions(true);
        let accepted = service.scheduler().submit(request(kicked)).await.unwrap();
        for _ in 0..50 {
            if ports.records.snapshot(accepted.job_id).map(|r| r.status) == Some(JobStatus::Failed) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(ports.ledger.balance(kicked), 100);
        assert!(ports
            .ledger
            .entries_for(accepted.job_id)
            .iter()
            .any(|e| e.reason == CreditReason::RenderKickoffFailed));

        ports.records.fail_creates(true);
        let err = service.scheduler().submit(request(created)).await.unwrap_err();
        assert!(matches!(err, SubmitError::PersistenceFailed(_)));
        assert_eq!(ports.ledger.balance(created), 100);
        assert_eq!(service.store().active_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_matches_storage_once_work_settles() {
        let ports = InMemoryPorts::new(
            InMemoryRenderProvider::new(),
            InMemoryTextGenerator::new(),
        );
        let service = setup(2, &ports);
        let handle = service.start().await.unwrap();
        let users: Vec<_> = (0..4).map(|_| funded(&ports)).collect();

        let mut accepted = Vec::new();
        for user in &users {
            accepted.push(service.scheduler().submit(request(*user)).await.unwrap());
        }
        assert_eq!(service.store().active_len(), 2);
        assert_eq!(service.store().queued_len(), 2);
        assert!(service.recovery().validate().await.is_consistent());

        // Finish everything the provider has seen until the queue is empty.
        for _ in 0..4 {
            for result in &accepted {
                if let Some(pid) = ports.provider.provider_id_for(result.job_id) {
                    ports.provider.emit(
                        &pid,
                        RenderUpdate::Complete {
                            artifact_url: format!("memory://{}.mp4", result.job_id),
                        },
                    );
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            settle().await;
        }

        for result in &accepted {
            let record = ports.records.get(result.job_id).await.unwrap().unwrap();
            assert_eq!(record.status, JobStatus::Completed);
        }
        assert_eq!(service.store().active_len(), 0);
        assert_eq!(service.store().queued_len(), 0);
        assert!(service.recovery().validate().await.is_consistent());

        handle.shutdown().await;
    }
}
