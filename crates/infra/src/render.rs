//! Render provider boundary.
//!
//! Status updates arrive on an `mpsc` channel instead of callbacks; the
//! supervisor owns the receiving end and turns terminal updates into
//! lifecycle calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio::sync::mpsc;

use reelgen_core::{JobId, UserId, VideoJob};

const UPDATE_BUFFER: usize = 32;

type RenderTable = Arc<Mutex<HashMap<String, TrackedRender>>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderParams {
    pub job_id: JobId,
    pub user_id: UserId,
    pub template_name: String,
    pub prompt: String,
    pub parameters: Map<String, JsonValue>,
}

impl From<&VideoJob> for RenderParams {
    fn from(job: &VideoJob) -> Self {
        Self {
            job_id: job.id,
            user_id: job.user_id,
            template_name: job.template_name.clone(),
            prompt: job.prompt.clone(),
            parameters: job.parameters.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderUpdate {
    Progress { percent: u8 },
    Complete { artifact_url: String },
    Error { message: String },
}

impl RenderUpdate {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RenderUpdate::Progress { .. })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("render request rejected: {0}")]
    Rejected(String),
    #[error("render provider unavailable: {0}")]
    Unavailable(String),
    #[error("unknown render job: {0}")]
    NotFound(String),
}

#[async_trait]
pub trait RenderProvider: Send + Sync + 'static {
    /// Start a render and return the provider's job id.
    async fn submit(&self, params: RenderParams) -> Result<String, ProviderError>;

    /// Status stream for a render. Closed by the provider after a terminal update.
    async fn subscribe(
        &self,
        provider_job_id: &str,
    ) -> Result<mpsc::Receiver<RenderUpdate>, ProviderError>;

    /// Ask the provider to keep reporting on a render started before a restart.
    /// `Ok(false)` means the provider no longer knows the render.
    async fn resume(&self, provider_job_id: &str, job_id: JobId) -> Result<bool, ProviderError>;
}

#[derive(Debug, Default)]
struct TrackedRender {
    job_id: Option<JobId>,
    sender: Option<mpsc::Sender<RenderUpdate>>,
    buffered: Vec<RenderUpdate>,
}

/// In-memory provider for tests/dev.
///
/// Updates emitted before anyone subscribes are buffered and replayed on
/// subscription. With `auto_complete` set, every submitted render completes on
/// its own after that delay.
#[derive(Debug)]
pub struct InMemoryRenderProvider {
    renders: RenderTable,
    submissions: Mutex<Vec<RenderParams>>,
    fail_submissions: AtomicBool,
    resumable: AtomicBool,
    auto_complete: Option<Duration>,
}

impl Default for InMemoryRenderProvider {
    fn default() -> Self {
        Self {
            renders: Arc::new(Mutex::new(HashMap::new())),
            submissions: Mutex::new(Vec::new()),
            fail_submissions: AtomicBool::new(false),
            resumable: AtomicBool::new(true),
            auto_complete: None,
        }
    }
}

impl InMemoryRenderProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto_complete(mut self, after: Duration) -> Self {
        self.auto_complete = Some(after);
        self
    }

    pub fn fail_submissions(&self, fail: bool) {
        self.fail_submissions.store(fail, Ordering::SeqCst);
    }

    pub fn set_resumable(&self, resumable: bool) {
        self.resumable.store(resumable, Ordering::SeqCst);
    }

    /// Make a render known without going through `submit`, as if it had been
    /// started by a previous process.
    pub fn register_existing(&self, provider_job_id: &str, job_id: JobId) {
        self.renders().entry(provider_job_id.to_string()).or_default().job_id = Some(job_id);
    }

    pub fn submissions(&self) -> Vec<RenderParams> {
        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn provider_id_for(&self, job_id: JobId) -> Option<String> {
        self.renders()
            .iter()
            .find(|(_, r)| r.job_id == Some(job_id))
            .map(|(id, _)| id.clone())
    }

    /// Push an update for a render. Returns `false` for unknown renders.
    pub fn emit(&self, provider_job_id: &str, update: RenderUpdate) -> bool {
        emit_into(&self.renders, provider_job_id, update)
    }

    fn renders(&self) -> MutexGuard<'_, HashMap<String, TrackedRender>> {
        lock_table(&self.renders)
    }
}

fn lock_table(table: &RenderTable) -> MutexGuard<'_, HashMap<String, TrackedRender>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn emit_into(table: &RenderTable, provider_job_id: &str, update: RenderUpdate) -> bool {
    let mut renders = lock_table(table);
    let Some(render) = renders.get_mut(provider_job_id) else {
        return false;
    };
    let terminal = update.is_terminal();
    match &render.sender {
        Some(sender) => {
            if sender.try_send(update).is_err() {
                tracing::warn!(provider_job_id, "render update dropped");
            }
        }
        None => render.buffered.push(update),
    }
    if terminal {
        render.sender = None;
    }
    true
}

#[async_trait]
impl RenderProvider for InMemoryRenderProvider {
    async fn submit(&self, params: RenderParams) -> Result<String, ProviderError> {
        if self.fail_submissions.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("submit: injected failure".to_string()));
        }
        let provider_job_id = format!("render-{}", uuid::Uuid::now_v7());
        self.register_existing(&provider_job_id, params.job_id);
        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(params);

        if let Some(after) = self.auto_complete {
            let table = Arc::clone(&self.renders);
            let id = provider_job_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let artifact_url = format!("memory://renders/{id}.mp4");
                emit_into(&table, &id, RenderUpdate::Complete { artifact_url });
            });
        }
        Ok(provider_job_id)
    }

    async fn subscribe(
        &self,
        provider_job_id: &str,
    ) -> Result<mpsc::Receiver<RenderUpdate>, ProviderError> {
        let mut renders = self.renders();
        let Some(render) = renders.get_mut(provider_job_id) else {
            return Err(ProviderError::NotFound(provider_job_id.to_string()));
        };
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        let mut terminal = false;
        for update in render.buffered.drain(..) {
            terminal |= update.is_terminal();
            let _ = tx.try_send(update);
        }
        if !terminal {
            render.sender = Some(tx);
        }
        Ok(rx)
    }

    async fn resume(&self, provider_job_id: &str, _job_id: JobId) -> Result<bool, ProviderError> {
        if !self.resumable.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(self.renders().contains_key(provider_job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RenderParams {
        RenderParams {
            job_id: JobId::new(),
            user_id: UserId::new(),
            template_name: "promo".to_string(),
            prompt: "summer sale".to_string(),
            parameters: Map::new(),
        }
    }

    #[tokio::test]
    async fn updates_emitted_before_subscribe_are_replayed() {
        let provider = InMemoryRenderProvider::new();
        let id = provider.submit(params()).await.unwrap();

        assert!(provider.emit(&id, RenderUpdate::Progress { percent: 40 }));
        assert!(provider.emit(&id, RenderUpdate::Complete { artifact_url: "u".to_string() }));

        let mut rx = provider.subscribe(&id).await.unwrap();
        assert_eq!(rx.recv().await, Some(RenderUpdate::Progress { percent: 40 }));
        assert_eq!(rx.recv().await, Some(RenderUpdate::Complete { artifact_url: "u".to_string() }));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn unknown_render_cannot_be_subscribed_or_resumed() {
        let provider = InMemoryRenderProvider::new();
        assert!(matches!(provider.subscribe("nope").await, Err(ProviderError::NotFound(_))));
        assert!(!provider.resume("nope", JobId::new()).await.unwrap());
        assert!(!provider.emit("nope", RenderUpdate::Progress { percent: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_complete_finishes_renders() {
        let provider = InMemoryRenderProvider::new().with_auto_complete(Duration::from_secs(30));
        let submitted = params();
        let job_id = submitted.job_id;
        let id = provider.submit(submitted).await.unwrap();
        let mut rx = provider.subscribe(&id).await.unwrap();

        match rx.recv().await {
            Some(RenderUpdate::Complete { artifact_url }) => assert!(artifact_url.contains(&id)),
            other => panic!("unexpected update: {other:?}"),
        }
        assert_eq!(provider.provider_id_for(job_id), Some(id));
    }
}
