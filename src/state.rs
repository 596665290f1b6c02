use crate::assistant::{HttpLlmClient, LlmClient};
use crate::config::ServerConfig;
use crate::errors::{AssistantUnavailable, SessionNotFound, UploadError};
use crate::model::{SessionId, WorkbookSummary};
use crate::session::WorkbookSession;
use anyhow::Result;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::task;

pub type SharedSession = Arc<Mutex<WorkbookSession>>;

pub struct AppState {
    config: Arc<ServerConfig>,
    sessions: RwLock<LruCache<SessionId, SharedSession>>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl AppState {
    pub fn new(config: Arc<ServerConfig>) -> Result<Self> {
        let llm: Option<Arc<dyn LlmClient>> = if config.assistant.is_enabled() {
            Some(Arc::new(HttpLlmClient::new(&config.assistant)?))
        } else {
            tracing::warn!("no API key configured; chat is disabled");
            None
        };
        Ok(Self::build(config, llm))
    }

    pub fn with_llm_client(config: Arc<ServerConfig>, client: Arc<dyn LlmClient>) -> Self {
        Self::build(config, Some(client))
    }

    fn build(config: Arc<ServerConfig>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            sessions: RwLock::new(LruCache::new(capacity)),
            llm,
        }
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }

    pub fn assistant_enabled(&self) -> bool {
        self.llm.is_some()
    }

    pub fn llm(&self) -> Result<Arc<dyn LlmClient>> {
        self.llm.clone().ok_or_else(|| AssistantUnavailable.into())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Parse an upload and register a new session. The least recently used session is
    /// evicted when the cache is full.
    pub async fn open_session(&self, bytes: Vec<u8>, file_name: String) -> Result<WorkbookSummary> {
        if let Some(limit) = self.config.max_upload_bytes()
            && bytes.len() > limit
        {
            return Err(UploadError::TooLarge {
                size: bytes.len(),
                limit,
            }
            .into());
        }

        let session =
            task::spawn_blocking(move || WorkbookSession::open(bytes, &file_name)).await??;
        let summary = session.summary();
        let id = session.id().clone();

        let evicted = self
            .sessions
            .write()
            .push(id, Arc::new(Mutex::new(session)));
        if let Some((old_id, _)) = evicted
            && old_id != summary.session_id
        {
            tracing::info!(session_id = %old_id, "evicted workbook session");
        }
        Ok(summary)
    }

    pub fn session(&self, id: &SessionId) -> Result<SharedSession> {
        let mut sessions = self.sessions.write();
        sessions
            .get(id)
            .cloned()
            .ok_or_else(|| SessionNotFound(id.to_string()).into())
    }

    pub fn close_session(&self, id: &SessionId) -> Result<()> {
        match self.sessions.write().pop(id) {
            Some(_) => {
                tracing::info!(session_id = %id, "closed workbook session");
                Ok(())
            }
            None => Err(SessionNotFound(id.to_string()).into()),
        }
    }

    /// Run `f` against a session on the blocking pool.
    pub async fn with_session<T, F>(&self, id: &SessionId, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut WorkbookSession) -> Result<T> + Send + 'static,
    {
        let session = self.session(id)?;
        task::spawn_blocking(move || {
            let mut guard = session.lock();
            f(&mut guard)
        })
        .await?
    }
}
