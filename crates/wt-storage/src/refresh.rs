//! Daily refresh bookkeeping: one persisted last-refresh timestamp.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[async_trait]
pub trait RefreshStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<DateTime<Utc>>>;
    async fn save(&self, at: DateTime<Utc>) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RefreshRecord {
    last_refresh: DateTime<Utc>,
}

/// JSON file holding the single `last_refresh` key.
#[derive(Debug, Clone)]
pub struct FileRefreshStore {
    path: PathBuf,
}

impl FileRefreshStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RefreshStore for FileRefreshStore {
    async fn load(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking refresh state {}", self.path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading refresh state {}", self.path.display()))?;
        let record: RefreshRecord = serde_json::from_str(&text)
            .with_context(|| format!("parsing refresh state {}", self.path.display()))?;
        Ok(Some(record.last_refresh))
    }

    /// Replace the file atomically via temp-file rename.
    async fn save(&self, at: DateTime<Utc>) -> anyhow::Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating refresh state directory {}", parent.display()))?;

        let bytes = serde_json::to_vec_pretty(&RefreshRecord { last_refresh: at })
            .context("serializing refresh state")?;
        let temp_path = parent.join(format!(".{}.refresh.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp refresh file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp refresh file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp refresh file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming refresh state {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRefreshStore {
    value: Mutex<Option<DateTime<Utc>>>,
}

#[async_trait]
impl RefreshStore for MemoryRefreshStore {
    async fn load(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(*self.value.lock().await)
    }

    async fn save(&self, at: DateTime<Utc>) -> anyhow::Result<()> {
        *self.value.lock().await = Some(at);
        Ok(())
    }
}

/// Decides once per calendar day that cached globe data should be reloaded.
pub struct RefreshScheduler {
    store: Arc<dyn RefreshStore>,
    offset: FixedOffset,
    /// Day signalled to the host but not yet recorded as refreshed.
    claim: Mutex<Option<NaiveDate>>,
}

impl RefreshScheduler {
    pub fn new(store: Arc<dyn RefreshStore>) -> Self {
        Self {
            store,
            offset: Utc.fix(),
            claim: Mutex::new(None),
        }
    }

    /// Calendar days are compared in this offset instead of UTC.
    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub async fn should_refresh(&self) -> bool {
        self.should_refresh_at(Utc::now()).await
    }

    /// An unreadable store counts as "never refreshed".
    pub async fn should_refresh_at(&self, now: DateTime<Utc>) -> bool {
        match self.store.load().await {
            Ok(None) => true,
            Ok(Some(last)) => self.calendar_day(last) != self.calendar_day(now),
            Err(err) => {
                warn!(error = %err, "refresh state unreadable; forcing refresh");
                true
            }
        }
    }

    pub async fn mark_refreshed(&self) -> anyhow::Result<()> {
        self.mark_refreshed_at(Utc::now()).await
    }

    pub async fn mark_refreshed_at(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let mut claim = self.claim.lock().await;
        self.record(now).await?;
        *claim = None;
        Ok(())
    }

    pub async fn claim_due(&self) -> bool {
        self.claim_due_at(Utc::now()).await
    }

    /// True at most once per due day until the claim is recorded or released.
    /// Nothing is persisted; call `mark_refreshed` once the reload has run.
    pub async fn claim_due_at(&self, now: DateTime<Utc>) -> bool {
        let mut claim = self.claim.lock().await;
        let today = self.calendar_day(now);
        if *claim == Some(today) || !self.should_refresh_at(now).await {
            return false;
        }
        *claim = Some(today);
        true
    }

    /// Give up a claim so a later check can signal again.
    pub async fn release_claim(&self) {
        *self.claim.lock().await = None;
    }

    pub async fn check_and_mark(&self) -> anyhow::Result<bool> {
        self.check_and_mark_at(Utc::now()).await
    }

    /// Check and record in one step so two ticks cannot both claim the same day.
    pub async fn check_and_mark_at(&self, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let mut claim = self.claim.lock().await;
        if !self.should_refresh_at(now).await {
            return Ok(false);
        }
        self.record(now).await?;
        *claim = None;
        Ok(true)
    }

    pub async fn last_refresh(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        self.store.load().await
    }

    async fn record(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        self.store.save(now).await?;
        info!(last_refresh = %now, "recorded refresh");
        Ok(())
    }

    fn calendar_day(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }
}
