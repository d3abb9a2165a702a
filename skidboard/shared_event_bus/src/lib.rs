#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Event envelopes and publishers used to hand dashboard events to the display layer
//! and to audit sinks.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::broadcast};
use uuid::Uuid;

/// A single event as seen by the display layer or an audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Component that produced the event.
    pub source: String,
    /// Dotted event type, e.g. `data_update` or `skid.interlock.advisory`.
    pub event_type: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Event body.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventRecord {
    /// Creates a record stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Sink accepting events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes one event.
    async fn publish(&self, event: EventRecord) -> Result<()>;
}

/// In-memory bus retaining the most recent events; live listeners attach through
/// [`MemoryEventBus::listen`].
#[derive(Debug, Clone)]
pub struct MemoryEventBus {
    capacity: usize,
    sender: broadcast::Sender<EventRecord>,
    recent: Arc<Mutex<VecDeque<EventRecord>>>,
}

impl MemoryEventBus {
    /// Creates a bus keeping at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            capacity,
            sender,
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
        }
    }

    /// Attaches a live listener.
    #[must_use]
    pub fn listen(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    /// Copies the retained events, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<EventRecord> {
        self.recent.lock().iter().cloned().collect()
    }

    /// Retained events of one type.
    #[must_use]
    pub fn recent_of(&self, event_type: &str) -> Vec<EventRecord> {
        self.recent
            .lock()
            .iter()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        {
            let mut recent = self.recent.lock();
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        // No live listeners is fine.
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Appends events as JSON lines to a file.
#[derive(Debug, Clone)]
pub struct FileEventPublisher {
    path: PathBuf,
}

impl FileEventPublisher {
    /// Creates the publisher, making sure the parent directory exists.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Target file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventPublisher for FileEventPublisher {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
