use std::{
    collections::{HashMap, HashSet},
    fs,
    path::Path,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Physical I/O pin number, as resolved by the deployment configuration.
pub type Pin = u16;

/// Identifier of a peer controller application (pump, solar, sensor).
pub type ControllerId = String;

/// Value stored under a process tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    /// Boolean tag.
    Bool(bool),
    /// Numeric tag.
    Number(f64),
    /// Text tag (operating states and the like).
    Text(String),
}

impl TagValue {
    /// Numeric view; text and booleans are not numbers.
    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// Text view.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

/// Host process-tag store. Reads return `None` when the store has no value.
#[async_trait]
pub trait TagSource: Send + Sync {
    /// Reads an analog input.
    async fn read_analog(&self, pin: Pin) -> Option<f64>;

    /// Reads back the current state of a digital output.
    async fn read_digital_output(&self, pin: Pin) -> Option<bool>;

    /// Drives a digital output.
    async fn write_digital_output(&self, pin: Pin, value: bool) -> Result<(), SyncError>;

    /// Reads a tag published by another controller application.
    async fn read_tag(&self, name: &str, owner: &str) -> Option<TagValue>;
}

#[derive(Debug, Default)]
struct MemoryTags {
    analog: HashMap<Pin, f64>,
    outputs: HashMap<Pin, bool>,
    tags: HashMap<(String, String), TagValue>,
    rejected_writes: HashSet<Pin>,
    stuck_outputs: HashSet<Pin>,
    writes: Vec<(Pin, bool)>,
}

/// In-memory tag store. Used by tests and to run the dashboard without the host agent.
#[derive(Debug, Default)]
pub struct MemoryTagSource {
    inner: RwLock<MemoryTags>,
}

impl MemoryTagSource {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON seed document:
    ///
    /// ```json
    /// { "analog": { "1": 2.4 }, "outputs": { "5": true },
    ///   "tags": { "pump-1": { "AppState": "auto", "FlowRate": 3.2 } } }
    /// ```
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading tag seed {}", path.display()))?;
        let seed: TagSeed =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::from_seed(seed))
    }

    fn from_seed(seed: TagSeed) -> Self {
        let source = Self::new();
        {
            let mut inner = source.inner.write();
            inner.analog = seed.analog;
            inner.outputs = seed.outputs;
            for (owner, tags) in seed.tags {
                for (name, value) in tags {
                    inner.tags.insert((name, owner.clone()), value);
                }
            }
        }
        source
    }

    /// Sets an analog input value.
    pub fn set_analog(&self, pin: Pin, value: f64) {
        self.inner.write().analog.insert(pin, value);
    }

    /// Removes an analog input value.
    pub fn clear_analog(&self, pin: Pin) {
        self.inner.write().analog.remove(&pin);
    }

    /// Sets the state of a digital output without recording a write.
    pub fn set_output(&self, pin: Pin, value: bool) {
        self.inner.write().outputs.insert(pin, value);
    }

    /// Forgets a digital output so reads return `None`.
    pub fn clear_output(&self, pin: Pin) {
        self.inner.write().outputs.remove(&pin);
    }

    /// Sets a tag owned by `owner`.
    pub fn set_tag(&self, owner: &str, name: &str, value: impl Into<TagValue>) {
        self.inner
            .write()
            .tags
            .insert((name.to_owned(), owner.to_owned()), value.into());
    }

    /// Removes a tag.
    pub fn clear_tag(&self, owner: &str, name: &str) {
        self.inner
            .write()
            .tags
            .remove(&(name.to_owned(), owner.to_owned()));
    }

    /// Makes writes to `pin` fail.
    pub fn reject_writes(&self, pin: Pin) {
        self.inner.write().rejected_writes.insert(pin);
    }

    /// Makes writes to `pin` succeed without changing the output.
    pub fn stick_output(&self, pin: Pin) {
        self.inner.write().stuck_outputs.insert(pin);
    }

    /// Accepted writes, oldest first.
    #[must_use]
    pub fn writes(&self) -> Vec<(Pin, bool)> {
        self.inner.read().writes.clone()
    }
}

#[async_trait]
impl TagSource for MemoryTagSource {
    async fn read_analog(&self, pin: Pin) -> Option<f64> {
        self.inner.read().analog.get(&pin).copied()
    }

    async fn read_digital_output(&self, pin: Pin) -> Option<bool> {
        self.inner.read().outputs.get(&pin).copied()
    }

    async fn write_digital_output(&self, pin: Pin, value: bool) -> Result<(), SyncError> {
        let mut inner = self.inner.write();
        if inner.rejected_writes.contains(&pin) {
            return Err(SyncError::WriteFailure {
                pin,
                reason: "output rejected write".into(),
            });
        }
        inner.writes.push((pin, value));
        if !inner.stuck_outputs.contains(&pin) {
            inner.outputs.insert(pin, value);
        }
        Ok(())
    }

    async fn read_tag(&self, name: &str, owner: &str) -> Option<TagValue> {
        self.inner
            .read()
            .tags
            .get(&(name.to_owned(), owner.to_owned()))
            .cloned()
    }
}

#[derive(Debug, Default, Deserialize)]
struct TagSeed {
    #[serde(default)]
    analog: HashMap<Pin, f64>,
    #[serde(default)]
    outputs: HashMap<Pin, bool>,
    #[serde(default)]
    tags: HashMap<String, HashMap<String, TagValue>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn writes_update_outputs_unless_stuck() {
        let tags = MemoryTagSource::new();
        tags.write_digital_output(4, false).await.unwrap();
        assert_eq!(tags.read_digital_output(4).await, Some(false));

        tags.stick_output(4);
        tags.write_digital_output(4, true).await.unwrap();
        assert_eq!(tags.read_digital_output(4).await, Some(false));
        assert_eq!(tags.writes(), vec![(4, false), (4, true)]);
    }

    #[tokio::test]
    async fn rejected_writes_are_not_recorded() {
        let tags = MemoryTagSource::new();
        tags.reject_writes(4);
        let err = tags.write_digital_output(4, true).await.unwrap_err();
        assert!(matches!(err, SyncError::WriteFailure { pin: 4, .. }));
        assert!(tags.writes().is_empty());
    }

    #[tokio::test]
    async fn loads_seed_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tags.json");
        fs::write(
            &path,
            r#"{
                "analog": { "1": 2.5 },
                "outputs": { "7": true },
                "tags": { "pump-1": { "AppState": "auto", "FlowRate": 3.5 } }
            }"#,
        )
        .unwrap();
        let tags = MemoryTagSource::from_json_file(&path).unwrap();
        assert_eq!(tags.read_analog(1).await, Some(2.5));
        assert_eq!(tags.read_digital_output(7).await, Some(true));
        assert_eq!(
            tags.read_tag("AppState", "pump-1").await,
            Some(TagValue::Text("auto".into()))
        );
        assert_eq!(
            tags.read_tag("FlowRate", "pump-1").await.and_then(|v| v.as_f64()),
            Some(3.5)
        );
    }
}
