//! Where audit events go: nowhere, the console, memory or a JSON Lines file.

use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::AuditError;
use crate::event::AuditEvent;
use crate::logger::AuditFilter;

/// Destination for audit events.
#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Store an audit event.
    async fn store(&self, event: AuditEvent) -> Result<(), AuditError>;

    /// Query audit events with filters.
    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEvent>, AuditError>;

    /// Count events matching a filter, ignoring limit and offset.
    async fn count(&self, filter: AuditFilter) -> Result<usize, AuditError> {
        let unpaged = AuditFilter {
            limit: None,
            offset: None,
            ..filter
        };
        Ok(self.query(unpaged).await?.len())
    }

    /// Get an audit event by ID.
    async fn get(&self, event_id: Uuid) -> Result<Option<AuditEvent>, AuditError>;
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullStorage;

impl NullStorage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditStorage for NullStorage {
    async fn store(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }

    async fn query(&self, _filter: AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(vec![])
    }

    async fn get(&self, _event_id: Uuid) -> Result<Option<AuditEvent>, AuditError> {
        Ok(None)
    }
}

/// Console storage (human-readable lines on stdout).
#[derive(Debug, Default)]
pub struct ConsoleStorage;

impl ConsoleStorage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditStorage for ConsoleStorage {
    async fn store(&self, event: AuditEvent) -> Result<(), AuditError> {
        println!("{}", event.to_log_line());
        Ok(())
    }

    async fn query(&self, _filter: AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(vec![])
    }

    async fn get(&self, _event_id: Uuid) -> Result<Option<AuditEvent>, AuditError> {
        Ok(None)
    }
}

/// In-memory storage. Used in tests and for short-lived processes.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored event in insertion order.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .read()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditStorage for MemoryStorage {
    async fn store(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events.write().map_err(poisoned)?.push(event);
        Ok(())
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        let events = self.events.read().map_err(poisoned)?;
        Ok(filter.apply(events.iter().cloned()))
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<AuditEvent>, AuditError> {
        let events = self.events.read().map_err(poisoned)?;
        Ok(events.iter().find(|e| e.event_id == event_id).cloned())
    }
}

fn poisoned<T>(err: std::sync::PoisonError<T>) -> AuditError {
    AuditError::StoreUnavailable(err.to_string())
}

/// File storage (JSON Lines, one event per line).
///
/// Queries re-read the file, so events written by earlier processes are
/// visible too.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Create a file storage, creating parent directories as needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("creating audit log directory {}", parent.display())
            })?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<AuditEvent>, AuditError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = index + 1,
                        error = %e,
                        "Skipping unreadable audit line"
                    );
                }
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl AuditStorage for FileStorage {
    async fn store(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(filter.apply(self.read_all().await?))
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<AuditEvent>, AuditError> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .find(|e| e.event_id == event_id))
    }
}

/// File storage that also echoes every event to the console.
#[derive(Debug)]
pub struct DualStorage {
    file: FileStorage,
    console: ConsoleStorage,
}

impl DualStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        Ok(Self {
            file: FileStorage::new(path)?,
            console: ConsoleStorage,
        })
    }
}

#[async_trait]
impl AuditStorage for DualStorage {
    async fn store(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.console.store(event.clone()).await?;
        self.file.store(event).await
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        self.file.query(filter).await
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<AuditEvent>, AuditError> {
        self.file.get(event_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AuditEventType;

    fn event(tenant: &str, event_type: AuditEventType) -> AuditEvent {
        AuditEvent::builder(event_type, "u1", tenant, "user").build()
    }

    #[tokio::test]
    async fn test_console_storage() {
        let storage = ConsoleStorage::new();
        storage
            .store(event("acme", AuditEventType::QueryExecuted))
            .await
            .unwrap();
        assert!(storage.query(AuditFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_storage_query() {
        let storage = MemoryStorage::new();
        storage
            .store(event("client_a", AuditEventType::QueryExecuted))
            .await
            .unwrap();
        storage
            .store(event("client_b", AuditEventType::QueryExecuted))
            .await
            .unwrap();
        storage
            .store(event("client_a", AuditEventType::AccessDenied))
            .await
            .unwrap();

        let results = storage
            .query(AuditFilter {
                tenant_id: Some("client_a".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|e| e.tenant_id == "client_a"));

        let denied = storage
            .count(AuditFilter {
                event_type: Some(AuditEventType::AccessDenied),
                limit: Some(0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(denied, 1);
    }

    #[tokio::test]
    async fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");
        let storage = FileStorage::new(&path).unwrap();

        let first = event("client_a", AuditEventType::PolicyApplied);
        let first_id = first.event_id;
        storage.store(first).await.unwrap();
        storage
            .store(event("client_b", AuditEventType::QueryFailed))
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);

        // A second storage on the same file sees earlier events.
        let reopened = FileStorage::new(&path).unwrap();
        let found = reopened.get(first_id).await.unwrap().unwrap();
        assert_eq!(found.event_type, AuditEventType::PolicyApplied);

        let failed = reopened
            .query(AuditFilter {
                event_type: Some(AuditEventType::QueryFailed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].tenant_id, "client_b");
    }

    #[tokio::test]
    async fn test_file_storage_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("audit.jsonl")).unwrap();
        assert!(storage.query(AuditFilter::default()).await.unwrap().is_empty());
    }
}
