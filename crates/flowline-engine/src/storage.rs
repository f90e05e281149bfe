//! Persistence of flow state documents
//!
//! Every piece of engine state is a whole JSON document addressed by a
//! relative path: process state, checkpoint ledgers, file logs and packages.
//! Documents are read and rewritten wholesale; there is no row-level update.
//!
//! ```text
//! {base_dir}/
//! ├── {entity_type}.processstate
//! ├── {entity_type}.{consumer_id}.ledger
//! ├── {flow_code}.flow
//! ├── {flow_code}.filelog
//! └── packages/{flow_id}/{step:08}-{name}-{checkpoint}.package
//! ```

use async_trait::async_trait;
use flowline_common::{FlowError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::model::{Checkpoint, Flow, FlowId, Package, ProcessState, QueryResponseState, SourceFileLog};

/// How a document write treats an existing document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Replace,
    /// Refuse to overwrite; used for packages, which are write-once
    CreateNew,
}

/// Document store keyed by relative path
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, key: &Path) -> Result<Option<Vec<u8>>>;

    async fn write(&self, key: &Path, bytes: Vec<u8>, mode: WriteMode) -> Result<()>;
}

/// Keys of the documents the engine persists
pub mod keys {
    use super::*;

    pub fn process_state(entity_type: &str) -> PathBuf {
        PathBuf::from(format!("{}.processstate", sanitize(entity_type)))
    }

    pub fn ledger(entity_type: &str, consumer_id: &str) -> PathBuf {
        PathBuf::from(format!(
            "{}.{}.ledger",
            sanitize(entity_type),
            sanitize(consumer_id)
        ))
    }

    pub fn flow(flow_id: &FlowId) -> PathBuf {
        PathBuf::from(format!("{}.flow", sanitize(flow_id.as_str())))
    }

    pub fn file_log(flow_code: &str) -> PathBuf {
        PathBuf::from(format!("{}.filelog", sanitize(flow_code)))
    }

    pub fn package(flow_id: &FlowId, step: u64, name: &str, checkpoint: Checkpoint) -> PathBuf {
        PathBuf::from("packages")
            .join(sanitize(flow_id.as_str()))
            .join(format!("{:08}-{}-{}.package", step, sanitize(name), checkpoint))
    }

    /// Keep key components to a single, portable path segment
    pub fn sanitize(component: &str) -> String {
        let cleaned: String = component
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if cleaned.is_empty() {
            "_".to_string()
        } else {
            cleaned
        }
    }
}

/// JSON documents under a base directory
///
/// Writes go to a uniquely named sibling `.tmp` file first, so a reader never
/// observes a half-written document. `Replace` renames it into place.
/// `CreateNew` hard-links it into place, which fails atomically when the key
/// already exists, so of two racing writers exactly one wins.
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_dir: PathBuf,
}

impl FileStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn resolve(&self, key: &Path) -> Result<PathBuf> {
        if key.is_absolute() || key.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(FlowError::storage(format!(
                "key must be a relative path inside the store: {}",
                key.display()
            )));
        }
        Ok(self.base_dir.join(key))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read(&self, key: &Path) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn write(&self, key: &Path, bytes: Vec<u8>, mode: WriteMode) -> Result<()> {
        let path = self.resolve(key)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(".{}.tmp", Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes).await?;

        let published = match mode {
            WriteMode::Replace => tokio::fs::rename(&tmp, &path).await,
            WriteMode::CreateNew => tokio::fs::hard_link(&tmp, &path).await,
        };
        if mode == WriteMode::CreateNew || published.is_err() {
            if let Err(e) = tokio::fs::remove_file(&tmp).await {
                warn!(tmp = %tmp.display(), error = %e, "Failed to remove temporary file");
            }
        }

        match published {
            Ok(()) => {
                debug!(path = %path.display(), "Document written");
                Ok(())
            },
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(FlowError::AlreadyExists(key.display().to_string()))
            },
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process document store, for embedding and tests
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    docs: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored, sorted
    pub fn keys(&self) -> Vec<PathBuf> {
        let mut keys: Vec<PathBuf> = self
            .docs
            .lock()
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PathBuf, Vec<u8>>>> {
        self.docs
            .lock()
            .map_err(|_| FlowError::storage("memory storage lock poisoned"))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, key: &Path) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn write(&self, key: &Path, bytes: Vec<u8>, mode: WriteMode) -> Result<()> {
        let mut docs = self.lock()?;
        if mode == WriteMode::CreateNew && docs.contains_key(key) {
            return Err(FlowError::AlreadyExists(key.display().to_string()));
        }
        docs.insert(key.to_path_buf(), bytes);
        Ok(())
    }
}

/// Typed access to the engine's documents
#[derive(Clone)]
pub struct StateRepository {
    storage: Arc<dyn Storage>,
}

impl StateRepository {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    async fn load<T: DeserializeOwned>(&self, key: &Path) -> Result<Option<T>> {
        match self.storage.read(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save<T: Serialize + ?Sized>(&self, key: &Path, value: &T, mode: WriteMode) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.storage.write(key, bytes, mode).await
    }

    /// Load the process state of a flow, or a fresh one on first run
    pub async fn load_process_state(&self, entity_type: &str, flow_id: &FlowId) -> Result<ProcessState> {
        let state = self.load(&keys::process_state(entity_type)).await?;
        Ok(state.unwrap_or_else(|| ProcessState::new(flow_id.clone())))
    }

    pub async fn save_process_state(&self, entity_type: &str, state: &ProcessState) -> Result<()> {
        self.save(&keys::process_state(entity_type), state, WriteMode::Replace)
            .await
    }

    pub async fn load_ledger(&self, entity_type: &str, consumer_id: &str) -> Result<Vec<QueryResponseState>> {
        Ok(self
            .load(&keys::ledger(entity_type, consumer_id))
            .await?
            .unwrap_or_default())
    }

    pub async fn save_ledger(
        &self,
        entity_type: &str,
        consumer_id: &str,
        rows: &[QueryResponseState],
    ) -> Result<()> {
        self.save(&keys::ledger(entity_type, consumer_id), rows, WriteMode::Replace)
            .await
    }

    pub async fn load_flow(&self, flow_id: &FlowId) -> Result<Option<Flow>> {
        self.load(&keys::flow(flow_id)).await
    }

    /// Register `flow` unless it is already stored; returns the stored descriptor
    pub async fn ensure_flow(&self, flow: &Flow) -> Result<Flow> {
        match self.save(&keys::flow(&flow.id), flow, WriteMode::CreateNew).await {
            Ok(()) => Ok(flow.clone()),
            Err(FlowError::AlreadyExists(_)) => self
                .load_flow(&flow.id)
                .await?
                .ok_or_else(|| FlowError::storage(format!("flow '{}' vanished from the store", flow.id))),
            Err(e) => Err(e),
        }
    }

    pub async fn load_file_log(&self, flow_code: &str) -> Result<SourceFileLog> {
        Ok(self
            .load(&keys::file_log(flow_code))
            .await?
            .unwrap_or_else(|| SourceFileLog::new(flow_code)))
    }

    pub async fn save_file_log(&self, log: &SourceFileLog) -> Result<()> {
        self.save(&keys::file_log(&log.flow_code), log, WriteMode::Replace)
            .await
    }

    /// Persist a package once; returns the key it was written under
    pub async fn save_package<T: Serialize>(
        &self,
        package: &Package<T>,
        checkpoint: Checkpoint,
    ) -> Result<PathBuf> {
        let key = keys::package(&package.flow_id, package.step, &package.name, checkpoint);
        self.save(&key, package, WriteMode::CreateNew).await?;
        Ok(key)
    }

    pub async fn load_package<T: DeserializeOwned>(&self, key: &Path) -> Result<Option<Package<T>>> {
        self.load(key).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::ProcessFlowState;

    #[test]
    fn test_keys_are_sanitized() {
        assert_eq!(keys::process_state("asset/model"), PathBuf::from("asset_model.processstate"));
        assert_eq!(keys::ledger("devices", "proc.1"), PathBuf::from("devices.proc_1.ledger"));
        assert_eq!(keys::file_log(""), PathBuf::from("_.filelog"));
    }

    #[tokio::test]
    async fn test_file_storage_round_trip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let key = PathBuf::from("nested/doc.json");

        assert!(storage.read(&key).await.unwrap().is_none());
        storage
            .write(&key, b"{}".to_vec(), WriteMode::Replace)
            .await
            .unwrap();
        assert_eq!(storage.read(&key).await.unwrap(), Some(b"{}".to_vec()));

        storage
            .write(&key, b"[]".to_vec(), WriteMode::Replace)
            .await
            .unwrap();
        assert_eq!(storage.read(&key).await.unwrap(), Some(b"[]".to_vec()));
        assert_eq!(std::fs::read_dir(dir.path().join("nested")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_file_storage_create_new_refuses_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let key = PathBuf::from("packages/doc.package");

        storage.write(&key, b"first".to_vec(), WriteMode::CreateNew).await.unwrap();
        let err = storage
            .write(&key, b"second".to_vec(), WriteMode::CreateNew)
            .await
            .unwrap_err();

        assert!(matches!(err, FlowError::AlreadyExists(_)));
        assert_eq!(storage.read(&key).await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(std::fs::read_dir(dir.path().join("packages")).unwrap().count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_package_saves_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let repo = StateRepository::new(Arc::new(FileStorage::new(dir.path())));

        for round in 0..25u64 {
            let checkpoint = Checkpoint::mint();
            let mut a: Package<String> = Package::new(FlowId::from("assets"), round, "devices");
            a.valid.push("a".to_string());
            let mut b = a.clone();
            b.valid = vec!["b".to_string()];

            let (repo_a, repo_b) = (repo.clone(), repo.clone());
            let task_a = tokio::spawn(async move {
                let saved = repo_a.save_package(&a, checkpoint).await;
                saved.map(|key| (key, a))
            });
            let task_b = tokio::spawn(async move {
                let saved = repo_b.save_package(&b, checkpoint).await;
                saved.map(|key| (key, b))
            });
            let results = [task_a.await.unwrap(), task_b.await.unwrap()];

            let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
            assert_eq!(winners.len(), 1, "round {round}");
            assert!(results
                .iter()
                .any(|r| matches!(r, Err(FlowError::AlreadyExists(_)))));

            let (key, package) = winners[0];
            let stored: Package<String> = repo.load_package(key).await.unwrap().unwrap();
            assert_eq!(&stored, package);
        }
    }

    #[tokio::test]
    async fn test_file_storage_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let err = storage
            .write(Path::new("../outside"), vec![], WriteMode::Replace)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Storage(_)));
    }

    #[tokio::test]
    async fn test_packages_are_write_once() {
        let repo = StateRepository::new(Arc::new(MemoryStorage::new()));
        let package: Package<String> = Package::new(FlowId::from("assets"), 1, "devices");
        let checkpoint = Checkpoint::mint();

        let key = repo.save_package(&package, checkpoint).await.unwrap();
        let err = repo.save_package(&package, checkpoint).await.unwrap_err();
        assert!(matches!(err, FlowError::AlreadyExists(_)));

        let loaded: Package<String> = repo.load_package(&key).await.unwrap().unwrap();
        assert_eq!(loaded, package);
    }

    #[tokio::test]
    async fn test_ensure_flow_keeps_first_registration() {
        let dir = tempfile::tempdir().unwrap();
        let repo = StateRepository::new(Arc::new(FileStorage::new(dir.path())));
        let id = FlowId::from("devices");
        assert!(repo.load_flow(&id).await.unwrap().is_none());

        let first = repo.ensure_flow(&Flow::new("devices", "Device exports")).await.unwrap();
        let again = repo.ensure_flow(&Flow::new("devices", "Renamed")).await.unwrap();

        assert_eq!(again, first);
        assert_eq!(repo.load_flow(&id).await.unwrap(), Some(first));
        assert!(dir.path().join("devices.flow").exists());
    }

    #[tokio::test]
    async fn test_process_state_defaults_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let repo = StateRepository::new(Arc::new(FileStorage::new(dir.path())));
        let flow = FlowId::from("assets");

        let mut state = repo.load_process_state("device", &flow).await.unwrap();
        assert!(state.checkpoint.is_zero());

        state.record_run(ProcessFlowState::begin(flow.clone(), "devices").finish(Checkpoint::mint()));
        repo.save_process_state("device", &state).await.unwrap();

        let reloaded = repo.load_process_state("device", &flow).await.unwrap();
        assert_eq!(reloaded, state);
        assert!(dir.path().join("device.processstate").exists());
    }
}
