use crate::embeddings::{cosine_similarity, EmbeddingVector};
use crate::error::{RagError, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

/// File name of the embedding snapshot inside the data directory
pub const SNAPSHOT_FILE: &str = "embeddings.json";

/// A chunk id paired with the vector computed for that chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingEntry {
    pub chunk_id: String,
    pub vector: EmbeddingVector,
}

/// Where the serialized snapshot lives. Writes replace the whole snapshot.
pub trait SnapshotStore: Send + Sync {
    /// Read the snapshot, `None` if none has been written yet
    fn read(&self) -> Result<Option<Vec<u8>>>;

    /// Replace the snapshot with `bytes`
    fn write(&self, bytes: &[u8]) -> Result<()>;
}

/// Snapshot kept in a single file, replaced through a temp file and rename
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileSnapshotStore {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(SNAPSHOT_FILE);
        let temp_path = parent.join(format!(".{}.tmp-{}", file_name, Uuid::new_v4()));

        let written = (|| -> Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&temp_path, &self.path)?;
            Ok(())
        })();

        if written.is_err() {
            let _ = fs::remove_file(&temp_path);
            return written;
        }

        // Make the rename itself durable
        #[cfg(unix)]
        {
            File::open(parent)?.sync_all()?;
        }

        Ok(())
    }
}

/// Snapshot held in memory; clones share the same bytes
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    bytes: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from pre-existing snapshot bytes
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        MemorySnapshotStore {
            bytes: Arc::new(Mutex::new(Some(bytes))),
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.bytes.lock()?.clone())
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        *self.bytes.lock()? = Some(bytes.to_vec());
        Ok(())
    }
}

/// Lifecycle of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Unloaded,
    Loading,
    Ready,
}

/// What `load` does with a snapshot it cannot read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPolicy {
    /// Log a warning and start empty; stored chunks stay unsearchable until
    /// they are ingested again
    #[default]
    Recover,
    /// Return `CorruptIndexSnapshot` to the caller
    Strict,
}

/// In-memory (chunk id, vector) collection with a persisted snapshot and
/// brute-force cosine search.
pub struct EmbeddingIndex {
    snapshot: Box<dyn SnapshotStore>,
    dimension: usize,
    policy: LoadPolicy,
    state: IndexState,
    entries: RwLock<Vec<EmbeddingEntry>>,
    persist_lock: Mutex<()>,
}

impl EmbeddingIndex {
    /// Create an unloaded index; call `load` before using it
    pub fn new<S>(snapshot: S, dimension: usize, policy: LoadPolicy) -> Self
    where
        S: SnapshotStore + 'static,
    {
        EmbeddingIndex {
            snapshot: Box::new(snapshot),
            dimension,
            policy,
            state: IndexState::Unloaded,
            entries: RwLock::new(Vec::new()),
            persist_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> IndexState {
        self.state
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Read the persisted snapshot into memory and mark the index ready
    pub fn load(&mut self) -> Result<()> {
        self.state = IndexState::Loading;

        let entries = match self.read_snapshot() {
            Ok(entries) => entries,
            Err(RagError::CorruptIndexSnapshot(reason)) if self.policy == LoadPolicy::Recover => {
                warn!(
                    "Embedding snapshot is unreadable ({}); starting with an empty index",
                    reason
                );
                Vec::new()
            }
            Err(e) => {
                self.state = IndexState::Unloaded;
                return Err(e);
            }
        };

        info!("Loaded {} embeddings", entries.len());
        *self.entries.get_mut()? = entries;
        self.state = IndexState::Ready;
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Vec<EmbeddingEntry>> {
        let bytes = match self.snapshot.read() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => return Err(RagError::CorruptIndexSnapshot(e.to_string())),
        };

        let entries: Vec<EmbeddingEntry> = serde_json::from_slice(&bytes)
            .map_err(|e| RagError::CorruptIndexSnapshot(e.to_string()))?;

        if let Some(bad) = entries
            .iter()
            .find(|entry| entry.vector.dimension() != self.dimension)
        {
            return Err(RagError::CorruptIndexSnapshot(format!(
                "entry {} has dimension {}, expected {}",
                bad.chunk_id,
                bad.vector.dimension(),
                self.dimension
            )));
        }

        if let Some(bad) = entries.iter().find(|entry| !entry.vector.is_finite()) {
            return Err(RagError::CorruptIndexSnapshot(format!(
                "entry {} has non-finite components",
                bad.chunk_id
            )));
        }

        Ok(entries)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state == IndexState::Ready {
            Ok(())
        } else {
            Err(RagError::IndexNotReady)
        }
    }

    /// Add entries to the in-memory collection. Nothing is persisted.
    pub fn append(&self, new_entries: Vec<EmbeddingEntry>) -> Result<()> {
        self.ensure_ready()?;

        if let Some(bad) = new_entries
            .iter()
            .find(|entry| entry.vector.dimension() != self.dimension)
        {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.vector.dimension(),
            });
        }

        if let Some(bad) = new_entries.iter().find(|entry| !entry.vector.is_finite()) {
            return Err(RagError::NonFiniteVector(bad.chunk_id.clone()));
        }

        self.entries.write()?.extend(new_entries);
        Ok(())
    }

    /// Write every entry to the snapshot store
    pub fn persist(&self) -> Result<()> {
        self.ensure_ready()?;

        // Serializing under the persist lock means a later writer always
        // sees at least what an earlier one wrote
        let _guard = self.persist_lock.lock()?;
        let (bytes, count) = {
            let entries = self.entries.read()?;
            (serde_json::to_vec(&*entries)?, entries.len())
        };
        self.snapshot.write(&bytes)?;

        debug!("Persisted {} embeddings ({} bytes)", count, bytes.len());
        Ok(())
    }

    /// The `top_k` most similar chunk ids with their scores, best first.
    /// Equal scores keep insertion order.
    pub fn search_scored(
        &self,
        query: &EmbeddingVector,
        top_k: usize,
    ) -> Result<Vec<(String, f32)>> {
        self.ensure_ready()?;

        let entries = self.entries.read()?;
        if top_k == 0 || entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f32)> = entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                let score = cosine_similarity(query.as_slice(), entry.vector.as_slice());
                (idx, score)
            })
            .collect();

        // sort_by is stable
        scored.sort_by(|left, right| right.1.total_cmp(&left.1));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(idx, score)| (entries[idx].chunk_id.clone(), score))
            .collect())
    }

    /// The `top_k` most similar chunk ids, best first
    pub fn search(&self, query: &EmbeddingVector, top_k: usize) -> Result<Vec<String>> {
        Ok(self
            .search_scored(query, top_k)?
            .into_iter()
            .map(|(chunk_id, _)| chunk_id)
            .collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{Embedder, HashingEmbedder, EMBEDDING_DIM};

    fn entry(chunk_id: &str, text: &str) -> EmbeddingEntry {
        EmbeddingEntry {
            chunk_id: chunk_id.to_string(),
            vector: HashingEmbedder.embed(text),
        }
    }

    fn axis_entry(chunk_id: &str, values: Vec<f32>) -> EmbeddingEntry {
        EmbeddingEntry {
            chunk_id: chunk_id.to_string(),
            vector: EmbeddingVector { values },
        }
    }

    fn loaded(store: MemorySnapshotStore) -> EmbeddingIndex {
        let mut index = EmbeddingIndex::new(store, EMBEDDING_DIM, LoadPolicy::Recover);
        index.load().unwrap();
        index
    }

    #[test]
    fn fresh_index_is_ready_and_empty() {
        let index = loaded(MemorySnapshotStore::new());
        assert_eq!(index.state(), IndexState::Ready);
        assert!(index.is_empty().unwrap());
        assert!(index
            .search(&HashingEmbedder.embed("anything"), 3)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn operations_require_a_loaded_index() {
        let index = EmbeddingIndex::new(
            MemorySnapshotStore::new(),
            EMBEDDING_DIM,
            LoadPolicy::Recover,
        );
        assert_eq!(index.state(), IndexState::Unloaded);

        let query = HashingEmbedder.embed("query");
        assert!(matches!(index.search(&query, 1), Err(RagError::IndexNotReady)));
        assert!(matches!(
            index.append(vec![entry("a", "text")]),
            Err(RagError::IndexNotReady)
        ));
        assert!(matches!(index.persist(), Err(RagError::IndexNotReady)));
    }

    #[test]
    fn search_ranks_by_similarity_and_honours_top_k() {
        let mut index = EmbeddingIndex::new(MemorySnapshotStore::new(), 2, LoadPolicy::Recover);
        index.load().unwrap();
        index
            .append(vec![
                axis_entry("near", vec![0.8, 0.2]),
                axis_entry("far", vec![0.1, 0.9]),
                axis_entry("exact", vec![0.9, 0.0]),
            ])
            .unwrap();

        let query = EmbeddingVector {
            values: vec![1.0, 0.0],
        };
        let ranked = index.search_scored(&query, 3).unwrap();
        let ids: Vec<&str> = ranked.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["exact", "near", "far"]);
        assert!(ranked.windows(2).all(|w| w[0].1 >= w[1].1));

        assert_eq!(index.search(&query, 1).unwrap(), vec!["exact"]);
        assert_eq!(index.search(&query, 10).unwrap().len(), 3);
        assert!(index.search(&query, 0).unwrap().is_empty());
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut index = EmbeddingIndex::new(MemorySnapshotStore::new(), 2, LoadPolicy::Recover);
        index.load().unwrap();
        index
            .append(vec![
                axis_entry("first", vec![0.0, 1.0]),
                axis_entry("second", vec![0.0, 2.0]),
                axis_entry("third", vec![0.0, 0.5]),
            ])
            .unwrap();

        let query = EmbeddingVector {
            values: vec![0.0, 1.0],
        };
        assert_eq!(
            index.search(&query, 3).unwrap(),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn append_rejects_wrong_dimension() {
        let index = loaded(MemorySnapshotStore::new());
        let result = index.append(vec![entry("ok", "fine"), axis_entry("bad", vec![1.0])]);

        assert!(matches!(
            result,
            Err(RagError::DimensionMismatch {
                expected: EMBEDDING_DIM,
                actual: 1
            })
        ));
        assert!(index.is_empty().unwrap());
    }

    #[test]
    fn append_alone_does_not_persist() {
        let store = MemorySnapshotStore::new();
        let index = loaded(store.clone());
        index.append(vec![entry("a", "unsaved text")]).unwrap();

        assert!(loaded(store).is_empty().unwrap());
    }

    #[test]
    fn persist_then_reload_gives_identical_results() {
        let store = MemorySnapshotStore::new();
        let index = loaded(store.clone());
        index
            .append(vec![
                entry("rust", "Rust has ownership and borrowing"),
                entry("python", "Python uses a garbage collector"),
                entry("go", "Go has goroutines and channels"),
            ])
            .unwrap();
        index.persist().unwrap();

        let reloaded = loaded(store);
        assert_eq!(reloaded.len().unwrap(), 3);
        for query in ["ownership", "garbage collector", "channels", "nothing shared"] {
            let q = HashingEmbedder.embed(query);
            assert_eq!(index.search(&q, 3).unwrap(), reloaded.search(&q, 3).unwrap());
        }
    }

    #[test]
    fn corrupt_snapshot_recovers_to_empty_by_default() {
        let index = loaded(MemorySnapshotStore::with_bytes(b"{not json".to_vec()));
        assert_eq!(index.state(), IndexState::Ready);
        assert!(index.is_empty().unwrap());
    }

    #[test]
    fn corrupt_snapshot_fails_under_strict_policy() {
        let store = MemorySnapshotStore::with_bytes(b"[{\"chunkId\": 7}]".to_vec());
        let mut index = EmbeddingIndex::new(store, EMBEDDING_DIM, LoadPolicy::Strict);

        assert!(matches!(index.load(), Err(RagError::CorruptIndexSnapshot(_))));
        assert_eq!(index.state(), IndexState::Unloaded);
    }

    #[test]
    fn snapshot_with_wrong_dimension_is_corrupt() {
        let bytes = serde_json::to_vec(&vec![axis_entry("short", vec![1.0, 0.0])]).unwrap();
        let mut index = EmbeddingIndex::new(
            MemorySnapshotStore::with_bytes(bytes),
            EMBEDDING_DIM,
            LoadPolicy::Strict,
        );
        assert!(matches!(index.load(), Err(RagError::CorruptIndexSnapshot(_))));
    }

    #[test]
    fn snapshot_with_non_finite_values_is_corrupt() {
        // 1e39 overflows f32 and parses as infinity
        let bytes = br#"[
            {"chunkId": "low", "vector": [0.5, 0.866]},
            {"chunkId": "bad", "vector": [1e39, 0.0]},
            {"chunkId": "high", "vector": [1.0, 0.0]}
        ]"#;

        let mut strict = EmbeddingIndex::new(
            MemorySnapshotStore::with_bytes(bytes.to_vec()),
            2,
            LoadPolicy::Strict,
        );
        assert!(matches!(strict.load(), Err(RagError::CorruptIndexSnapshot(_))));

        let mut recovering = EmbeddingIndex::new(
            MemorySnapshotStore::with_bytes(bytes.to_vec()),
            2,
            LoadPolicy::Recover,
        );
        recovering.load().unwrap();
        assert_eq!(recovering.state(), IndexState::Ready);
        assert!(recovering.is_empty().unwrap());
    }

    #[test]
    fn append_rejects_non_finite_values() {
        let mut index = EmbeddingIndex::new(MemorySnapshotStore::new(), 2, LoadPolicy::Recover);
        index.load().unwrap();

        let result = index.append(vec![
            axis_entry("ok", vec![1.0, 0.0]),
            axis_entry("bad", vec![f32::INFINITY, 0.0]),
        ]);
        assert!(matches!(result, Err(RagError::NonFiniteVector(id)) if id == "bad"));

        let result = index.append(vec![axis_entry("nan", vec![f32::NAN, 1.0])]);
        assert!(matches!(result, Err(RagError::NonFiniteVector(_))));
        assert!(index.is_empty().unwrap());
    }

    #[test]
    fn overflowing_vectors_rank_last() {
        let mut index = EmbeddingIndex::new(MemorySnapshotStore::new(), 2, LoadPolicy::Recover);
        index.load().unwrap();
        index
            .append(vec![
                axis_entry("low", vec![0.5, 0.866]),
                axis_entry("huge", vec![1e30, 0.0]),
                axis_entry("high", vec![1.0, 0.0]),
            ])
            .unwrap();

        let query = EmbeddingVector {
            values: vec![1.0, 0.0],
        };
        let ranked = index.search_scored(&query, 3).unwrap();
        let ids: Vec<&str> = ranked.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low", "huge"]);
        assert!(ranked.iter().all(|(_, score)| score.is_finite()));
    }

    #[test]
    fn snapshot_uses_chunk_id_and_vector_fields() {
        let store = MemorySnapshotStore::new();
        let index = loaded(store.clone());
        index.append(vec![entry("abc", "hello")]).unwrap();
        index.persist().unwrap();

        let bytes = store.read().unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json[0]["chunkId"], "abc");
        assert_eq!(json[0]["vector"].as_array().unwrap().len(), EMBEDDING_DIM);
    }

    #[test]
    fn file_snapshot_is_replaced_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE);

        let mut index = EmbeddingIndex::new(
            FileSnapshotStore::new(&path),
            EMBEDDING_DIM,
            LoadPolicy::Recover,
        );
        index.load().unwrap();
        index.append(vec![entry("one", "first entry")]).unwrap();
        index.persist().unwrap();
        index.append(vec![entry("two", "second entry")]).unwrap();
        index.persist().unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|name| name != SNAPSHOT_FILE)
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");

        let mut reloaded = EmbeddingIndex::new(
            FileSnapshotStore::new(&path),
            EMBEDDING_DIM,
            LoadPolicy::Recover,
        );
        reloaded.load().unwrap();
        assert_eq!(reloaded.len().unwrap(), 2);
    }

    #[test]
    fn failed_rename_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE);

        let mut index = EmbeddingIndex::new(
            FileSnapshotStore::new(&path),
            EMBEDDING_DIM,
            LoadPolicy::Strict,
        );
        index.load().unwrap();
        index.append(vec![entry("kept", "survives the failed write")]).unwrap();
        index.persist().unwrap();

        // A non-empty directory cannot be replaced by a file
        let blocked = dir.path().join("blocked");
        fs::create_dir(&blocked).unwrap();
        fs::write(blocked.join("occupant"), b"x").unwrap();
        assert!(FileSnapshotStore::new(&blocked).write(b"[]").is_err());

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");

        let mut reloaded = EmbeddingIndex::new(
            FileSnapshotStore::new(&path),
            EMBEDDING_DIM,
            LoadPolicy::Strict,
        );
        reloaded.load().unwrap();
        assert_eq!(
            reloaded
                .search(&HashingEmbedder.embed("survives"), 1)
                .unwrap(),
            vec!["kept"]
        );
    }

    #[test]
    fn garbage_snapshot_file_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE);
        fs::write(&path, b"\x00\x01 truncated").unwrap();

        let mut index = EmbeddingIndex::new(
            FileSnapshotStore::new(&path),
            EMBEDDING_DIM,
            LoadPolicy::Recover,
        );
        index.load().unwrap();
        assert!(index.is_empty().unwrap());
    }

    #[test]
    fn concurrent_persists_keep_every_entry() {
        let store = MemorySnapshotStore::new();
        let index = loaded(store.clone());

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let index = &index;
                scope.spawn(move || {
                    for n in 0..5 {
                        let id = format!("w{worker}-{n}");
                        index.append(vec![entry(&id, &id)]).unwrap();
                        index.persist().unwrap();
                    }
                });
            }
        });

        assert_eq!(loaded(store).len().unwrap(), 40);
    }
}
