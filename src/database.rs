//! Persistent example storage.
//!
//! The database maps an opaque key (derived from the test's identity) to a
//! set of opaque blobs, primarily minimized failing choice sequences. No
//! backend promises durability across engine versions: a stale or unreadable
//! entry is a cache miss, never a correctness failure, which is why the
//! public surface swallows backend errors and logs them instead.

use crate::choice::ChoiceValue;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256, Sha384};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::SystemTime;

/// Key for a test's primary corpus: SHA-384 of its name, truncated.
pub fn database_key(test_name: &str) -> Vec<u8> {
    let mut hasher = Sha384::new();
    hasher.update(test_name.as_bytes());
    hasher.finalize()[..16].to_vec()
}

/// Sub-key for non-minimal interesting examples kept for coverage.
pub fn secondary_key(key: &[u8]) -> Vec<u8> {
    let mut out = key.to_vec();
    out.extend_from_slice(b".secondary");
    out
}

/// Serialize a choice sequence to an opaque blob.
pub fn choices_to_bytes(choices: &[ChoiceValue]) -> Vec<u8> {
    serde_json::to_vec(choices).unwrap_or_default()
}

/// Parse a blob back into a choice sequence; `None` for malformed input.
pub fn choices_from_bytes(blob: &[u8]) -> Option<Vec<ChoiceValue>> {
    serde_json::from_slice(blob).ok()
}

/// Key → set-of-blobs store. Implementations must be safe to share across
/// threads; the directory backend is additionally safe across processes.
pub trait ExampleDatabase: Send + Sync + fmt::Debug {
    fn save(&self, key: &[u8], value: &[u8]);
    fn fetch(&self, key: &[u8]) -> Vec<Vec<u8>>;
    fn delete(&self, key: &[u8], value: &[u8]);

    fn move_value(&self, src: &[u8], dest: &[u8], value: &[u8]) {
        if src == dest {
            self.save(dest, value);
            return;
        }
        self.delete(src, value);
        self.save(dest, value);
    }
}

/// Non-persistent store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    entries: Mutex<HashMap<Vec<u8>, BTreeSet<Vec<u8>>>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExampleDatabase for InMemoryDatabase {
    fn save(&self, key: &[u8], value: &[u8]) {
        self.entries
            .lock()
            .expect("database lock poisoned")
            .entry(key.to_vec())
            .or_default()
            .insert(value.to_vec());
    }

    fn fetch(&self, key: &[u8]) -> Vec<Vec<u8>> {
        self.entries
            .lock()
            .expect("database lock poisoned")
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn delete(&self, key: &[u8], value: &[u8]) {
        if let Some(set) = self
            .entries
            .lock()
            .expect("database lock poisoned")
            .get_mut(key)
        {
            set.remove(value);
        }
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One directory per key, one file per value. Writes go through a unique
/// temporary file followed by an atomic rename, so multiple processes can
/// share a storage location without a locking protocol.
#[derive(Debug)]
pub struct DirectoryDatabase {
    root: PathBuf,
}

impl DirectoryDatabase {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn key_dir(&self, key: &[u8]) -> PathBuf {
        self.root.join(hash_name(key))
    }

    fn value_path(&self, key: &[u8], value: &[u8]) -> PathBuf {
        self.key_dir(key).join(hash_name(value))
    }

    fn temp_path(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        self.root.join(format!(
            ".tmp-{}-{}-{}",
            process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed),
            nanos
        ))
    }

    fn try_save(&self, key: &[u8], value: &[u8]) -> io::Result<()> {
        fs::create_dir_all(self.key_dir(key))?;
        let tmp = self.temp_path();
        fs::write(&tmp, value)?;
        let target = self.value_path(key, value);
        match fs::rename(&tmp, &target) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    fn try_fetch(&self, key: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        let dir = self.key_dir(key);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                // A concurrently deleted file is a miss, not an error.
                if let Ok(contents) = fs::read(entry.path()) {
                    out.push(contents);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

fn hash_name(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(&hasher.finalize()[..16])
}

impl ExampleDatabase for DirectoryDatabase {
    fn save(&self, key: &[u8], value: &[u8]) {
        if let Err(e) = self.try_save(key, value) {
            log::warn!("example database save failed: {e}");
        }
    }

    fn fetch(&self, key: &[u8]) -> Vec<Vec<u8>> {
        match self.try_fetch(key) {
            Ok(values) => values,
            Err(e) => {
                log::warn!("example database fetch failed: {e}");
                Vec::new()
            }
        }
    }

    fn delete(&self, key: &[u8], value: &[u8]) {
        match fs::remove_file(self.value_path(key, value)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("example database delete failed: {e}"),
        }
    }

    fn move_value(&self, src: &[u8], dest: &[u8], value: &[u8]) {
        if src == dest {
            self.save(dest, value);
            return;
        }
        if fs::create_dir_all(self.key_dir(dest))
            .and_then(|_| fs::rename(self.value_path(src, value), self.value_path(dest, value)))
            .is_err()
        {
            // Fall back to copy semantics when the rename can't happen
            // (source missing, cross-device).
            self.delete(src, value);
            self.save(dest, value);
        }
    }
}

/// Wrapper that serves reads from its inner database and drops writes.
pub struct ReadOnlyDatabase {
    inner: Arc<dyn ExampleDatabase>,
}

impl ReadOnlyDatabase {
    pub fn new(inner: Arc<dyn ExampleDatabase>) -> Self {
        Self { inner }
    }
}

impl fmt::Debug for ReadOnlyDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReadOnlyDatabase({:?})", self.inner)
    }
}

impl ExampleDatabase for ReadOnlyDatabase {
    fn save(&self, _key: &[u8], _value: &[u8]) {}

    fn fetch(&self, key: &[u8]) -> Vec<Vec<u8>> {
        self.inner.fetch(key)
    }

    fn delete(&self, _key: &[u8], _value: &[u8]) {}
}

/// Writes fan out to every inner database; reads merge and deduplicate.
pub struct MultiplexedDatabase {
    inner: Vec<Arc<dyn ExampleDatabase>>,
}

impl MultiplexedDatabase {
    pub fn new(inner: Vec<Arc<dyn ExampleDatabase>>) -> Self {
        Self { inner }
    }
}

impl fmt::Debug for MultiplexedDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MultiplexedDatabase(x{})", self.inner.len())
    }
}

impl ExampleDatabase for MultiplexedDatabase {
    fn save(&self, key: &[u8], value: &[u8]) {
        for db in &self.inner {
            db.save(key, value);
        }
    }

    fn fetch(&self, key: &[u8]) -> Vec<Vec<u8>> {
        let mut merged = BTreeSet::new();
        for db in &self.inner {
            for value in db.fetch(key) {
                merged.insert(value);
            }
        }
        merged.into_iter().collect()
    }

    fn delete(&self, key: &[u8], value: &[u8]) {
        for db in &self.inner {
            db.delete(key, value);
        }
    }
}

enum WriteJob {
    Save(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>, Vec<u8>),
    Move(Vec<u8>, Vec<u8>, Vec<u8>),
    Flush(Sender<()>),
}

/// Defers writes to a worker thread so storage latency never throttles
/// generation. Reads flush the queue first so save-then-fetch still
/// round-trips; remaining writes are flushed on drop, best effort.
pub struct BackgroundWriteDatabase {
    inner: Arc<dyn ExampleDatabase>,
    sender: Mutex<Option<Sender<WriteJob>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BackgroundWriteDatabase {
    pub fn new(inner: Arc<dyn ExampleDatabase>) -> Self {
        let (sender, receiver) = channel::<WriteJob>();
        let worker_db = Arc::clone(&inner);
        let worker = thread::spawn(move || {
            while let Ok(job) = receiver.recv() {
                match job {
                    WriteJob::Save(k, v) => worker_db.save(&k, &v),
                    WriteJob::Delete(k, v) => worker_db.delete(&k, &v),
                    WriteJob::Move(s, d, v) => worker_db.move_value(&s, &d, &v),
                    WriteJob::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self {
            inner,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    fn submit(&self, job: WriteJob) {
        if let Some(sender) = self.sender.lock().expect("database lock poisoned").as_ref() {
            let _ = sender.send(job);
        }
    }

    fn flush(&self) {
        let (ack, done) = channel();
        self.submit(WriteJob::Flush(ack));
        let _ = done.recv();
    }
}

impl fmt::Debug for BackgroundWriteDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackgroundWriteDatabase({:?})", self.inner)
    }
}

impl ExampleDatabase for BackgroundWriteDatabase {
    fn save(&self, key: &[u8], value: &[u8]) {
        self.submit(WriteJob::Save(key.to_vec(), value.to_vec()));
    }

    fn fetch(&self, key: &[u8]) -> Vec<Vec<u8>> {
        self.flush();
        self.inner.fetch(key)
    }

    fn delete(&self, key: &[u8], value: &[u8]) {
        self.submit(WriteJob::Delete(key.to_vec(), value.to_vec()));
    }

    fn move_value(&self, src: &[u8], dest: &[u8], value: &[u8]) {
        self.submit(WriteJob::Move(src.to_vec(), dest.to_vec(), value.to_vec()));
    }
}

impl Drop for BackgroundWriteDatabase {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take(); // closes the channel, worker drains and exits
        }
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Process-wide default database location, mirroring the default-profile
/// pattern: initialized on first access, overridable before any runner
/// snapshots it.
static DEFAULT_DATABASE: Lazy<Mutex<Option<Arc<dyn ExampleDatabase>>>> =
    Lazy::new(|| Mutex::new(None));

pub fn set_default_database(db: Option<Arc<dyn ExampleDatabase>>) {
    *DEFAULT_DATABASE.lock().expect("database lock poisoned") = db;
}

pub fn default_database() -> Option<Arc<dyn ExampleDatabase>> {
    DEFAULT_DATABASE
        .lock()
        .expect("database lock poisoned")
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(db: &dyn ExampleDatabase) {
        let key = database_key("roundtrip");
        db.save(&key, b"alpha");
        db.save(&key, b"beta");
        db.save(&key, b"alpha"); // idempotent
        let values = db.fetch(&key);
        assert_eq!(values.len(), 2);
        assert!(values.contains(&b"alpha".to_vec()));

        db.delete(&key, b"alpha");
        assert_eq!(db.fetch(&key), vec![b"beta".to_vec()]);
    }

    #[test]
    fn in_memory_roundtrip() {
        roundtrip(&InMemoryDatabase::new());
    }

    #[test]
    fn directory_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        roundtrip(&DirectoryDatabase::new(dir.path()));
    }

    #[test]
    fn directory_move_relocates_a_value() {
        let dir = tempfile::tempdir().unwrap();
        let db = DirectoryDatabase::new(dir.path());
        let (src, dest) = (database_key("src"), database_key("dest"));
        db.save(&src, b"payload");
        db.move_value(&src, &dest, b"payload");
        assert!(db.fetch(&src).is_empty());
        assert_eq!(db.fetch(&dest), vec![b"payload".to_vec()]);
    }

    #[test]
    fn read_only_drops_writes() {
        let inner = Arc::new(InMemoryDatabase::new());
        let key = database_key("ro");
        inner.save(&key, b"kept");
        let ro = ReadOnlyDatabase::new(inner.clone());
        ro.save(&key, b"dropped");
        ro.delete(&key, b"kept");
        assert_eq!(ro.fetch(&key), vec![b"kept".to_vec()]);
    }

    #[test]
    fn multiplexed_merges_reads_and_fans_out_writes() {
        let a = Arc::new(InMemoryDatabase::new());
        let b = Arc::new(InMemoryDatabase::new());
        let key = database_key("mux");
        a.save(&key, b"only-a");
        let mux = MultiplexedDatabase::new(vec![a.clone(), b.clone()]);
        mux.save(&key, b"both");

        let values = mux.fetch(&key);
        assert_eq!(values.len(), 2);
        assert_eq!(b.fetch(&key), vec![b"both".to_vec()]);
    }

    #[test]
    fn background_writes_are_visible_after_fetch() {
        let inner = Arc::new(InMemoryDatabase::new());
        let bg = BackgroundWriteDatabase::new(inner.clone());
        let key = database_key("bg");
        bg.save(&key, b"deferred");
        assert_eq!(bg.fetch(&key), vec![b"deferred".to_vec()]);
    }

    #[test]
    fn blob_serialization_roundtrips_and_rejects_garbage() {
        let choices = vec![
            ChoiceValue::Integer(-7),
            ChoiceValue::Boolean(true),
            ChoiceValue::Float(2.5),
            ChoiceValue::String("ab".into()),
            ChoiceValue::Bytes(vec![0, 255]),
        ];
        let blob = choices_to_bytes(&choices);
        assert_eq!(choices_from_bytes(&blob), Some(choices));
        assert_eq!(choices_from_bytes(b"\x00not json"), None);
    }
}
