use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::observability;

pub const AVAILABILITY_KEY: &str = "availability";
pub const BOOKINGS_KEY: &str = "bookings";

/// External key-value storage of JSON blobs.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> io::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> io::Result<()>;
}

/// One `<key>.json` file per key.
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub fn open(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> io::Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write to a temp file, fsync, then rename over the target.
    async fn set(&self, key: &str, value: &str) -> io::Result<()> {
        let path = self.path_for(key);
        let tmp_path = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(value.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &path).await
    }
}

/// In-process store. Can be told to fail upcoming writes.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, String>,
    failing_writes: AtomicU32,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls to `set` return an error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|e| e.value().clone())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> io::Result<Option<String>> {
        Ok(self.raw(key))
    }

    async fn set(&self, key: &str, value: &str) -> io::Result<()> {
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::other("injected write failure"));
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Read a persisted collection. A missing key is an empty collection.
pub async fn load_collection<T: DeserializeOwned>(
    kv: &dyn KvStore,
    key: &str,
) -> io::Result<Vec<T>> {
    match kv.get(key).await? {
        None => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{key}: {e}"))),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PersistOptions {
    /// Extra attempts after the first failed write.
    pub retries: u32,
    /// Delay before the first retry; doubles per attempt.
    pub backoff: Duration,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

enum PersistCommand {
    Save {
        key: &'static str,
        value: String,
    },
    Flush {
        response: oneshot::Sender<io::Result<()>>,
    },
}

/// Sending side of the write queue. Saving never blocks the caller.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl PersistHandle {
    /// Start the background writer. Must be called inside a tokio runtime.
    pub fn spawn(kv: Arc<dyn KvStore>, options: PersistOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(kv, options, rx));
        Self { tx }
    }

    /// Enqueue a full snapshot of a collection.
    pub fn save<T: Serialize>(&self, key: &'static str, records: &[T]) {
        let value = match serde_json::to_string(records) {
            Ok(v) => v,
            Err(e) => {
                error!("persist: cannot encode {key}: {e}");
                return;
            }
        };
        if self.tx.send(PersistCommand::Save { key, value }).is_err() {
            error!("persist: writer shut down, {key} change not persisted");
        }
    }

    /// Wait until everything enqueued so far has been written (or has failed).
    pub async fn flush(&self) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(PersistCommand::Flush { response: tx })
            .map_err(|_| io::Error::other("persist writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::other("persist writer dropped response"))?
    }
}

/// Background task that owns the store side of the queue.
/// 1. Block until the first command arrives.
/// 2. Drain all immediately available commands, keeping only the newest snapshot per key.
/// 3. Write each pending key with retry.
/// 4. Keys that still fail stay pending for the next round.
/// 5. Answer any flush waiters with the round's result.
async fn writer_loop(
    kv: Arc<dyn KvStore>,
    options: PersistOptions,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
) {
    let mut pending: BTreeMap<&'static str, String> = BTreeMap::new();
    while let Some(cmd) = rx.recv().await {
        let mut waiters = Vec::new();
        absorb(cmd, &mut pending, &mut waiters);
        while let Ok(cmd) = rx.try_recv() {
            absorb(cmd, &mut pending, &mut waiters);
        }

        metrics::histogram!(observability::PERSIST_BATCH_SIZE).record(pending.len() as f64);
        let flush_start = Instant::now();
        let result = write_pending(kv.as_ref(), &options, &mut pending).await;
        metrics::histogram!(observability::PERSIST_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());

        for waiter in waiters {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = waiter.send(r);
        }
    }
    if !pending.is_empty() {
        error!("persist: writer stopping with {} unwritten collections", pending.len());
    }
}

fn absorb(
    cmd: PersistCommand,
    pending: &mut BTreeMap<&'static str, String>,
    waiters: &mut Vec<oneshot::Sender<io::Result<()>>>,
) {
    match cmd {
        PersistCommand::Save { key, value } => {
            pending.insert(key, value);
        }
        PersistCommand::Flush { response } => waiters.push(response),
    }
}

async fn write_pending(
    kv: &dyn KvStore,
    options: &PersistOptions,
    pending: &mut BTreeMap<&'static str, String>,
) -> io::Result<()> {
    let mut last_err = None;
    let keys: Vec<&'static str> = pending.keys().copied().collect();
    for key in keys {
        let Some(value) = pending.get(key) else { continue };
        match write_with_retry(kv, options, key, value).await {
            Ok(()) => {
                debug!("persist: wrote {key} ({} bytes)", value.len());
                pending.remove(key);
            }
            Err(e) => {
                error!(
                    "persist: giving up on {key} after {} attempts, change kept in memory only: {e}",
                    options.retries + 1
                );
                metrics::counter!(observability::PERSIST_FAILURES_TOTAL, "collection" => key)
                    .increment(1);
                last_err = Some(e);
            }
        }
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn write_with_retry(
    kv: &dyn KvStore,
    options: &PersistOptions,
    key: &'static str,
    value: &str,
) -> io::Result<()> {
    let mut delay = options.backoff;
    let mut attempt = 0;
    loop {
        match kv.set(key, value).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < options.retries => {
                attempt += 1;
                warn!("persist: write of {key} failed (attempt {attempt}): {e}");
                metrics::counter!(observability::PERSIST_RETRIES_TOTAL, "collection" => key)
                    .increment(1);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}
