//! Disk-backed, log-structured store.
//!
//! A store directory holds a `MANIFEST` and an append-only `kv.log`. Every
//! committed batch is one CRC-framed record; the whole key space is indexed
//! in memory and rebuilt by replaying the log on open. Compaction rewrites
//! the log from the index and swaps it in with an atomic rename.

pub mod manifest;
pub mod record;

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::mem;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::config::{StoreConfig, SyncPolicy};
use crate::error::{KVStoreError, Result};
use crate::mem::MemStore;
use crate::snapshot::Snapshot;
use crate::types::{ChangeItem, KVStore, KeyValues};

use self::manifest::Manifest;
use self::record::RecordBuilder;

/// Log file name
pub const LOG_FILE: &str = "kv.log";

const COMPACT_FILE: &str = "kv.log.tmp";

/// Payload size of the records written by compaction (1MB)
const COMPACT_RECORD_SIZE: usize = 1024 * 1024;

// rough per-entry framing cost used to estimate live log bytes
const ENTRY_OVERHEAD: usize = 3;

/// How [`LogStore::open`] treats an existing or missing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Create a new store; fail with `KVStoreExists` if one is there.
    Create,
    /// Open an existing store; fail with `KVStoreNotExists` if none is there.
    Open,
    #[default]
    OpenOrCreate,
}

pub struct LogStore {
    dir: PathBuf,
    config: StoreConfig,
    index: MemStore,
    // `None` once stopped
    log: Option<File>,
    log_size: u64,
    // set when the log could not be brought back to `log_size`
    failed: Option<String>,
}

impl LogStore {
    /// Opens or creates the store at `dir` with the default configuration.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open(dir, OpenMode::OpenOrCreate, StoreConfig::default())
    }

    pub fn open(dir: impl AsRef<Path>, mode: OpenMode, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        let log_path = dir.join(LOG_FILE);

        match (Manifest::load(&dir)?, mode) {
            (Some(_), OpenMode::Create) => return Err(KVStoreError::KVStoreExists(dir)),
            (None, OpenMode::Open) => return Err(KVStoreError::KVStoreNotExists(dir)),
            (Some(manifest), _) => {
                manifest.check()?;
                if !log_path.try_exists()? {
                    return Err(KVStoreError::corrupt(format!(
                        "{} is missing",
                        log_path.display()
                    )));
                }
            }
            (None, _) => {
                fs::create_dir_all(&dir)?;
                // truncates a log left behind by an interrupted create
                File::create(&log_path)?.sync_all()?;
                Manifest::default().save(&dir)?;
                info!(dir = %dir.display(), "created kvstore");
            }
        }

        let mut file = OpenOptions::new().read(true).append(true).open(&log_path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut index = MemStore::with_limits(config.limits);
        let stats = record::replay(&data, |batch| index.apply(batch))?;
        if stats.torn_bytes > 0 {
            warn!(
                dir = %dir.display(),
                offset = stats.valid_len,
                torn_bytes = stats.torn_bytes,
                "truncating torn log tail"
            );
            file.set_len(stats.valid_len)?;
            file.sync_all()?;
        }
        debug!(
            dir = %dir.display(),
            records = stats.records,
            keys = index.len(),
            log_size = stats.valid_len,
            "opened kvstore"
        );

        Ok(Self {
            dir,
            config,
            index,
            log: Some(file),
            log_size: stats.valid_len,
            failed: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Current size of the log file in bytes.
    pub fn log_size(&self) -> u64 {
        self.log_size
    }

    /// Flushes buffered writes to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file()?.sync_all()?;
        Ok(())
    }

    /// Rewrites the log so it holds only the live entries.
    pub fn compact(&mut self) -> Result<()> {
        self.ensure_writable()?;
        let tmp_path = self.dir.join(COMPACT_FILE);
        let result = self.write_compacted(&tmp_path);
        let (file, size) = match result {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&tmp_path, self.dir.join(LOG_FILE)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        if let Err(e) = manifest::sync_dir(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "failed to sync store directory");
        }

        info!(
            dir = %self.dir.display(),
            before = self.log_size,
            after = size,
            keys = self.index.len(),
            "compacted log"
        );
        self.log = Some(file);
        self.log_size = size;
        Ok(())
    }

    // writes the live entries to `path` and returns an append handle to it.
    fn write_compacted(&self, path: &Path) -> Result<(File, u64)> {
        let mut out = BufWriter::new(File::create(path)?);
        let mut size = 0u64;
        let mut builder = RecordBuilder::new();
        for (key, value) in self.index.range(..) {
            builder.set(key, value);
            if builder.payload_len() >= COMPACT_RECORD_SIZE {
                let record = mem::take(&mut builder).finish()?;
                out.write_all(&record)?;
                size += record.len() as u64;
            }
        }
        if !builder.is_empty() {
            let record = builder.finish()?;
            out.write_all(&record)?;
            size += record.len() as u64;
        }
        out.into_inner().map_err(|e| e.into_error())?.sync_all()?;

        let file = OpenOptions::new().read(true).append(true).open(path)?;
        Ok((file, size))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.log.is_none() {
            return Err(KVStoreError::Stopped);
        }
        Ok(())
    }

    // reads stay available after a failure, mutations do not
    fn ensure_writable(&self) -> Result<()> {
        self.ensure_running()?;
        match &self.failed {
            Some(reason) => Err(KVStoreError::Failed(reason.clone())),
            None => Ok(()),
        }
    }

    fn file(&mut self) -> Result<&mut File> {
        self.log.as_mut().ok_or(KVStoreError::Stopped)
    }

    fn append(&mut self, batch: &[ChangeItem]) -> Result<()> {
        let record = record::encode(batch)?;
        let sync = self.config.sync;
        let offset = self.log_size;
        let file = self.file()?;

        let result = file.write_all(&record).and_then(|()| match sync {
            SyncPolicy::Always => file.sync_data(),
            SyncPolicy::Buffered => Ok(()),
        });
        let Err(e) = result else {
            self.log_size += record.len() as u64;
            return Ok(());
        };
        // drop the partial record so later appends stay reachable on replay
        if let Err(truncate) = file.set_len(offset) {
            error!(
                dir = %self.dir.display(),
                error = %truncate,
                offset,
                "failed to truncate log after write error"
            );
            self.failed = Some(format!(
                "log could not be truncated to offset {}: {}",
                offset, truncate
            ));
        }
        Err(e.into())
    }

    /// Validates, logs and applies one batch.
    fn commit(&mut self, batch: Vec<ChangeItem>) -> Result<()> {
        self.ensure_writable()?;
        if batch.is_empty() {
            return Ok(());
        }
        self.index.check_batch(&batch)?;
        self.append(&batch)?;
        self.index.apply(batch);
        self.maybe_compact();
        Ok(())
    }

    fn maybe_compact(&mut self) {
        if !self.config.auto_compact || self.log_size < self.config.compaction_min_bytes {
            return;
        }
        let live = self.index.data_size() + self.index.len() * ENTRY_OVERHEAD;
        if self.log_size as f64 <= live as f64 * self.config.compaction_ratio {
            return;
        }
        // the commit is already durable, a failed compaction only wastes space
        if let Err(e) = self.compact() {
            warn!(dir = %self.dir.display(), error = %e, "log compaction failed");
        }
    }
}

impl KVStore for LogStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.index.get(key)
    }

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.commit(vec![ChangeItem::Set { key, value }])
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        if !self.index.exists(key)? {
            return Ok(());
        }
        self.commit(vec![ChangeItem::delete(key)])
    }

    fn stop(&mut self) -> Result<()> {
        let Some(file) = &self.log else {
            return Ok(());
        };
        file.sync_all()?;
        self.log = None;
        self.index.stop()?;
        info!(dir = %self.dir.display(), "kvstore stopped");
        Ok(())
    }

    fn backup(&self, writer: &mut dyn Write, incremental: bool) -> Result<()> {
        self.index.backup(writer, incremental)
    }

    fn restore(&mut self, reader: &mut dyn Read) -> Result<()> {
        self.ensure_writable()?;
        let snapshot = Snapshot::read_from(reader)?;
        let kind = snapshot.kind;
        self.commit(snapshot.into_batch())?;
        info!(dir = %self.dir.display(), ?kind, keys = self.index.len(), "restored kvstore");
        Ok(())
    }

    fn get_all(&self, prefix: &[u8], descending: bool) -> Result<KeyValues> {
        self.index.get_all(prefix, descending)
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        self.index.exists(key)
    }

    fn clear_all(&mut self) -> Result<()> {
        self.ensure_writable()?;
        if self.index.is_empty() {
            return Ok(());
        }
        self.commit(vec![ChangeItem::Clear])
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn write_batch(&mut self, batch: Vec<ChangeItem>) -> Result<()> {
        self.commit(batch)
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(dir = %self.dir.display(), error = %e, "failed to stop kvstore on drop");
        }
    }
}
