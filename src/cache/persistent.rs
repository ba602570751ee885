//! Local fast-restart store of serialized kits.
//!
//! One JSON-lines log per content tree. The first line is a header carrying
//! the format name and serializer version. Every write is a transaction: its
//! `set`/`remove`/`clear` records are followed by a `commit` record holding
//! the record count and a SHA-256 digest over the exact record lines.
//!
//! Replay applies committed transactions only. A trailing transaction without
//! its commit (a crash mid-write) is discarded and truncated away. A commit
//! whose digest or count does not match means the file is corrupt and the
//! caller rebuilds from the primary source.
//!
//! The store keeps the byte offset of each live kit's latest `set` record,
//! so `get` reads a single line instead of replaying the log.
//!
//! The store is blocking; async callers go through `spawn_blocking`.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::domain::kits::ContentNodeKit;

use super::error::StoreError;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::persistent";
const FORMAT: &str = "pubcache-kits";
// Extra log records tolerated before compaction, on top of twice the live count.
const COMPACT_SLACK: usize = 64;

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogRecord {
    Header {
        format: String,
        version: u32,
    },
    Set {
        txn: u64,
        id: i32,
        kit: Box<ContentNodeKit>,
    },
    Remove {
        txn: u64,
        id: i32,
    },
    Clear {
        txn: u64,
    },
    Commit {
        txn: u64,
        count: usize,
        digest: String,
    },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RecordRef<'a> {
    Header {
        format: &'a str,
        version: u32,
    },
    Set {
        txn: u64,
        id: i32,
        kit: &'a ContentNodeKit,
    },
    Remove {
        txn: u64,
        id: i32,
    },
    Clear {
        txn: u64,
    },
    Commit {
        txn: u64,
        count: usize,
        digest: String,
    },
}

fn encode(record: &RecordRef<'_>) -> Result<String, StoreError> {
    Ok(serde_json::to_string(record)?)
}

fn digest_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

enum PendingOp {
    Set(Arc<ContentNodeKit>),
    Remove(i32),
    Clear,
}

/// Result of replaying the log.
struct Replay {
    kits: BTreeMap<i32, ContentNodeKit>,
    offsets: BTreeMap<i32, u64>,
    next_txn: u64,
    records: usize,
    committed_len: u64,
    discarded_tail: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    /// Live id to the offset of its latest committed `set` record.
    offsets: BTreeMap<i32, u64>,
    next_txn: u64,
    log_records: usize,
}

/// Durable kit store used to seed a snapshot store on warm restarts.
#[derive(Debug)]
pub struct PersistentKeyStore {
    path: PathBuf,
    version: u32,
    state: Mutex<StoreState>,
    in_transaction: AtomicBool,
}

impl PersistentKeyStore {
    /// Bind a store to `path`. No file is touched until `load` or `create`.
    pub fn open(path: impl Into<PathBuf>, version: u32) -> Self {
        Self {
            path: path.into(),
            version,
            state: Mutex::new(StoreState::default()),
            in_transaction: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Number of live kits as of the last load or commit.
    pub fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "len").offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start an empty log, replacing any existing file.
    pub fn create(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let header = encode(&RecordRef::Header {
            format: FORMAT,
            version: self.version,
        })?;
        let mut file = File::create(&self.path)?;
        file.write_all(header.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_data()?;

        *mutex_lock(&self.state, SOURCE, "create") = StoreState {
            offsets: BTreeMap::new(),
            next_txn: 1,
            log_records: 0,
        };
        info!(path = %self.path.display(), version = self.version, "Local store created");
        Ok(())
    }

    /// Replay the log and return every live kit.
    ///
    /// Missing, corrupt or version-mismatched files are reported through
    /// errors for which `StoreError::requires_rebuild` is true.
    pub fn load(&self) -> Result<Vec<ContentNodeKit>, StoreError> {
        let replay = self.replay()?;
        if replay.discarded_tail {
            warn!(
                path = %self.path.display(),
                committed_len = replay.committed_len,
                "Discarding uncommitted transaction at the end of the local store"
            );
            let file = OpenOptions::new().write(true).open(&self.path)?;
            file.set_len(replay.committed_len)?;
            file.sync_data()?;
        }

        *mutex_lock(&self.state, SOURCE, "load") = StoreState {
            offsets: replay.offsets,
            next_txn: replay.next_txn,
            log_records: replay.records,
        };
        debug!(
            path = %self.path.display(),
            count = replay.kits.len(),
            records = replay.records,
            "Local store loaded"
        );
        Ok(replay.kits.into_values().collect())
    }

    /// Every committed kit, read from disk.
    pub fn enumerate(&self) -> Result<Vec<ContentNodeKit>, StoreError> {
        Ok(self.replay()?.kits.into_values().collect())
    }

    /// Read one committed kit by seeking to its latest `set` record.
    ///
    /// Only ids known from the last load or commit are found.
    pub fn get(&self, id: i32) -> Result<Option<ContentNodeKit>, StoreError> {
        let Some(offset) = mutex_lock(&self.state, SOURCE, "get").offsets.get(&id).copied() else {
            return Ok(None);
        };
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::Missing {
                    path: self.path.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut line = String::new();
        BufReader::new(file).read_line(&mut line)?;
        let at = || format!("offset {offset}");
        match serde_json::from_str::<LogRecord>(line.trim_end()) {
            Ok(LogRecord::Set { id: found, kit, .. }) if found == id => Ok(Some(*kit)),
            Ok(_) => Err(StoreError::corrupt(
                &self.path,
                format!("{}: no set record for id {id}", at()),
            )),
            Err(err) => Err(StoreError::corrupt(&self.path, format!("{}: {err}", at()))),
        }
    }

    /// Write one kit in its own transaction.
    pub fn set(&self, kit: impl Into<Arc<ContentNodeKit>>) -> Result<(), StoreError> {
        let mut txn = self.begin_transaction()?;
        txn.set(kit);
        txn.commit().map(|_| ())
    }

    /// Remove one kit in its own transaction. Absent ids are a no-op.
    pub fn remove(&self, id: i32) -> Result<(), StoreError> {
        let mut txn = self.begin_transaction()?;
        txn.remove(id);
        txn.commit().map(|_| ())
    }

    /// Open a transaction. Only one may be open at a time.
    pub fn begin_transaction(&self) -> Result<KitTransaction<'_>, StoreError> {
        if !self.exists() {
            return Err(StoreError::Missing {
                path: self.path.clone(),
            });
        }
        if self
            .in_transaction
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StoreError::TransactionActive);
        }
        let txn = {
            let mut state = mutex_lock(&self.state, SOURCE, "begin_transaction");
            let txn = state.next_txn.max(1);
            state.next_txn = txn + 1;
            txn
        };
        Ok(KitTransaction {
            store: self,
            txn,
            ops: Vec::new(),
            finished: false,
        })
    }

    /// Remove the store file. Used when it can no longer be trusted.
    pub fn delete_local_files(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        *mutex_lock(&self.state, SOURCE, "delete_local_files") = StoreState::default();
        info!(path = %self.path.display(), "Local store files deleted");
        Ok(())
    }

    fn write_transaction(&self, txn: u64, ops: &[PendingOp]) -> Result<(), StoreError> {
        let mut lines = Vec::with_capacity(ops.len() + 1);
        for op in ops {
            lines.push(match op {
                PendingOp::Set(kit) => encode(&RecordRef::Set {
                    txn,
                    id: kit.id(),
                    kit: kit.as_ref(),
                })?,
                PendingOp::Remove(id) => encode(&RecordRef::Remove { txn, id: *id })?,
                PendingOp::Clear => encode(&RecordRef::Clear { txn })?,
            });
        }
        let digest = digest_lines(lines.iter().map(String::as_str));
        lines.push(encode(&RecordRef::Commit {
            txn,
            count: ops.len(),
            digest,
        })?);

        let mut buffer = lines.join("\n");
        buffer.push('\n');
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let start = file.metadata()?.len();
        file.write_all(buffer.as_bytes())?;
        file.sync_data()?;

        let mut state = mutex_lock(&self.state, SOURCE, "commit");
        let mut offset = start;
        for (op, line) in ops.iter().zip(&lines) {
            match op {
                PendingOp::Set(kit) => {
                    state.offsets.insert(kit.id(), offset);
                }
                PendingOp::Remove(id) => {
                    state.offsets.remove(id);
                }
                PendingOp::Clear => state.offsets.clear(),
            }
            offset += line.len() as u64 + 1;
        }
        state.log_records += ops.len();
        Ok(())
    }

    fn needs_compaction(&self) -> bool {
        let state = mutex_lock(&self.state, SOURCE, "needs_compaction");
        state.log_records > state.offsets.len() * 2 + COMPACT_SLACK
    }

    /// Rewrite the log as a single transaction holding the live kits.
    fn compact(&self) -> Result<(), StoreError> {
        let replay = self.replay()?;
        let txn = replay.next_txn;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let header = encode(&RecordRef::Header {
            format: FORMAT,
            version: self.version,
        })?;
        let mut lines = Vec::with_capacity(replay.kits.len());
        let mut offsets = BTreeMap::new();
        let mut offset = header.len() as u64 + 1;
        for kit in replay.kits.values() {
            let line = encode(&RecordRef::Set {
                txn,
                id: kit.id(),
                kit,
            })?;
            offsets.insert(kit.id(), offset);
            offset += line.len() as u64 + 1;
            lines.push(line);
        }
        let digest = digest_lines(lines.iter().map(String::as_str));
        let commit = encode(&RecordRef::Commit {
            txn,
            count: lines.len(),
            digest,
        })?;

        let mut temp = NamedTempFile::new_in(&dir)?;
        writeln!(temp, "{header}")?;
        for line in &lines {
            writeln!(temp, "{line}")?;
        }
        writeln!(temp, "{commit}")?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|err| err.error)?;

        let mut state = mutex_lock(&self.state, SOURCE, "compact");
        state.offsets = offsets;
        state.log_records = lines.len();
        state.next_txn = txn + 1;
        info!(
            path = %self.path.display(),
            before = replay.records,
            after = lines.len(),
            "Local store compacted"
        );
        Ok(())
    }

    fn replay(&self) -> Result<Replay, StoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::Missing {
                    path: self.path.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        let mut reader = BufReader::new(file);
        let corrupt = |line_no: usize, reason: String| {
            StoreError::corrupt(&self.path, format!("line {line_no}: {reason}"))
        };

        let mut line = String::new();
        let mut offset = 0u64;
        let mut line_no = 0usize;

        // Header.
        let read = reader.read_line(&mut line)?;
        line_no += 1;
        if read == 0 || !line.ends_with('\n') {
            return Err(corrupt(line_no, "missing header".to_string()));
        }
        offset += read as u64;
        match serde_json::from_str::<LogRecord>(line.trim_end()) {
            Ok(LogRecord::Header { format, version }) => {
                if format != FORMAT {
                    return Err(corrupt(line_no, format!("unknown format `{format}`")));
                }
                if version != self.version {
                    return Err(StoreError::VersionMismatch {
                        found: version,
                        expected: self.version,
                    });
                }
            }
            Ok(_) => return Err(corrupt(line_no, "first record is not a header".to_string())),
            Err(err) => return Err(corrupt(line_no, err.to_string())),
        }

        let mut kits = BTreeMap::new();
        let mut offsets = BTreeMap::new();
        let mut records = 0usize;
        let mut next_txn = 1u64;
        let mut committed_len = offset;
        let mut open_txn: Option<u64> = None;
        let mut pending: Vec<(LogRecord, String, u64)> = Vec::new();
        let mut unreadable: Option<(usize, String)> = None;

        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            line_no += 1;
            let line_start = offset;
            offset += read as u64;
            if !line.ends_with('\n') {
                // Torn final write.
                unreadable.get_or_insert((line_no, "truncated record".to_string()));
                break;
            }
            let raw = line.trim_end().to_string();
            if raw.is_empty() {
                continue;
            }
            let record = match serde_json::from_str::<LogRecord>(&raw) {
                Ok(record) => record,
                Err(err) => {
                    unreadable.get_or_insert((line_no, err.to_string()));
                    continue;
                }
            };

            match record {
                LogRecord::Header { .. } => {
                    return Err(corrupt(line_no, "unexpected header".to_string()));
                }
                LogRecord::Commit { txn, count, digest } => {
                    if let Some((bad_line, reason)) = unreadable.take() {
                        return Err(corrupt(bad_line, reason));
                    }
                    if open_txn.is_some_and(|open| open != txn) {
                        return Err(corrupt(line_no, format!("commit for unknown txn {txn}")));
                    }
                    if pending.len() != count {
                        return Err(corrupt(
                            line_no,
                            format!("txn {txn} has {} records, commit says {count}", pending.len()),
                        ));
                    }
                    let actual = digest_lines(pending.iter().map(|(_, raw, _)| raw.as_str()));
                    if actual != digest {
                        return Err(corrupt(line_no, format!("txn {txn} digest mismatch")));
                    }
                    for (record, _, start) in pending.drain(..) {
                        match record {
                            LogRecord::Set { kit, .. } => {
                                offsets.insert(kit.id(), start);
                                kits.insert(kit.id(), *kit);
                            }
                            LogRecord::Remove { id, .. } => {
                                offsets.remove(&id);
                                kits.remove(&id);
                            }
                            LogRecord::Clear { .. } => {
                                offsets.clear();
                                kits.clear();
                            }
                            LogRecord::Header { .. } | LogRecord::Commit { .. } => {}
                        }
                    }
                    records += count;
                    next_txn = next_txn.max(txn + 1);
                    committed_len = offset;
                    open_txn = None;
                }
                LogRecord::Set { txn, .. }
                | LogRecord::Remove { txn, .. }
                | LogRecord::Clear { txn } => {
                    match open_txn {
                        None => open_txn = Some(txn),
                        Some(open) if open == txn => {}
                        Some(open) => {
                            return Err(corrupt(
                                line_no,
                                format!("txn {txn} interleaves uncommitted txn {open}"),
                            ));
                        }
                    }
                    if let LogRecord::Set { id, kit, .. } = &record
                        && *id != kit.id()
                    {
                        return Err(corrupt(
                            line_no,
                            format!("record id {id} does not match kit {}", kit.id()),
                        ));
                    }
                    pending.push((record, raw, line_start));
                }
            }
        }

        let discarded_tail = !pending.is_empty() || unreadable.is_some();
        Ok(Replay {
            kits,
            offsets,
            next_txn,
            records,
            committed_len,
            discarded_tail,
        })
    }
}

/// An open write transaction. Dropping it without `commit` rolls it back.
pub struct KitTransaction<'a> {
    store: &'a PersistentKeyStore,
    txn: u64,
    ops: Vec<PendingOp>,
    finished: bool,
}

impl KitTransaction<'_> {
    /// Stage an upsert. Nothing is written before `commit`.
    pub fn set(&mut self, kit: impl Into<Arc<ContentNodeKit>>) {
        self.ops.push(PendingOp::Set(kit.into()));
    }

    pub fn remove(&mut self, id: i32) {
        self.ops.push(PendingOp::Remove(id));
    }

    /// Drop every kit, including those written earlier in this transaction.
    pub fn clear(&mut self) {
        self.ops.push(PendingOp::Clear);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Durably append the transaction. Returns the number of records written.
    pub fn commit(mut self) -> Result<usize, StoreError> {
        self.finished = true;
        if self.ops.is_empty() {
            return Ok(0);
        }
        self.store.write_transaction(self.txn, &self.ops)?;
        let written = self.ops.len();

        if self.store.needs_compaction()
            && let Err(err) = self.store.compact()
        {
            warn!(
                path = %self.store.path.display(),
                error = %err,
                "Local store compaction failed; keeping the uncompacted log"
            );
        }
        Ok(written)
    }

    /// Discard the staged records.
    pub fn rollback(mut self) {
        self.finished = true;
        debug!(txn = self.txn, discarded = self.ops.len(), "Local store transaction rolled back");
    }
}

impl Drop for KitTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                txn = self.txn,
                discarded = self.ops.len(),
                "Local store transaction dropped without commit"
            );
        }
        self.store.in_transaction.store(false, Ordering::Release);
    }
}
