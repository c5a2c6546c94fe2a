//! Persistent term-frequency store
//!
//! Durably holds `{term -> TermRecord}`, the digest set, and the corpus
//! counters in a `redb` database, fronted by an LRU cache. A sidecar
//! advisory file lock (`fs2`) enforces single-writer/multi-reader access
//! across processes; `redb` supplies atomic batch commits, MVCC read
//! snapshots for in-process parallel scoring, and rollback of partial
//! writes on the next open.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use lru::LruCache;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::{debug, info, warn};

use crate::errors::{ProbeError, ProbeResult};
use crate::message::MessageDigest;

/// term -> (good_count, spam_count, last_seen_epoch_days)
const TERMS: TableDefinition<&str, (u32, u32, u32)> = TableDefinition::new("terms");
/// raw digest -> class tag
const DIGESTS: TableDefinition<&[u8], u8> = TableDefinition::new("digests");
/// store metadata and corpus counters
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const SCHEMA_VERSION: u64 = 1;
const META_SCHEMA: &str = "schema_version";
const META_GOOD: &str = "total_good_messages";
const META_SPAM: &str = "total_spam_messages";

const DB_FILE: &str = "terms.redb";
const LOCK_FILE: &str = "lock";

/// Cache capacity used when the caller does not supply one
pub const DEFAULT_CACHE_SIZE: usize = 2500;
/// Lock acquisition timeout used when the caller does not supply one
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

const EXPORT_HEADER: &str = "#mailprobe-export v1";

/// Message class: the two training targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// Legitimate mail
    Good,
    /// Unsolicited mail
    Spam,
}

impl MessageClass {
    /// Lowercase label, as used in dumps and CLI output
    pub fn label(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Spam => "spam",
        }
    }

    /// Parse a label, case-insensitive
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "good" | "ham" => Some(Self::Good),
            "spam" => Some(Self::Spam),
            _ => None,
        }
    }

    /// The opposite class
    pub fn other(self) -> Self {
        match self {
            Self::Good => Self::Spam,
            Self::Spam => Self::Good,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Good => 0,
            Self::Spam => 1,
        }
    }

    fn from_tag(tag: u8) -> ProbeResult<Self> {
        match tag {
            0 => Ok(Self::Good),
            1 => Ok(Self::Spam),
            other => Err(ProbeError::StoreCorrupt(format!(
                "unknown digest class tag {other}"
            ))),
        }
    }

    fn counter_key(self) -> &'static str {
        match self {
            Self::Good => META_GOOD,
            Self::Spam => META_SPAM,
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-term occurrence counts and last sighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TermRecord {
    /// Occurrences in messages trained as good
    pub good_count: u32,
    /// Occurrences in messages trained as spam
    pub spam_count: u32,
    /// Day of last increment, in days since the Unix epoch
    pub last_seen_days: u32,
}

impl TermRecord {
    /// Combined occurrence count
    pub fn total(self) -> u64 {
        u64::from(self.good_count) + u64::from(self.spam_count)
    }

    /// Count for one class
    pub fn count(self, class: MessageClass) -> u32 {
        match class {
            MessageClass::Good => self.good_count,
            MessageClass::Spam => self.spam_count,
        }
    }

    /// Apply a signed occurrence delta for one class
    ///
    /// Counts saturate at zero; increments refresh `last_seen_days`.
    fn apply(&mut self, class: MessageClass, delta: i64, seen_day: u32) {
        let slot = match class {
            MessageClass::Good => &mut self.good_count,
            MessageClass::Spam => &mut self.spam_count,
        };
        if delta >= 0 {
            *slot = slot.saturating_add(delta as u32);
            self.last_seen_days = seen_day;
        } else {
            *slot = slot.saturating_sub(delta.unsigned_abs() as u32);
        }
    }

    fn to_value(self) -> (u32, u32, u32) {
        (self.good_count, self.spam_count, self.last_seen_days)
    }

    fn from_value((good_count, spam_count, last_seen_days): (u32, u32, u32)) -> Self {
        Self {
            good_count,
            spam_count,
            last_seen_days,
        }
    }
}

/// Global message counters, the scorer's normalization base
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CorpusCounters {
    /// Messages trained as good
    pub good: u64,
    /// Messages trained as spam
    pub spam: u64,
}

impl CorpusCounters {
    /// Counter for one class
    pub fn count(self, class: MessageClass) -> u64 {
        match class {
            MessageClass::Good => self.good,
            MessageClass::Spam => self.spam,
        }
    }
}

/// One atomic store mutation
///
/// All term deltas, the corpus counter changes, and the digest mutation
/// commit together or not at all. `ops` are applied in order, so a
/// reclassification is `[(old, -1), (new, +1)]` in a single batch.
#[derive(Debug, Clone)]
pub struct UpdateBatch {
    /// Distinct terms of the message, one vote each
    pub terms: Vec<String>,
    /// Per-class message deltas, each in `{+1, -1}`
    pub ops: Vec<(MessageClass, i64)>,
    /// Digest of the message driving the batch
    pub digest: MessageDigest,
    /// Digest set state after the batch; `None` removes the digest
    pub digest_after: Option<MessageClass>,
    /// Day stamp recorded on incremented terms
    pub seen_day: u32,
}

/// Maintenance outcome
#[derive(Debug, Clone, Copy, Default)]
pub struct MaintenanceReport {
    /// Records deleted
    pub terms_removed: u64,
    /// File bytes returned by compaction
    pub bytes_reclaimed: u64,
}

/// Import outcome
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportReport {
    /// Term records loaded
    pub terms: u64,
    /// Digests loaded
    pub digests: u64,
}

/// Store statistics for `info`
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    /// Term records on disk
    pub terms: u64,
    /// Digests on disk
    pub digests: u64,
    /// Corpus counters
    pub counters: CorpusCounters,
    /// Database file size in bytes
    pub file_bytes: u64,
}

/// Cooperative cancellation signal
///
/// Long operations check this between messages or records. Cloning shares
/// the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A fresh, unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Handle to one on-disk store
///
/// The store lives in a directory holding the database file and the lock
/// sidecar. The handle owns the advisory lock for its lifetime; the LRU
/// cache is owned by the handle and guarded by an internal mutex held only
/// for the cache operation itself.
#[derive(Debug)]
pub struct TermStore {
    db: Database,
    dir: PathBuf,
    db_path: PathBuf,
    lock_file: File,
    read_only: bool,
    cache: Mutex<LruCache<String, TermRecord>>,
}

impl TermStore {
    /// Open (creating on demand) with default cache size and lock timeout
    pub fn open(dir: impl AsRef<Path>, read_only: bool) -> ProbeResult<Self> {
        Self::open_with(dir, read_only, DEFAULT_CACHE_SIZE, DEFAULT_LOCK_TIMEOUT)
    }

    /// Open (creating on demand) with explicit cache size and lock timeout
    ///
    /// Writable opens take the exclusive advisory lock and initialize or
    /// upgrade the schema; read-only opens take the shared lock and require
    /// the store to exist.
    ///
    /// # Errors
    ///
    /// - `StoreBusy` when the lock is not acquired within `lock_timeout`
    /// - `StoreCorrupt` when the schema version is unsupported or the
    ///   database fails its integrity checks
    /// - `StoreUnavailable` for any other open failure
    pub fn open_with(
        dir: impl AsRef<Path>,
        read_only: bool,
        cache_size: usize,
        lock_timeout: Duration,
    ) -> ProbeResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let db_path = dir.join(DB_FILE);
        if read_only && !db_path.exists() {
            return Err(ProbeError::StoreUnavailable(format!(
                "no store at {}",
                dir.display()
            )));
        }
        if !read_only {
            fs::create_dir_all(&dir).map_err(|e| {
                ProbeError::StoreUnavailable(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        let lock_file = acquire_lock(&dir, read_only, lock_timeout)?;
        let db = Database::create(&db_path).map_err(map_db_err)?;
        let capacity = NonZeroUsize::new(cache_size)
            .ok_or_else(|| ProbeError::config("cache_size must be at least 1"))?;

        let store = Self {
            db,
            dir,
            db_path,
            lock_file,
            read_only,
            cache: Mutex::new(LruCache::new(capacity)),
        };
        if !read_only {
            store.init_schema()?;
        }
        debug!(dir = %store.dir.display(), read_only, "opened term store");
        Ok(store)
    }

    /// Store directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether this handle was opened read-only
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Cached single-term lookup
    pub fn get(&self, term: &str) -> ProbeResult<Option<TermRecord>> {
        if let Some(record) = self.cache()?.get(term).copied() {
            return Ok(Some(record));
        }
        let txn = self.db.begin_read().map_err(map_tx_err)?;
        let table = match txn.open_table(TERMS) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(map_table_err(e)),
        };
        let record = table
            .get(term)
            .map_err(map_storage_err)?
            .map(|guard| TermRecord::from_value(guard.value()));
        if let Some(record) = record {
            self.cache()?.put(term.to_owned(), record);
        }
        Ok(record)
    }

    /// Batched lookup for scoring: one read transaction for all cache misses
    ///
    /// Returns only the terms that have records. Fetched records refresh the
    /// cache.
    pub fn get_many<'a, I>(&self, terms: I) -> ProbeResult<HashMap<String, TermRecord>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut found = HashMap::new();
        let mut misses: Vec<&str> = Vec::new();
        {
            let mut cache = self.cache()?;
            for term in terms {
                match cache.get(term) {
                    Some(record) => {
                        found.insert(term.to_owned(), *record);
                    }
                    None => misses.push(term),
                }
            }
        }
        if misses.is_empty() {
            return Ok(found);
        }

        let txn = self.db.begin_read().map_err(map_tx_err)?;
        let table = match txn.open_table(TERMS) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(found),
            Err(e) => return Err(map_table_err(e)),
        };
        let mut fetched: Vec<(String, TermRecord)> = Vec::new();
        for term in misses {
            if let Some(guard) = table.get(term).map_err(map_storage_err)? {
                fetched.push((term.to_owned(), TermRecord::from_value(guard.value())));
            }
        }
        let mut cache = self.cache()?;
        for (term, record) in fetched {
            cache.put(term.clone(), record);
            found.insert(term, record);
        }
        Ok(found)
    }

    /// Which class, if any, a digest was trained as
    pub fn contains_digest(&self, digest: &MessageDigest) -> ProbeResult<Option<MessageClass>> {
        let txn = self.db.begin_read().map_err(map_tx_err)?;
        let table = match txn.open_table(DIGESTS) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(map_table_err(e)),
        };
        match table
            .get(&digest.as_bytes()[..])
            .map_err(map_storage_err)?
        {
            Some(guard) => Ok(Some(MessageClass::from_tag(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Current corpus counters
    pub fn counters(&self) -> ProbeResult<CorpusCounters> {
        let txn = self.db.begin_read().map_err(map_tx_err)?;
        let table = match txn.open_table(META) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(CorpusCounters::default()),
            Err(e) => return Err(map_table_err(e)),
        };
        let read = |key: &str| -> ProbeResult<u64> {
            Ok(table
                .get(key)
                .map_err(map_storage_err)?
                .map_or(0, |guard| guard.value()))
        };
        Ok(CorpusCounters {
            good: read(META_GOOD)?,
            spam: read(META_SPAM)?,
        })
    }

    /// Apply one atomic update batch
    ///
    /// All term deltas, counter changes, and the digest mutation commit
    /// together. The cache is refreshed only after a successful commit.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on read-only handles or commit failure.
    pub fn apply(&self, batch: &UpdateBatch) -> ProbeResult<()> {
        self.ensure_writable()?;
        let mut touched: Vec<(String, TermRecord)> = Vec::with_capacity(batch.terms.len());

        let txn = self.db.begin_write().map_err(map_tx_err)?;
        {
            let mut terms = txn.open_table(TERMS).map_err(map_table_err)?;
            for term in &batch.terms {
                let mut record = terms
                    .get(term.as_str())
                    .map_err(map_storage_err)?
                    .map_or_else(TermRecord::default, |guard| {
                        TermRecord::from_value(guard.value())
                    });
                for &(class, delta) in &batch.ops {
                    record.apply(class, delta, batch.seen_day);
                }
                terms
                    .insert(term.as_str(), record.to_value())
                    .map_err(map_storage_err)?;
                touched.push((term.clone(), record));
            }

            let mut meta = txn.open_table(META).map_err(map_table_err)?;
            for &(class, delta) in &batch.ops {
                let key = class.counter_key();
                let current = meta
                    .get(key)
                    .map_err(map_storage_err)?
                    .map_or(0, |guard| guard.value());
                let next = if delta >= 0 {
                    current.saturating_add(delta as u64)
                } else {
                    current.saturating_sub(delta.unsigned_abs())
                };
                meta.insert(key, next).map_err(map_storage_err)?;
            }

            let mut digests = txn.open_table(DIGESTS).map_err(map_table_err)?;
            match batch.digest_after {
                Some(class) => {
                    digests
                        .insert(&batch.digest.as_bytes()[..], class.tag())
                        .map_err(map_storage_err)?;
                }
                None => {
                    digests
                        .remove(&batch.digest.as_bytes()[..])
                        .map_err(map_storage_err)?;
                }
            }
        }
        txn.commit().map_err(map_commit_err)?;

        let mut cache = self.cache()?;
        for (term, record) in touched {
            cache.put(term, record);
        }
        Ok(())
    }

    /// Age-based cleanup pass
    ///
    /// Deletes records whose total count is at most 1 and whose last
    /// sighting is at least `expiry_days` old, then compacts the file.
    /// Commits at the end only: a cancelled pass leaves the store untouched.
    pub fn maintenance(
        &mut self,
        now_days: u32,
        expiry_days: u32,
        cancel: &CancelFlag,
    ) -> ProbeResult<MaintenanceReport> {
        self.remove_matching(cancel, |record| {
            record.total() <= 1 && record.last_seen_days.saturating_add(expiry_days) <= now_days
        })
    }

    /// Count-based purge: drop every record with total count below the
    /// threshold, regardless of age
    pub fn purge(&mut self, min_token_count: u32, cancel: &CancelFlag) -> ProbeResult<MaintenanceReport> {
        self.remove_matching(cancel, |record| record.total() < u64::from(min_token_count))
    }

    /// Shared scan-and-delete machinery for maintenance and purge
    fn remove_matching(
        &mut self,
        cancel: &CancelFlag,
        doomed: impl Fn(TermRecord) -> bool,
    ) -> ProbeResult<MaintenanceReport> {
        self.ensure_writable()?;
        let txn = self.db.begin_write().map_err(map_tx_err)?;
        let mut removed: Vec<String> = Vec::new();
        {
            let mut table = txn.open_table(TERMS).map_err(map_table_err)?;
            {
                let mut iter = table.iter().map_err(map_storage_err)?;
                while let Some(entry) = iter.next() {
                    if cancel.is_cancelled() {
                        info!("maintenance cancelled, rolling back");
                        return Ok(MaintenanceReport::default());
                    }
                    let (key, value) = entry.map_err(map_storage_err)?;
                    if doomed(TermRecord::from_value(value.value())) {
                        removed.push(key.value().to_owned());
                    }
                }
            }
            for term in &removed {
                table.remove(term.as_str()).map_err(map_storage_err)?;
            }
        }
        txn.commit().map_err(map_commit_err)?;

        {
            let mut cache = self.cache()?;
            for term in &removed {
                cache.pop(term);
            }
        }
        let bytes_reclaimed = self.compact();
        let report = MaintenanceReport {
            terms_removed: removed.len() as u64,
            bytes_reclaimed,
        };
        info!(
            terms_removed = report.terms_removed,
            bytes_reclaimed = report.bytes_reclaimed,
            "store cleanup finished"
        );
        Ok(report)
    }

    /// Compact the database file, returning the bytes reclaimed
    ///
    /// Compaction failure is not fatal; the data is intact either way.
    fn compact(&mut self) -> u64 {
        let before = self.file_bytes();
        if let Err(e) = self.db.compact() {
            warn!("compaction failed: {e}");
            return 0;
        }
        before.saturating_sub(self.file_bytes())
    }

    fn file_bytes(&self) -> u64 {
        fs::metadata(&self.db_path).map_or(0, |meta| meta.len())
    }

    /// Write the portable plain-text dump
    ///
    /// One record per line, tab-separated, with the corpus counters up top
    /// and the digest set trailing. Round-trips exactly through
    /// [`TermStore::import`].
    pub fn export<W: Write>(&self, writer: &mut W, cancel: &CancelFlag) -> ProbeResult<()> {
        let txn = self.db.begin_read().map_err(map_tx_err)?;
        let counters = match txn.open_table(META) {
            Ok(table) => {
                let read = |key: &str| -> ProbeResult<u64> {
                    Ok(table
                        .get(key)
                        .map_err(map_storage_err)?
                        .map_or(0, |guard| guard.value()))
                };
                CorpusCounters {
                    good: read(META_GOOD)?,
                    spam: read(META_SPAM)?,
                }
            }
            Err(redb::TableError::TableDoesNotExist(_)) => CorpusCounters::default(),
            Err(e) => return Err(map_table_err(e)),
        };
        writeln!(writer, "{EXPORT_HEADER}")?;
        writeln!(writer, "#good {}", counters.good)?;
        writeln!(writer, "#spam {}", counters.spam)?;

        match txn.open_table(TERMS) {
            Ok(table) => {
                let mut iter = table.iter().map_err(map_storage_err)?;
                while let Some(entry) = iter.next() {
                    if cancel.is_cancelled() {
                        return Err(ProbeError::Io(std::io::Error::other("export cancelled")));
                    }
                    let (key, value) = entry.map_err(map_storage_err)?;
                    let record = TermRecord::from_value(value.value());
                    writeln!(
                        writer,
                        "{}\t{}\t{}\t{}",
                        escape_term(key.value()),
                        record.good_count,
                        record.spam_count,
                        record.last_seen_days
                    )?;
                }
            }
            Err(redb::TableError::TableDoesNotExist(_)) => {}
            Err(e) => return Err(map_table_err(e)),
        }

        writeln!(writer, "#digests")?;
        match txn.open_table(DIGESTS) {
            Ok(table) => {
                let mut iter = table.iter().map_err(map_storage_err)?;
                while let Some(entry) = iter.next() {
                    let (key, value) = entry.map_err(map_storage_err)?;
                    let digest = hex::encode(key.value());
                    let class = MessageClass::from_tag(value.value())?;
                    writeln!(writer, "{digest}\t{class}")?;
                }
            }
            Err(redb::TableError::TableDoesNotExist(_)) => {}
            Err(e) => return Err(map_table_err(e)),
        }
        writeln!(writer, "#end")?;
        Ok(())
    }

    /// Load a plain-text dump produced by [`TermStore::export`]
    ///
    /// Runs in one write transaction: counters are set to the dump's
    /// values; records and digests overwrite colliding entries.
    ///
    /// # Errors
    ///
    /// `StoreCorrupt` on any format violation, naming the offending line.
    pub fn import<R: BufRead>(&self, reader: R, cancel: &CancelFlag) -> ProbeResult<ImportReport> {
        self.ensure_writable()?;
        let mut lines = reader.lines().enumerate();

        let (_, first) = lines
            .next()
            .ok_or_else(|| ProbeError::StoreCorrupt("empty dump".to_owned()))?;
        if first? != EXPORT_HEADER {
            return Err(ProbeError::StoreCorrupt(
                "unrecognized dump header".to_owned(),
            ));
        }
        let good = parse_counter_line(lines.next(), "#good")?;
        let spam = parse_counter_line(lines.next(), "#spam")?;

        let mut report = ImportReport::default();
        let mut touched: Vec<(String, TermRecord)> = Vec::new();
        let txn = self.db.begin_write().map_err(map_tx_err)?;
        {
            let mut terms = txn.open_table(TERMS).map_err(map_table_err)?;
            let mut digests = txn.open_table(DIGESTS).map_err(map_table_err)?;
            let mut meta = txn.open_table(META).map_err(map_table_err)?;
            meta.insert(META_SCHEMA, SCHEMA_VERSION)
                .map_err(map_storage_err)?;
            meta.insert(META_GOOD, good).map_err(map_storage_err)?;
            meta.insert(META_SPAM, spam).map_err(map_storage_err)?;

            let mut in_digests = false;
            let mut saw_end = false;
            for (index, line) in &mut lines {
                if cancel.is_cancelled() {
                    info!("import cancelled, rolling back");
                    return Ok(ImportReport::default());
                }
                let line = line?;
                let lineno = index + 1;
                if line == "#end" {
                    saw_end = true;
                    break;
                }
                if line == "#digests" {
                    in_digests = true;
                    continue;
                }
                if in_digests {
                    let (digest, class) = parse_digest_line(&line, lineno)?;
                    digests
                        .insert(&digest.as_bytes()[..], class.tag())
                        .map_err(map_storage_err)?;
                    report.digests += 1;
                } else {
                    let (term, record) = parse_term_line(&line, lineno)?;
                    terms
                        .insert(term.as_str(), record.to_value())
                        .map_err(map_storage_err)?;
                    touched.push((term, record));
                    report.terms += 1;
                }
            }
            if !saw_end {
                return Err(ProbeError::StoreCorrupt(
                    "dump is truncated (missing #end)".to_owned(),
                ));
            }
        }
        txn.commit().map_err(map_commit_err)?;

        let mut cache = self.cache()?;
        for (term, record) in touched {
            cache.put(term, record);
        }
        info!(
            terms = report.terms,
            digests = report.digests,
            "imported dump"
        );
        Ok(report)
    }

    /// Copy the database file to `dst`
    ///
    /// Consistent because this handle holds the advisory lock, so no other
    /// writer can be mid-commit.
    pub fn backup(&self, dst: &Path) -> ProbeResult<u64> {
        Ok(fs::copy(&self.db_path, dst)?)
    }

    /// Replace the store in `dir` with a previously backed-up file
    ///
    /// Takes the exclusive lock first, so it refuses to run while any
    /// handle holds the store.
    pub fn restore(src: &Path, dir: &Path) -> ProbeResult<u64> {
        fs::create_dir_all(dir).map_err(|e| {
            ProbeError::StoreUnavailable(format!("cannot create {}: {e}", dir.display()))
        })?;
        let lock_file = acquire_lock(dir, false, DEFAULT_LOCK_TIMEOUT)?;
        let copied = fs::copy(src, dir.join(DB_FILE))?;
        let _ = fs2::FileExt::unlock(&lock_file);
        Ok(copied)
    }

    /// Counts and sizes for `info`
    pub fn stats(&self) -> ProbeResult<StoreStats> {
        let txn = self.db.begin_read().map_err(map_tx_err)?;
        let terms = match txn.open_table(TERMS) {
            Ok(table) => table.len().map_err(map_storage_err)?,
            Err(redb::TableError::TableDoesNotExist(_)) => 0,
            Err(e) => return Err(map_table_err(e)),
        };
        let digests = match txn.open_table(DIGESTS) {
            Ok(table) => table.len().map_err(map_storage_err)?,
            Err(redb::TableError::TableDoesNotExist(_)) => 0,
            Err(e) => return Err(map_table_err(e)),
        };
        Ok(StoreStats {
            terms,
            digests,
            counters: self.counters()?,
            file_bytes: self.file_bytes(),
        })
    }

    fn init_schema(&self) -> ProbeResult<()> {
        let txn = self.db.begin_write().map_err(map_tx_err)?;
        {
            let mut meta = txn.open_table(META).map_err(map_table_err)?;
            let version = meta
                .get(META_SCHEMA)
                .map_err(map_storage_err)?
                .map(|guard| guard.value());
            match version {
                Some(v) if v > SCHEMA_VERSION => {
                    return Err(ProbeError::StoreCorrupt(format!(
                        "schema version {v} is newer than supported {SCHEMA_VERSION}"
                    )));
                }
                Some(_) => {}
                None => {
                    meta.insert(META_SCHEMA, SCHEMA_VERSION)
                        .map_err(map_storage_err)?;
                }
            }
            txn.open_table(TERMS).map_err(map_table_err)?;
            txn.open_table(DIGESTS).map_err(map_table_err)?;
        }
        txn.commit().map_err(map_commit_err)?;
        Ok(())
    }

    fn ensure_writable(&self) -> ProbeResult<()> {
        if self.read_only {
            return Err(ProbeError::StoreUnavailable(
                "store handle is read-only".to_owned(),
            ));
        }
        Ok(())
    }

    fn cache(&self) -> ProbeResult<MutexGuard<'_, LruCache<String, TermRecord>>> {
        self.cache
            .lock()
            .map_err(|_| ProbeError::StoreUnavailable("term cache poisoned".to_owned()))
    }

    /// Terms currently cached, most recently used first
    #[cfg(test)]
    fn cached_terms(&self) -> Vec<String> {
        match self.cache.lock() {
            Ok(cache) => cache.iter().map(|(k, _)| k.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Drop for TermStore {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.lock_file);
    }
}

/// Acquire the sidecar advisory lock, polling until the deadline
///
/// Shared for readers, exclusive for writers.
fn acquire_lock(dir: &Path, read_only: bool, timeout: Duration) -> ProbeResult<File> {
    let lock_path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| {
            ProbeError::StoreUnavailable(format!("cannot open {}: {e}", lock_path.display()))
        })?;
    let deadline = Instant::now() + timeout;
    loop {
        // Fully qualified: std 1.89 grew inherent File locking methods with
        // different signatures, which would otherwise shadow the fs2 trait.
        let attempt = if read_only {
            fs2::FileExt::try_lock_shared(&file)
        } else {
            fs2::FileExt::try_lock_exclusive(&file)
        };
        match attempt {
            Ok(()) => return Ok(file),
            Err(_) if Instant::now() < deadline => thread::sleep(LOCK_POLL_INTERVAL),
            Err(e) => {
                return Err(ProbeError::StoreBusy(format!(
                    "could not lock {} within {timeout:?}: {e}",
                    lock_path.display()
                )));
            }
        }
    }
}

/// Backslash-escape tabs, newlines, and backslashes in a term
fn escape_term(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for ch in term.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse [`escape_term`]
fn unescape_term(raw: &str, lineno: usize) -> ProbeResult<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            other => {
                return Err(ProbeError::StoreCorrupt(format!(
                    "bad escape {:?} on dump line {lineno}",
                    other.map_or_else(String::new, |c| c.to_string())
                )));
            }
        }
    }
    Ok(out)
}

fn parse_counter_line(
    line: Option<(usize, std::io::Result<String>)>,
    tag: &str,
) -> ProbeResult<u64> {
    let (_, line) = line.ok_or_else(|| ProbeError::StoreCorrupt("dump is truncated".to_owned()))?;
    let line = line?;
    line.strip_prefix(tag)
        .map(str::trim)
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| ProbeError::StoreCorrupt(format!("expected '{tag} <n>', got '{line}'")))
}

fn parse_term_line(line: &str, lineno: usize) -> ProbeResult<(String, TermRecord)> {
    let fields: Vec<&str> = line.split('\t').collect();
    let [term, good, spam, last_seen] = fields[..] else {
        return Err(ProbeError::StoreCorrupt(format!(
            "expected 4 fields on dump line {lineno}"
        )));
    };
    let parse_u32 = |v: &str| -> ProbeResult<u32> {
        v.parse::<u32>().map_err(|_| {
            ProbeError::StoreCorrupt(format!("bad count '{v}' on dump line {lineno}"))
        })
    };
    Ok((
        unescape_term(term, lineno)?,
        TermRecord {
            good_count: parse_u32(good)?,
            spam_count: parse_u32(spam)?,
            last_seen_days: parse_u32(last_seen)?,
        },
    ))
}

fn parse_digest_line(line: &str, lineno: usize) -> ProbeResult<(MessageDigest, MessageClass)> {
    let (digest, label) = line.split_once('\t').ok_or_else(|| {
        ProbeError::StoreCorrupt(format!("expected 2 fields on dump line {lineno}"))
    })?;
    let class = MessageClass::parse(label).ok_or_else(|| {
        ProbeError::StoreCorrupt(format!("bad class '{label}' on dump line {lineno}"))
    })?;
    Ok((MessageDigest::from_hex(digest)?, class))
}

fn map_db_err(e: redb::DatabaseError) -> ProbeError {
    match e {
        redb::DatabaseError::Storage(e) => map_storage_err(e),
        other => ProbeError::StoreUnavailable(other.to_string()),
    }
}

fn map_storage_err(e: redb::StorageError) -> ProbeError {
    match e {
        redb::StorageError::Corrupted(msg) => ProbeError::StoreCorrupt(msg),
        other => ProbeError::StoreUnavailable(other.to_string()),
    }
}

fn map_tx_err(e: redb::TransactionError) -> ProbeError {
    match e {
        redb::TransactionError::Storage(e) => map_storage_err(e),
        other => ProbeError::StoreUnavailable(other.to_string()),
    }
}

fn map_table_err(e: redb::TableError) -> ProbeError {
    match e {
        redb::TableError::Storage(e) => map_storage_err(e),
        other => ProbeError::StoreUnavailable(other.to_string()),
    }
}

fn map_commit_err(e: redb::CommitError) -> ProbeError {
    ProbeError::StoreUnavailable(e.to_string())
}
