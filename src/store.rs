use std::collections::HashMap;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread;

use crate::error::HoardError;
use crate::fs::FileSystem;
use crate::key;
use crate::Result;
use crate::{log_debug, log_error, log_warn};

const JOURNAL_FILE: &str = "journal";
const JOURNAL_FILE_TMP: &str = "journal.tmp";
const JOURNAL_FILE_BACKUP: &str = "journal.bkp";
const MAGIC: &str = "hoard.io.DiskStore";
const VERSION_1: &str = "1";

const CLEAN: &str = "CLEAN";
const DIRTY: &str = "DIRTY";
const REMOVE: &str = "REMOVE";
const READ: &str = "READ";

/// Compact the journal only once it carries this many redundant ops and at
/// least as many as there are live entries. Bounds absolute and relative
/// journal growth at the same time.
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;

/// A journaled, LRU-evicted key/value cache backed by a directory of files.
///
/// Each entry has a string key matching `[a-z0-9_-]{1,120}` and a fixed
/// number of byte-stream values. Values live in files named `<key>.<index>`;
/// in-progress writes go to `<key>.<index>.tmp` and are renamed into place
/// on commit. Every mutation is appended to an append-only journal that is
/// replayed on startup to rebuild the in-memory index, so a crash at any
/// point loses at most the entries that were mid-edit.
///
/// At most one [`Editor`] may be live per key. Readers get [`Snapshot`]s of
/// the last committed value files; a snapshot stays readable even if the
/// entry is evicted while it is open.
pub struct DiskStore {
    state: Arc<Mutex<StoreState>>,
    directory: PathBuf,
    value_count: usize,
}

struct StoreState {
    fs: Arc<dyn FileSystem>,
    directory: PathBuf,
    journal_file: PathBuf,
    journal_file_tmp: PathBuf,
    journal_file_backup: PathBuf,
    app_version: u32,
    value_count: usize,
    max_size: u64,
    size: u64,
    entries: HashMap<String, Entry>,
    journal_writer: Option<BufWriter<Box<dyn Write + Send>>>,
    redundant_op_count: usize,
    has_journal_errors: bool,
    initialized: bool,
    closed: bool,
    most_recent_trim_failed: bool,
    most_recent_rebuild_failed: bool,
    next_sequence_number: u64,
    next_editor_id: u64,
    use_counter: u64,
    cleanup_tx: mpsc::Sender<()>,
}

struct Entry {
    key: String,
    lengths: Vec<u64>,
    readable: bool,
    /// Id of the live editor, if an edit is in flight.
    current_editor: Option<u64>,
    sequence_number: u64,
    /// Recency stamp; refreshed on reads and edit-opens, lowest is evicted
    /// first.
    last_used: u64,
}

/// Marker editor id used while replaying DIRTY journal lines; those entries
/// never see a real editor and are dropped by `process_journal`.
const REPLAY_EDITOR: u64 = u64::MAX;

impl Entry {
    fn new(key: &str, value_count: usize) -> Self {
        Entry {
            key: key.to_string(),
            lengths: vec![0; value_count],
            readable: false,
            current_editor: None,
            sequence_number: 0,
            last_used: 0,
        }
    }

    fn set_lengths(&mut self, parts: &[&str]) -> Result<()> {
        if parts.len() != self.lengths.len() {
            return Err(corrupt(format!("unexpected entry lengths: {parts:?}")));
        }
        for (i, part) in parts.iter().enumerate() {
            self.lengths[i] = part
                .parse::<u64>()
                .map_err(|_| corrupt(format!("unexpected entry lengths: {parts:?}")))?;
        }
        Ok(())
    }

    fn total_length(&self) -> u64 {
        self.lengths.iter().sum()
    }
}

fn corrupt(msg: String) -> crate::Error {
    HoardError::JournalCorrupt(msg).into()
}

fn clean_file(directory: &Path, key: &str, index: usize) -> PathBuf {
    directory.join(format!("{key}.{index}"))
}

fn dirty_file(directory: &Path, key: &str, index: usize) -> PathBuf {
    directory.join(format!("{key}.{index}.tmp"))
}

impl DiskStore {
    /// Create a store over `directory`. No I/O happens until the first
    /// operation; the directory is created lazily on initialization.
    /// `app_version` is the caller's schema version: changing it discards
    /// all previously stored entries on the next open.
    pub fn create<P: AsRef<Path>>(
        fs: Arc<dyn FileSystem>,
        directory: P,
        app_version: u32,
        value_count: usize,
        max_size: u64,
    ) -> Self {
        assert!(max_size > 0, "max_size <= 0");
        assert!(value_count > 0, "value_count <= 0");

        let directory = directory.as_ref().to_path_buf();
        let (cleanup_tx, cleanup_rx) = mpsc::channel();
        let state = Arc::new(Mutex::new(StoreState {
            fs,
            directory: directory.clone(),
            journal_file: directory.join(JOURNAL_FILE),
            journal_file_tmp: directory.join(JOURNAL_FILE_TMP),
            journal_file_backup: directory.join(JOURNAL_FILE_BACKUP),
            app_version,
            value_count,
            max_size,
            size: 0,
            entries: HashMap::new(),
            journal_writer: None,
            redundant_op_count: 0,
            has_journal_errors: false,
            initialized: false,
            closed: false,
            most_recent_trim_failed: false,
            most_recent_rebuild_failed: false,
            next_sequence_number: 0,
            next_editor_id: 0,
            use_counter: 0,
            cleanup_tx,
        }));

        let weak = Arc::downgrade(&state);
        thread::Builder::new()
            .name("hoard-store-cleanup".to_string())
            .spawn(move || cleanup_loop(weak, cleanup_rx))
            .expect("failed to spawn cleanup thread");

        DiskStore {
            state,
            directory,
            value_count,
        }
    }

    /// Replay the journal and build the in-memory index. Idempotent; called
    /// implicitly by every operation.
    pub fn initialize(&self) -> Result<()> {
        self.state.lock().unwrap().initialize()
    }

    /// Snapshot of the committed values for `key`, or None when the key is
    /// absent or only has an uncommitted edit. Refreshes the entry's
    /// recency.
    pub fn get(&self, key: &str) -> Result<Option<Snapshot>> {
        let mut state = self.state.lock().unwrap();
        state.initialize()?;
        state.check_not_closed();
        key::validate_key(key);

        let Some(snapshot) = state.open_snapshot(key) else {
            return Ok(None);
        };
        state.redundant_op_count += 1;
        state.journal_append(&format!("{READ} {key}"));
        if state.journal_rebuild_required() {
            state.schedule_cleanup();
        }
        Ok(Some(snapshot))
    }

    /// Exclusive editor for `key`, or None when another edit is in flight or
    /// the store is refusing writes after a failed trim/compaction.
    pub fn edit(&self, key: &str) -> Result<Option<Editor>> {
        self.edit_at(key, None)
    }

    /// Like [`DiskStore::edit`], but additionally refuses (returns None)
    /// when the entry's sequence number no longer matches
    /// `expected_sequence` — i.e. the snapshot the caller is working from
    /// has been overwritten.
    pub fn edit_at(&self, key: &str, expected_sequence: Option<u64>) -> Result<Option<Editor>> {
        let mut state = self.state.lock().unwrap();
        state.initialize()?;
        state.check_not_closed();
        key::validate_key(key);

        if let Some(expected) = expected_sequence {
            match state.entries.get(key) {
                Some(entry) if entry.sequence_number == expected => {}
                _ => return Ok(None),
            }
        }
        if let Some(entry) = state.entries.get(key) {
            if entry.current_editor.is_some() {
                return Ok(None);
            }
        }
        if state.most_recent_trim_failed || state.most_recent_rebuild_failed {
            // The OS is against us: a previous cleanup could not make room
            // or rewrite the journal. Retry it in the background and refuse
            // this edit so the cache cannot grow unchecked.
            state.schedule_cleanup();
            return Ok(None);
        }

        // Flush the DIRTY record before any dirty file exists, so a crash
        // from here on is recovered by deleting the half-written files.
        state.journal_append(&format!("{DIRTY} {key}"));
        state.journal_flush();
        if state.has_journal_errors {
            return Ok(None);
        }

        let editor_id = state.next_editor_id;
        state.next_editor_id += 1;
        let stamp = state.next_use_stamp();
        let value_count = state.value_count;
        let entry = state
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(key, value_count));
        entry.current_editor = Some(editor_id);
        entry.last_used = stamp;

        Ok(Some(Editor {
            state: Arc::clone(&self.state),
            key: key.to_string(),
            id: editor_id,
            written: vec![false; value_count],
            done: false,
        }))
    }

    /// Drop `key` if present. Returns whether an entry was removed. An
    /// in-flight edit for the key is detached: it completes normally but
    /// its values are not stored.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.initialize()?;
        state.check_not_closed();
        key::validate_key(key);
        let removed = state.remove_entry(key)?;
        if removed && state.size <= state.max_size {
            state.most_recent_trim_failed = false;
        }
        Ok(removed)
    }

    /// Remove every stored entry. In-flight edits complete without storing.
    pub fn evict_all(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.initialize()?;
        let keys: Vec<String> = state.entries.keys().cloned().collect();
        for key in keys {
            state.remove_entry(&key)?;
        }
        state.most_recent_trim_failed = false;
        Ok(())
    }

    /// Trim to the size bound and force buffered journal lines to disk.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.initialized {
            return Ok(());
        }
        state.check_not_closed();
        state.trim_to_size()?;
        if let Some(writer) = state.journal_writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Abort in-flight edits, trim, and close the journal. Further
    /// operations panic.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.initialized || state.closed {
            state.closed = true;
            return Ok(());
        }
        let editing: Vec<(String, u64)> = state
            .entries
            .iter()
            .filter_map(|(k, e)| e.current_editor.map(|id| (k.clone(), id)))
            .collect();
        for (key, id) in editing {
            state.complete_edit(&key, id, &[], false)?;
        }
        state.trim_to_size()?;
        if let Some(mut writer) = state.journal_writer.take() {
            writer.flush()?;
        }
        state.closed = true;
        Ok(())
    }

    /// Close the store and delete everything in its directory, including
    /// files the store did not create.
    pub fn delete(&self) -> Result<()> {
        self.close()?;
        let state = self.state.lock().unwrap();
        state.fs.delete_contents(&state.directory)?;
        Ok(())
    }

    pub fn size(&self) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.initialize()?;
        Ok(state.size)
    }

    pub fn max_size(&self) -> u64 {
        self.state.lock().unwrap().max_size
    }

    /// Change the size bound; queues an asynchronous trim when shrinking.
    pub fn set_max_size(&self, max_size: u64) {
        let mut state = self.state.lock().unwrap();
        state.max_size = max_size;
        if state.initialized {
            state.schedule_cleanup();
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn value_count(&self) -> usize {
        self.value_count
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Iterator over snapshots of the current entries, least recently used
    /// first. Iterates a copy of the key set, so concurrent mutation never
    /// invalidates it; entries added after the call are not returned.
    pub fn snapshots(&self) -> Result<Snapshots> {
        let mut state = self.state.lock().unwrap();
        state.initialize()?;
        let mut keys: Vec<(u64, String)> = state
            .entries
            .values()
            .map(|e| (e.last_used, e.key.clone()))
            .collect();
        keys.sort();
        drop(state);
        Ok(Snapshots {
            state: Arc::clone(&self.state),
            keys: keys.into_iter().map(|(_, k)| k).collect(),
            index: 0,
            current: None,
        })
    }
}

impl StoreState {
    fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        self.fs.create_dir_all(&self.directory)?;

        // Prefer a backup journal left behind by an interrupted compaction,
        // unless the compaction also got as far as writing the new journal.
        if self.fs.exists(&self.journal_file_backup) {
            if self.fs.exists(&self.journal_file) {
                self.fs.delete(&self.journal_file_backup)?;
            } else {
                self.fs
                    .rename(&self.journal_file_backup, &self.journal_file)?;
            }
        }

        if self.fs.exists(&self.journal_file) {
            match self.read_journal() {
                Ok(()) => {
                    self.process_journal()?;
                    self.initialized = true;
                    return Ok(());
                }
                Err(err) => {
                    log_warn!(
                        "Disk store {} is corrupt: {}, removing",
                        self.directory.display(),
                        err
                    );
                    self.entries.clear();
                    self.size = 0;
                    self.journal_writer = None;
                    self.fs.delete_contents(&self.directory)?;
                }
            }
        }

        self.rebuild_journal()?;
        self.initialized = true;
        Ok(())
    }

    fn read_journal(&mut self) -> Result<()> {
        let mut source = self.fs.source(&self.journal_file)?;
        let mut data = Vec::new();
        source.read_to_end(&mut data)?;
        drop(source);

        // Only newline-terminated lines count; a trailing remainder is a
        // write that died partway and triggers a rebuild below.
        let mut segments = data.split(|b| *b == b'\n');
        let truncated = !data.is_empty() && !data.ends_with(b"\n");
        let mut lines: Vec<&str> = Vec::new();
        let mut remainder = None;
        for segment in &mut segments {
            lines.push(
                std::str::from_utf8(segment)
                    .map_err(|_| corrupt("journal is not UTF-8".to_string()))?,
            );
        }
        // split leaves an empty tail segment when data ends with the
        // delimiter, and the truncated remainder otherwise.
        if let Some(last) = lines.pop() {
            if truncated {
                remainder = Some(last);
            }
        }

        let mut header = lines.iter().take(5);
        let magic = header.next().copied();
        let version = header.next().copied();
        let app_version_line = header.next().copied();
        let value_count_line = header.next().copied();
        let blank = header.next().copied();
        if magic != Some(MAGIC)
            || version != Some(VERSION_1)
            || app_version_line != Some(self.app_version.to_string().as_str())
            || value_count_line != Some(self.value_count.to_string().as_str())
            || blank != Some("")
        {
            return Err(corrupt(format!(
                "unexpected journal header: [{}, {}, {}, {}]",
                magic.unwrap_or(""),
                version.unwrap_or(""),
                value_count_line.unwrap_or(""),
                blank.unwrap_or("")
            )));
        }

        let mut line_count: usize = 0;
        for line in lines.iter().skip(5) {
            self.read_journal_line(line)?;
            line_count += 1;
        }
        self.redundant_op_count = line_count.saturating_sub(self.entries.len());

        if remainder.is_some() {
            self.rebuild_journal()?;
        } else {
            self.journal_writer = Some(self.new_journal_writer()?);
        }
        Ok(())
    }

    fn read_journal_line(&mut self, line: &str) -> Result<()> {
        let first_space = line
            .find(' ')
            .ok_or_else(|| corrupt(format!("unexpected journal line: {line}")))?;
        let op = &line[..first_space];
        let key_begin = first_space + 1;
        let second_space = line[key_begin..].find(' ').map(|i| i + key_begin);

        let key = match second_space {
            None => &line[key_begin..],
            Some(s) => &line[key_begin..s],
        };
        if second_space.is_none() && op == REMOVE {
            self.entries.remove(key);
            return Ok(());
        }

        let stamp = self.next_use_stamp();
        let value_count = self.value_count;
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(key, value_count));
        entry.last_used = stamp;

        match second_space {
            Some(s) if op == CLEAN => {
                let parts: Vec<&str> = line[s + 1..].split(' ').collect();
                entry.readable = true;
                entry.current_editor = None;
                entry.set_lengths(&parts)?;
            }
            None if op == DIRTY => {
                entry.current_editor = Some(REPLAY_EDITOR);
            }
            None if op == READ => {
                // Recency already refreshed above.
            }
            _ => return Err(corrupt(format!("unexpected journal line: {line}"))),
        }
        Ok(())
    }

    /// Compute the initial size and collect garbage while opening. Entries
    /// still dirty at the last shutdown are inconsistent and dropped.
    fn process_journal(&mut self) -> Result<()> {
        self.fs.delete(&self.journal_file_tmp)?;
        let mut size = 0;
        let mut dropped: Vec<String> = Vec::new();
        for entry in self.entries.values() {
            if entry.current_editor.is_none() {
                size += entry.total_length();
            } else {
                dropped.push(entry.key.clone());
            }
        }
        for key in dropped {
            log_debug!("dropping incomplete entry {key} found during journal replay");
            for i in 0..self.value_count {
                self.fs.delete(&clean_file(&self.directory, &key, i))?;
                self.fs.delete(&dirty_file(&self.directory, &key, i))?;
            }
            self.entries.remove(&key);
        }
        self.size = size;
        Ok(())
    }

    /// Write a compacted journal listing only the live entries, replacing
    /// the current one.
    fn rebuild_journal(&mut self) -> Result<()> {
        if let Some(mut writer) = self.journal_writer.take() {
            let _ = writer.flush();
        }

        let mut writer = BufWriter::new(self.fs.sink(&self.journal_file_tmp)?);
        writeln!(writer, "{MAGIC}")?;
        writeln!(writer, "{VERSION_1}")?;
        writeln!(writer, "{}", self.app_version)?;
        writeln!(writer, "{}", self.value_count)?;
        writeln!(writer)?;
        for entry in self.entries.values() {
            if entry.current_editor.is_some() {
                writeln!(writer, "{DIRTY} {}", entry.key)?;
            } else {
                write!(writer, "{CLEAN} {}", entry.key)?;
                for length in &entry.lengths {
                    write!(writer, " {length}")?;
                }
                writeln!(writer)?;
            }
        }
        writer.flush()?;
        drop(writer);

        if self.fs.exists(&self.journal_file) {
            self.fs
                .rename(&self.journal_file, &self.journal_file_backup)?;
        }
        self.fs.rename(&self.journal_file_tmp, &self.journal_file)?;
        self.fs.delete(&self.journal_file_backup)?;

        self.journal_writer = Some(self.new_journal_writer()?);
        self.has_journal_errors = false;
        self.most_recent_rebuild_failed = false;
        Ok(())
    }

    fn new_journal_writer(&self) -> Result<BufWriter<Box<dyn Write + Send>>> {
        Ok(BufWriter::new(self.fs.appending_sink(&self.journal_file)?))
    }

    /// Append an op line. Failures are remembered instead of surfaced:
    /// `edit` fails closed while the flag is set and a rebuild clears it.
    fn journal_append(&mut self, line: &str) {
        if let Some(writer) = self.journal_writer.as_mut() {
            if writeln!(writer, "{line}").is_err() {
                self.has_journal_errors = true;
            }
        }
    }

    fn journal_flush(&mut self) {
        if let Some(writer) = self.journal_writer.as_mut() {
            if writer.flush().is_err() {
                self.has_journal_errors = true;
            }
        }
    }

    fn journal_rebuild_required(&self) -> bool {
        self.redundant_op_count >= REDUNDANT_OP_COMPACT_THRESHOLD
            && self.redundant_op_count >= self.entries.len()
    }

    fn schedule_cleanup(&self) {
        let _ = self.cleanup_tx.send(());
    }

    fn next_use_stamp(&mut self) -> u64 {
        self.use_counter += 1;
        self.use_counter
    }

    fn check_not_closed(&self) {
        if self.closed {
            panic!("cache is closed");
        }
    }

    /// Open every committed value file of `key`. A vanished file means the
    /// entry is unusable: it is dropped and the caller sees a miss.
    fn open_snapshot(&mut self, key: &str) -> Option<Snapshot> {
        let entry = self.entries.get_mut(key)?;
        if !entry.readable {
            return None;
        }
        let sequence_number = entry.sequence_number;
        let lengths = entry.lengths.clone();
        let stamp = self.next_use_stamp();
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_used = stamp;
        }

        let mut sources: Vec<Option<Box<dyn Read + Send>>> = Vec::new();
        for i in 0..self.value_count {
            match self.fs.source(&clean_file(&self.directory, key, i)) {
                Ok(source) => sources.push(Some(source)),
                Err(_) => {
                    drop(sources);
                    if let Err(err) = self.remove_entry(key) {
                        log_error!("failed to drop unreadable entry {key}: {err}");
                    }
                    return None;
                }
            }
        }
        Some(Snapshot {
            key: key.to_string(),
            sequence_number,
            sources,
            lengths,
        })
    }

    fn remove_entry(&mut self, key: &str) -> Result<bool> {
        let has_editor = match self.entries.get(key) {
            None => return Ok(false),
            Some(entry) => entry.current_editor.is_some(),
        };
        if has_editor {
            // Detach the live edit; it completes normally without storing.
            if let Some(entry) = self.entries.get_mut(key) {
                entry.current_editor = None;
            }
            for i in 0..self.value_count {
                let _ = self.fs.delete(&dirty_file(&self.directory, key, i));
            }
        }
        for i in 0..self.value_count {
            self.fs.delete(&clean_file(&self.directory, key, i))?;
        }
        let total = self
            .entries
            .get(key)
            .map(|entry| entry.total_length())
            .unwrap_or(0);
        self.size -= total;
        self.redundant_op_count += 1;
        self.journal_append(&format!("{REMOVE} {key}"));
        self.entries.remove(key);

        if self.journal_rebuild_required() {
            self.schedule_cleanup();
        }
        Ok(true)
    }

    /// Finish an edit: rename dirty files into place on success, delete
    /// them on abort, and record the outcome in the journal. No-op when the
    /// editor was detached by a concurrent remove.
    fn complete_edit(
        &mut self,
        editor_key: &str,
        editor_id: u64,
        written: &[bool],
        success: bool,
    ) -> Result<()> {
        match self.entries.get(editor_key) {
            Some(entry) if entry.current_editor == Some(editor_id) => {}
            _ => return Ok(()),
        }
        let readable = self.entries.get(editor_key).expect("entry present").readable;

        // The first commit of a key must supply every value.
        if success && !readable {
            for (i, was_written) in written.iter().enumerate() {
                if !was_written {
                    self.complete_edit(editor_key, editor_id, written, false)?;
                    panic!("newly created entry didn't create value for index {i}");
                }
                if !self
                    .fs
                    .exists(&dirty_file(&self.directory, editor_key, i))
                {
                    self.complete_edit(editor_key, editor_id, written, false)?;
                    return Err(HoardError::EditIncomplete(format!(
                        "dirty file for index {i} vanished before commit"
                    ))
                    .into());
                }
            }
        }

        for i in 0..self.value_count {
            let dirty = dirty_file(&self.directory, editor_key, i);
            if success {
                if self.fs.exists(&dirty) {
                    let clean = clean_file(&self.directory, editor_key, i);
                    self.fs.rename(&dirty, &clean)?;
                    let new_length = self.fs.size(&clean)?;
                    let entry = self.entries.get_mut(editor_key).expect("entry present");
                    let old_length = entry.lengths[i];
                    entry.lengths[i] = new_length;
                    self.size = self.size - old_length + new_length;
                }
            } else {
                self.fs.delete(&dirty)?;
            }
        }

        self.redundant_op_count += 1;
        let sequence = self.next_sequence_number;
        let entry = self.entries.get_mut(editor_key).expect("entry present");
        entry.current_editor = None;
        if entry.readable || success {
            entry.readable = true;
            let mut line = format!("{CLEAN} {editor_key}");
            for length in &entry.lengths {
                line.push_str(&format!(" {length}"));
            }
            if success {
                entry.sequence_number = sequence;
                self.next_sequence_number += 1;
            }
            self.journal_append(&line);
        } else {
            self.entries.remove(editor_key);
            self.journal_append(&format!("{REMOVE} {editor_key}"));
        }
        self.journal_flush();

        if self.size > self.max_size || self.journal_rebuild_required() {
            self.schedule_cleanup();
        }
        Ok(())
    }

    /// Evict least-recently-used readable entries until under the bound.
    fn trim_to_size(&mut self) -> Result<()> {
        while self.size > self.max_size {
            let to_evict = self
                .entries
                .values()
                .filter(|e| e.readable)
                .min_by_key(|e| e.last_used)
                .map(|e| e.key.clone());
            let Some(key) = to_evict else {
                break;
            };
            log_debug!("evicting {key} to meet size bound");
            self.remove_entry(&key)?;
        }
        self.most_recent_trim_failed = false;
        Ok(())
    }
}

/// Detach an editor after a value-sink failure: its dirty files are deleted
/// and the entry is released for a fresh edit.
fn detach_editor(state: &Mutex<StoreState>, key: &str, editor_id: u64) {
    let mut state = state.lock().unwrap();
    let Some(entry) = state.entries.get_mut(key) else {
        return;
    };
    if entry.current_editor != Some(editor_id) {
        return;
    }
    entry.current_editor = None;
    for i in 0..state.value_count {
        let _ = state.fs.delete(&dirty_file(&state.directory, key, i));
    }
}

fn cleanup_loop(state: Weak<Mutex<StoreState>>, rx: mpsc::Receiver<()>) {
    while rx.recv().is_ok() {
        let Some(state) = state.upgrade() else {
            break;
        };
        let mut state = state.lock().unwrap();
        if !state.initialized || state.closed {
            continue;
        }
        if let Err(err) = state.trim_to_size() {
            state.most_recent_trim_failed = true;
            log_error!("background trim failed: {err}");
        }
        if state.journal_rebuild_required() {
            match state.rebuild_journal() {
                Ok(()) => state.redundant_op_count = 0,
                Err(err) => {
                    state.most_recent_rebuild_failed = true;
                    // Stop journaling until a rebuild succeeds; edits are
                    // refused while the flag is set.
                    let blackhole: Box<dyn Write + Send> = Box::new(io::sink());
                    state.journal_writer = Some(BufWriter::new(blackhole));
                    log_error!("journal rebuild failed: {err}");
                }
            }
        }
    }
}

/// An immutable view of one entry's committed values. The backing files
/// stay readable until the snapshot is dropped, even if the entry is
/// removed or overwritten in the meantime.
pub struct Snapshot {
    key: String,
    sequence_number: u64,
    sources: Vec<Option<Box<dyn Read + Send>>>,
    lengths: Vec<u64>,
}

impl Snapshot {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Sequence number at capture time; pass to [`DiskStore::edit_at`] to
    /// edit only if the entry has not changed since.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Take the reader for one value. Each index can be taken once.
    pub fn take_source(&mut self, index: usize) -> Option<Box<dyn Read + Send>> {
        self.sources.get_mut(index).and_then(|s| s.take())
    }

    pub fn length(&self, index: usize) -> u64 {
        self.lengths[index]
    }
}

/// Exclusive write handle for one key. Values are written through
/// [`Editor::new_sink`] into dirty files; [`Editor::commit`] renames them
/// into place atomically and [`Editor::abort`] discards them. Exactly one
/// of the two must be called once.
pub struct Editor {
    state: Arc<Mutex<StoreState>>,
    key: String,
    id: u64,
    written: Vec<bool>,
    done: bool,
}

impl Editor {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Reader over the last committed value, or None for a brand-new entry
    /// or a detached editor.
    pub fn new_source(&self, index: usize) -> Option<Box<dyn Read + Send>> {
        let state = self.state.lock().unwrap();
        if self.done {
            panic!("editor is already committed or aborted");
        }
        let entry = state.entries.get(&self.key)?;
        if !entry.readable || entry.current_editor != Some(self.id) {
            return None;
        }
        state
            .fs
            .source(&clean_file(&state.directory, &self.key, index))
            .ok()
    }

    /// Writer for one value slot. For a detached editor the returned sink
    /// silently discards everything, mirroring that the edit can no longer
    /// be stored.
    pub fn new_sink(&mut self, index: usize) -> Result<EditorSink> {
        let state = self.state.lock().unwrap();
        if self.done {
            panic!("editor is already committed or aborted");
        }
        let inner: Box<dyn Write + Send> = match state.entries.get(&self.key) {
            Some(entry) if entry.current_editor == Some(self.id) => {
                if !entry.readable {
                    self.written[index] = true;
                }
                state
                    .fs
                    .sink(&dirty_file(&state.directory, &self.key, index))?
            }
            _ => Box::new(io::sink()),
        };
        Ok(EditorSink {
            inner,
            state: Arc::clone(&self.state),
            key: self.key.clone(),
            editor_id: self.id,
        })
    }

    /// Publish the written values and release the key.
    pub fn commit(&mut self) -> Result<()> {
        if self.done {
            panic!("editor is already committed or aborted");
        }
        self.done = true;
        let mut state = self.state.lock().unwrap();
        let written = self.written.clone();
        state.complete_edit(&self.key, self.id, &written, true)
    }

    /// Discard the written values and release the key.
    pub fn abort(&mut self) -> Result<()> {
        if self.done {
            panic!("editor is already committed or aborted");
        }
        self.done = true;
        let mut state = self.state.lock().unwrap();
        let written = self.written.clone();
        state.complete_edit(&self.key, self.id, &written, false)
    }

    /// Abort unless commit/abort already ran. Safe to call any time, from
    /// any cleanup path; never panics.
    pub fn abort_unless_committed(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let written = self.written.clone();
        if let Err(err) = state.complete_edit(&self.key, self.id, &written, false) {
            log_error!("failed to abort edit of {}: {err}", self.key);
        }
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        // Tolerate a poisoned lock: never panic out of drop.
        if let Ok(mut state) = self.state.lock() {
            let written = self.written.clone();
            let _ = state.complete_edit(&self.key, self.id, &written, false);
        }
    }
}

/// Write half of one value slot. Write errors detach the owning editor so
/// a later commit cannot publish a half-written value.
pub struct EditorSink {
    inner: Box<dyn Write + Send>,
    state: Arc<Mutex<StoreState>>,
    key: String,
    editor_id: u64,
}

impl Write for EditorSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.write(buf) {
            Ok(n) => Ok(n),
            Err(err) => {
                detach_editor(&self.state, &self.key, self.editor_id);
                Err(err)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.flush() {
            Ok(()) => Ok(()),
            Err(err) => {
                detach_editor(&self.state, &self.key, self.editor_id);
                Err(err)
            }
        }
    }
}

/// See [`DiskStore::snapshots`].
pub struct Snapshots {
    state: Arc<Mutex<StoreState>>,
    keys: Vec<String>,
    index: usize,
    current: Option<String>,
}

impl Snapshots {
    /// Evict the entry behind the most recently returned snapshot.
    pub fn remove_current(&mut self) {
        let Some(key) = self.current.take() else {
            panic!("remove_current() before next()");
        };
        let mut state = self.state.lock().unwrap();
        if let Err(err) = state.remove_entry(&key) {
            // The entry is gone from the map regardless; the journal update
            // is what may have failed.
            log_error!("failed to remove {key} through iterator: {err}");
        }
    }
}

impl Iterator for Snapshots {
    type Item = Snapshot;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = self.keys.get(self.index)?.clone();
            self.index += 1;
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return None;
            }
            if let Some(snapshot) = state.open_snapshot(&key) {
                self.current = Some(key);
                return Some(snapshot);
            }
        }
    }
}
