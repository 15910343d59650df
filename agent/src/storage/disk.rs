//! Quota-bounded on-disk queue for one signal kind.
//!
//! Layout: `<root>/<kind dir>/<created_ms>`, one file per write window. Each
//! file is a sequence of frames `[u32 le length][payload]`. Exactly one file is
//! writable at a time; it is sealed when it gets too old or the next frame would
//! push it past `max_file_size_bytes`. Files are read oldest first, one frame per
//! call, and a frame is only removed once the reader acknowledges delivery.
//!
//! Writer, reader and evictor all go through the same mutex and the writable
//! file is excluded from reads and eviction, so no file is ever read or deleted
//! while it is being appended to.

use super::{CacheStorage, Clock, SystemClock, DEFAULT_STORAGE_SUBDIR};
use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::metrics;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use telemetry_shared::SignalKind;
use tracing::{debug, info, warn};

const FRAME_HEADER_LEN: u64 = 4;
const TEMP_EXTENSION: &str = "tmp";
const PROBE_FILE: &str = ".probe";

/// A buffer file as seen on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferFile {
    pub created_ms: u64,
    pub path: PathBuf,
    pub size: u64,
}

/// The head frame of a readable file. Hand it back to
/// [`DiskBufferStore::acknowledge`] once its payload was delivered.
#[derive(Debug, Clone)]
pub struct StoredFrame {
    pub path: PathBuf,
    frame_len: u64,
    pub payload: Vec<u8>,
}

struct WritableFile {
    path: PathBuf,
    created_ms: u64,
    size: u64,
    file: File,
}

struct StoreState {
    writable: Option<WritableFile>,
    last_created_ms: u64,
}

enum Head {
    Empty,
    Frame(usize),
    Truncated,
}

fn first_frame(bytes: &[u8]) -> Head {
    if bytes.is_empty() {
        return Head::Empty;
    }
    if bytes.len() < FRAME_HEADER_LEN as usize {
        return Head::Truncated;
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if bytes.len() - (FRAME_HEADER_LEN as usize) < len {
        Head::Truncated
    } else {
        Head::Frame(len)
    }
}

fn list_files(dir: &Path) -> io::Result<Vec<BufferFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let created_ms = match entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) {
            Some(ms) => ms,
            None => continue,
        };
        let meta = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        files.push(BufferFile {
            created_ms,
            path: entry.path(),
            size: meta.len(),
        });
    }
    files.sort_by_key(|f| f.created_ms);
    Ok(files)
}

fn probe_writable(dir: &Path) -> Result<(), StorageError> {
    let probe = dir.join(PROBE_FILE);
    let inaccessible = |source| StorageError::Inaccessible {
        path: dir.to_path_buf(),
        source,
    };
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe)
        .map_err(inaccessible)?;
    fs::remove_file(&probe).map_err(inaccessible)
}

/// Leftovers of an interrupted acknowledge; the original file is still intact.
fn remove_temp_files(dir: &Path) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(TEMP_EXTENSION) {
            let _ = fs::remove_file(&path);
        }
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

pub struct DiskBufferStore {
    kind: SignalKind,
    dir: PathBuf,
    config: StorageConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<StoreState>,
}

impl DiskBufferStore {
    /// Open (creating if needed) the store for `kind`.
    pub fn open(
        kind: SignalKind,
        config: &StorageConfig,
        cache: &dyn CacheStorage,
    ) -> Result<Self, StorageError> {
        Self::open_with_clock(kind, config, cache, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        kind: SignalKind,
        config: &StorageConfig,
        cache: &dyn CacheStorage,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let root = match &config.root_dir {
            Some(dir) => dir.clone(),
            None => cache.cache_dir()?.join(DEFAULT_STORAGE_SUBDIR),
        };
        let dir = root.join(kind.dir_name());
        fs::create_dir_all(&dir).map_err(|source| StorageError::Inaccessible {
            path: dir.clone(),
            source,
        })?;
        probe_writable(&dir)?;
        remove_temp_files(&dir);

        // Everything already on disk came from an earlier process: sealed.
        let existing = list_files(&dir).map_err(|source| StorageError::Inaccessible {
            path: dir.clone(),
            source,
        })?;
        let bytes: u64 = existing.iter().map(|f| f.size).sum();
        metrics::DISK_BYTES
            .with_label_values(&[kind.as_str()])
            .set(bytes as f64);
        info!(
            "{} disk buffer opened at {} ({} files, {} bytes carried over)",
            kind,
            dir.display(),
            existing.len(),
            bytes
        );

        Ok(Self {
            kind,
            dir,
            config: config.clone(),
            clock,
            state: Mutex::new(StoreState {
                writable: None,
                last_created_ms: existing.last().map(|f| f.created_ms).unwrap_or(0),
            }),
        })
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StorageError> {
        self.state.lock().map_err(|_| StorageError::Poisoned)
    }

    /// All buffer files, oldest first.
    pub fn files(&self) -> Result<Vec<BufferFile>, StorageError> {
        let _state = self.lock()?;
        Ok(list_files(&self.dir)?)
    }

    pub fn size_on_disk(&self) -> Result<u64, StorageError> {
        Ok(self.files()?.iter().map(|f| f.size).sum())
    }

    /// Path of the file currently accepting appends, if any.
    pub fn writable_file(&self) -> Result<Option<PathBuf>, StorageError> {
        Ok(self.lock()?.writable.as_ref().map(|w| w.path.clone()))
    }

    /// Append one frame, rolling over to a new file when needed, then evict
    /// the oldest sealed files until the folder is back under quota.
    pub fn append(&self, payload: &[u8]) -> Result<(), StorageError> {
        let header = u32::try_from(payload.len()).map_err(|_| {
            StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "payload larger than 4 GiB",
            ))
        })?;
        let frame_len = FRAME_HEADER_LEN + payload.len() as u64;

        let mut state = self.lock()?;
        let now = self.clock.now_millis();
        self.seal_if_unwritable(&mut state, now, frame_len);

        let open = state.writable.take();
        let mut writable = match open {
            Some(w) => w,
            None => self.create_file(&mut state.last_created_ms, now)?,
        };

        let mut frame = Vec::with_capacity(frame_len as usize);
        frame.extend_from_slice(&header.to_le_bytes());
        frame.extend_from_slice(payload);
        if let Err(e) = writable.file.write_all(&frame) {
            // The file may now end in a partial frame; leave it sealed so the
            // reader drops the tail.
            metrics::DISK_APPENDS
                .with_label_values(&[self.kind.as_str(), "error"])
                .inc();
            return Err(e.into());
        }
        writable.size += frame_len;
        if self.config.debug_enabled {
            debug!(
                "{} appended {} bytes to {} (now {} bytes)",
                self.kind,
                frame_len,
                writable.path.display(),
                writable.size
            );
        }
        let current = writable.path.clone();
        state.writable = Some(writable);
        metrics::DISK_APPENDS
            .with_label_values(&[self.kind.as_str(), "ok"])
            .inc();

        if let Err(e) = self.enforce_quota(&current) {
            warn!("{} disk quota enforcement failed: {}", self.kind, e);
        }
        Ok(())
    }

    /// Oldest readable frame, or `None` when nothing is eligible yet.
    ///
    /// A file is readable once it is sealed and its age lies in
    /// `[min_file_age_for_read_ms, max_file_age_for_read_ms]`. Older files are
    /// deleted on sight; empty files and files with a truncated head frame too.
    pub fn read_next(&self) -> Result<Option<StoredFrame>, StorageError> {
        let mut state = self.lock()?;
        let now = self.clock.now_millis();
        self.seal_if_unwritable(&mut state, now, 0);
        let writable = state.writable.as_ref().map(|w| w.path.clone());

        for file in list_files(&self.dir)? {
            if writable.as_ref() == Some(&file.path) {
                continue;
            }
            let age = now.saturating_sub(file.created_ms);
            if age > self.config.max_file_age_for_read_ms {
                self.discard(&file, "aged_out");
                continue;
            }
            if age < self.config.min_file_age_for_read_ms {
                // Sorted oldest first: everything after is younger still.
                break;
            }

            let bytes = match fs::read(&file.path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match first_frame(&bytes) {
                Head::Frame(len) => {
                    let start = FRAME_HEADER_LEN as usize;
                    if self.config.debug_enabled {
                        debug!("{} read {} bytes from {}", self.kind, len, file.path.display());
                    }
                    return Ok(Some(StoredFrame {
                        path: file.path,
                        frame_len: FRAME_HEADER_LEN + len as u64,
                        payload: bytes[start..start + len].to_vec(),
                    }));
                }
                Head::Empty => {
                    remove_if_present(&file.path)?;
                }
                Head::Truncated => {
                    self.discard(&file, "corrupt");
                }
            }
        }
        Ok(None)
    }

    /// Remove a delivered frame from the head of its file. The file is deleted
    /// when nothing is left. A frame whose file was evicted meanwhile is a no-op.
    pub fn acknowledge(&self, frame: &StoredFrame) -> Result<(), StorageError> {
        let _state = self.lock()?;
        let bytes = match fs::read(&frame.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let start = FRAME_HEADER_LEN as usize;
        let still_head = match first_frame(&bytes) {
            Head::Frame(len) => {
                FRAME_HEADER_LEN + len as u64 == frame.frame_len
                    && bytes[start..start + len] == frame.payload[..]
            }
            _ => false,
        };
        if !still_head {
            debug!(
                "{} frame in {} already acknowledged",
                self.kind,
                frame.path.display()
            );
            return Ok(());
        }

        let rest = &bytes[frame.frame_len as usize..];
        if rest.is_empty() {
            remove_if_present(&frame.path)?;
        } else {
            let tmp = frame.path.with_extension(TEMP_EXTENSION);
            fs::write(&tmp, rest)?;
            fs::rename(&tmp, &frame.path)?;
        }
        if self.config.debug_enabled {
            debug!(
                "{} acknowledged {} bytes from {} ({} left)",
                self.kind,
                frame.frame_len,
                frame.path.display(),
                rest.len()
            );
        }
        Ok(())
    }

    fn seal_if_unwritable(&self, state: &mut StoreState, now: u64, next_frame_len: u64) {
        let reason = match &state.writable {
            Some(w) if now.saturating_sub(w.created_ms) > self.config.max_file_age_for_write_ms => {
                "age"
            }
            Some(w) if w.size > 0 && w.size + next_frame_len > self.config.max_file_size_bytes => {
                "size"
            }
            _ => return,
        };
        if let Some(sealed) = state.writable.take() {
            if self.config.debug_enabled {
                debug!(
                    "{} sealed {} at {} bytes ({})",
                    self.kind,
                    sealed.path.display(),
                    sealed.size,
                    reason
                );
            }
        }
    }

    fn create_file(&self, last_created_ms: &mut u64, now: u64) -> Result<WritableFile, StorageError> {
        // Names must be unique and sort in creation order.
        let mut created_ms = now.max(last_created_ms.saturating_add(1));
        loop {
            let path = self.dir.join(created_ms.to_string());
            match OpenOptions::new().append(true).create_new(true).open(&path) {
                Ok(file) => {
                    *last_created_ms = created_ms;
                    if self.config.debug_enabled {
                        debug!("{} opened buffer file {}", self.kind, path.display());
                    }
                    return Ok(WritableFile {
                        path,
                        created_ms,
                        size: 0,
                        file,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => created_ms += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn enforce_quota(&self, writable: &Path) -> Result<(), StorageError> {
        let files = list_files(&self.dir)?;
        let mut total: u64 = files.iter().map(|f| f.size).sum();

        for file in &files {
            if total <= self.config.max_folder_size_bytes {
                break;
            }
            if file.path == writable {
                continue;
            }
            match remove_if_present(&file.path) {
                Ok(()) => {
                    total -= file.size;
                    metrics::DISK_EVICTIONS
                        .with_label_values(&[self.kind.as_str(), "quota"])
                        .inc();
                    warn!(
                        "{} disk buffer over quota: evicted {} ({} bytes)",
                        self.kind,
                        file.path.display(),
                        file.size
                    );
                }
                Err(e) => warn!("failed to evict {}: {}", file.path.display(), e),
            }
        }

        metrics::DISK_BYTES
            .with_label_values(&[self.kind.as_str()])
            .set(total as f64);
        Ok(())
    }

    fn discard(&self, file: &BufferFile, reason: &str) {
        match remove_if_present(&file.path) {
            Ok(()) => {
                metrics::DISK_EVICTIONS
                    .with_label_values(&[self.kind.as_str(), reason])
                    .inc();
                warn!(
                    "{} discarded buffer file {} ({} bytes, {})",
                    self.kind,
                    file.path.display(),
                    file.size,
                    reason
                );
            }
            Err(e) => warn!("failed to discard {}: {}", file.path.display(), e),
        }
    }
}
