//! Pre-mutation file checkpoints.
//!
//! The loop opens a checkpoint at the start of each iteration; the tool
//! executor snapshots every file a mutating tool is about to touch; the loop
//! commits at iteration end. `/rewind` pops the most recent committed
//! checkpoint and restores every recorded path byte-for-byte, including mode
//! bits, deleting files that did not exist before the iteration.
//!
//! Snapshots hold owned byte buffers in memory only; nothing is persisted.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{AgentError, Result};

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// The recorded pre-mutation state of a single path.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    /// File contents before the mutation, or `None` if the file was absent.
    pub contents: Option<Vec<u8>>,
    /// Unix permission bits, when the file existed on a platform that has
    /// them.
    pub mode: Option<u32>,
}

impl FileSnapshot {
    fn absent() -> Self {
        Self {
            contents: None,
            mode: None,
        }
    }
}

/// All files touched during one loop iteration.
#[derive(Debug)]
pub struct Checkpoint {
    /// Identifier for listing.
    pub id: Uuid,
    /// The user prompt that triggered the iteration.
    pub prompt: String,
    /// When the iteration started.
    pub created_at: DateTime<Utc>,
    files: HashMap<PathBuf, FileSnapshot>,
}

impl Checkpoint {
    fn new(prompt: String) -> Self {
        Self {
            id: Uuid::now_v7(),
            prompt,
            created_at: Utc::now(),
            files: HashMap::new(),
        }
    }

    /// Number of recorded paths.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether no path has been recorded.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Outcome of a rewind, reported even when some restores failed.
#[derive(Debug)]
pub struct RewindReport {
    /// Prompt of the checkpoint that was rewound.
    pub prompt: String,
    /// Paths restored successfully.
    pub restored: usize,
    /// Per-path failures; restoration continued past each one.
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CheckpointState {
    current: Option<Checkpoint>,
    committed: VecDeque<Checkpoint>,
}

/// Owns the current checkpoint and the bounded ring of committed ones.
///
/// Concurrency-safe behind an internal mutex; no lock is held across an
/// await point (all filesystem work here is synchronous and short).
pub struct CheckpointManager {
    state: Mutex<CheckpointState>,
    capacity: usize,
}

impl CheckpointManager {
    /// Create a manager whose committed ring holds at most `capacity`
    /// checkpoints.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CheckpointState::default()),
            capacity: capacity.max(1),
        }
    }

    /// Open a new current checkpoint, discarding any uncommitted one.
    pub fn start(&self, prompt: impl Into<String>) {
        let mut state = self.state.lock().expect("checkpoint mutex poisoned");
        state.current = Some(Checkpoint::new(prompt.into()));
    }

    /// Record the pre-mutation state of `path` into the current checkpoint.
    ///
    /// The first snapshot of a path wins; later calls within the same
    /// checkpoint are no-ops, so the recorded state is always the one from
    /// before the iteration's first touch. Calling with no open checkpoint
    /// is a no-op.
    pub fn snapshot(&self, path: &Path) -> Result<()> {
        {
            let state = self.state.lock().expect("checkpoint mutex poisoned");
            match &state.current {
                None => return Ok(()),
                Some(current) if current.files.contains_key(path) => return Ok(()),
                Some(_) => {}
            }
        }

        // Read outside the lock; mutating tools are never dispatched
        // concurrently, so the state cannot change under us.
        let snapshot = read_snapshot(path)?;

        let mut state = self.state.lock().expect("checkpoint mutex poisoned");
        if let Some(current) = &mut state.current {
            current.files.entry(path.to_path_buf()).or_insert(snapshot);
            tracing::debug!(path = %path.display(), "pre-mutation snapshot recorded");
        }
        Ok(())
    }

    /// Commit the current checkpoint. Empty checkpoints are dropped, never
    /// enqueued; the oldest committed checkpoint is evicted past capacity.
    pub fn commit(&self) {
        let mut state = self.state.lock().expect("checkpoint mutex poisoned");
        let Some(current) = state.current.take() else {
            return;
        };
        if current.is_empty() {
            return;
        }

        tracing::debug!(
            files = current.len(),
            prompt = %current.prompt,
            "checkpoint committed"
        );
        state.committed.push_back(current);
        while state.committed.len() > self.capacity {
            state.committed.pop_front();
        }
    }

    /// Pop the most recent committed checkpoint and restore every recorded
    /// path. Individual failures are collected and reported; the remaining
    /// paths are still attempted.
    pub fn rewind(&self) -> Result<RewindReport> {
        let checkpoint = {
            let mut state = self.state.lock().expect("checkpoint mutex poisoned");
            state.committed.pop_back().ok_or(AgentError::NoCheckpoint)?
        };

        let mut report = RewindReport {
            prompt: checkpoint.prompt.clone(),
            restored: 0,
            errors: Vec::new(),
        };

        for (path, snapshot) in &checkpoint.files {
            match restore_snapshot(path, snapshot) {
                Ok(()) => report.restored += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "restore failed");
                    report.errors.push(format!("{}: {e}", path.display()));
                }
            }
        }

        tracing::info!(
            restored = report.restored,
            failed = report.errors.len(),
            prompt = %report.prompt,
            "checkpoint rewound"
        );
        Ok(report)
    }

    /// Prompts of committed checkpoints, oldest first.
    pub fn list(&self) -> Vec<(Uuid, String)> {
        let state = self.state.lock().expect("checkpoint mutex poisoned");
        state
            .committed
            .iter()
            .map(|c| (c.id, c.prompt.clone()))
            .collect()
    }

    /// Number of committed checkpoints.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("checkpoint mutex poisoned")
            .committed
            .len()
    }

    /// Whether no checkpoint has been committed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Paths recorded in the most recent committed checkpoint together with
    /// their snapshots. Used by the verification stage to render diffs.
    pub fn latest_files(&self) -> Vec<(PathBuf, FileSnapshot)> {
        let state = self.state.lock().expect("checkpoint mutex poisoned");
        state
            .committed
            .back()
            .map(|c| {
                c.files
                    .iter()
                    .map(|(p, s)| (p.clone(), s.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Filesystem helpers
// ---------------------------------------------------------------------------

fn read_snapshot(path: &Path) -> Result<FileSnapshot> {
    match std::fs::read(path) {
        Ok(contents) => {
            let mode = file_mode(path)?;
            Ok(FileSnapshot {
                contents: Some(contents),
                mode,
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(FileSnapshot::absent()),
        Err(e) => Err(e.into()),
    }
}

fn restore_snapshot(path: &Path, snapshot: &FileSnapshot) -> io::Result<()> {
    match &snapshot.contents {
        Some(bytes) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, bytes)?;
            #[cfg(unix)]
            if let Some(mode) = snapshot.mode {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
            }
            Ok(())
        }
        None => match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        },
    }
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Result<Option<u32>> {
    use std::os::unix::fs::PermissionsExt;
    Ok(Some(std::fs::metadata(path)?.permissions().mode()))
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Result<Option<u32>> {
    Ok(None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
