//! Project-root jail for filesystem paths.
//!
//! Every path a tool touches is validated against the project root fixed at
//! startup. Reads follow symlinks and require the resolved target to stay
//! inside the root; writes additionally reject a final-component symlink and
//! open with a no-follow flag so a symlink swapped in between validation and
//! open cannot redirect the write outside the jail.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Path validation failures. These surface as tool errors, never a panic.
#[derive(Debug, thiserror::Error)]
pub enum PathGuardError {
    /// The resolved path is not inside the project root.
    #[error("path `{path}` is outside the project root")]
    OutsideRoot { path: String },

    /// The path is lexically inside the root but a symlink along it resolves
    /// outside.
    #[error("path `{path}` escapes the project root through a symlink")]
    SymlinkEscape { path: String },

    /// Write target's final component is a symlink.
    #[error("refusing to write through symlink `{path}`")]
    SymlinkWriteTarget { path: String },

    /// Underlying filesystem error during resolution.
    #[error("io error for `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl PathGuardError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// PathGuard
// ---------------------------------------------------------------------------

/// Validates filesystem paths against an absolute, symlink-resolved project
/// root fixed at construction.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// Create a guard for `root`. The root is canonicalized once so every
    /// later comparison runs against a symlink-free absolute path.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, PathGuardError> {
        let root = root.as_ref();
        let root = root
            .canonicalize()
            .map_err(|e| PathGuardError::io(root, e))?;
        Ok(Self { root })
    }

    /// The canonical project root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate a path for reading. Symlinks are followed; the resolved
    /// target must be the root itself or strictly inside it.
    pub fn validate_read(&self, path: impl AsRef<Path>) -> Result<PathBuf, PathGuardError> {
        let candidate = self.lexical_resolve(path.as_ref())?;
        let resolved = self.resolve_existing_prefix(&candidate)?;
        self.check_inside(&candidate, &resolved)?;
        Ok(resolved)
    }

    /// Validate a path for writing. Stricter than reads: the final component
    /// must not itself be a symlink, even one pointing inside the root.
    /// Non-existent tails are permitted; resolution walks up to the deepest
    /// existing ancestor.
    pub fn validate_write(&self, path: impl AsRef<Path>) -> Result<PathBuf, PathGuardError> {
        let candidate = self.lexical_resolve(path.as_ref())?;
        if candidate == self.root {
            return Ok(candidate);
        }

        // Resolve the parent (following symlinks there is fine) but keep the
        // final component unresolved so a symlink at the tail is visible.
        let (parent, name) = match (candidate.parent(), candidate.file_name()) {
            (Some(parent), Some(name)) => (parent.to_path_buf(), name.to_owned()),
            _ => {
                return Err(PathGuardError::OutsideRoot {
                    path: candidate.display().to_string(),
                });
            }
        };
        let resolved = self.resolve_existing_prefix(&parent)?.join(name);
        self.check_inside(&candidate, &resolved)?;

        match std::fs::symlink_metadata(&resolved) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(PathGuardError::SymlinkWriteTarget {
                    path: resolved.display().to_string(),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(PathGuardError::io(&resolved, e)),
        }

        Ok(resolved)
    }

    /// Validate for write and open the file without following a symlink at
    /// the final component, closing the validate-then-open race.
    pub fn open_for_write(&self, path: impl AsRef<Path>) -> Result<File, PathGuardError> {
        let resolved = self.validate_write(path)?;

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_NOFOLLOW);
        }

        let file = options
            .open(&resolved)
            .map_err(|e| match e.raw_os_error() {
                // ELOOP from O_NOFOLLOW means a symlink appeared under us.
                #[cfg(unix)]
                Some(code) if code == libc::ELOOP => PathGuardError::SymlinkWriteTarget {
                    path: resolved.display().to_string(),
                },
                _ => PathGuardError::io(&resolved, e),
            })?;

        #[cfg(not(unix))]
        {
            // Without O_NOFOLLOW, re-check after open; a failed re-check
            // refuses the handle.
            let meta = std::fs::symlink_metadata(&resolved)
                .map_err(|e| PathGuardError::io(&resolved, e))?;
            if meta.file_type().is_symlink() {
                return Err(PathGuardError::SymlinkWriteTarget {
                    path: resolved.display().to_string(),
                });
            }
        }

        Ok(file)
    }

    // -- Internal -----------------------------------------------------------

    /// Join against the root when relative, then strip `.` and resolve `..`
    /// lexically so traversal is normalized before any root comparison.
    fn lexical_resolve(&self, path: &Path) -> Result<PathBuf, PathGuardError> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        let mut out = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    // `..` above the filesystem root is an escape attempt.
                    if !out.pop() {
                        return Err(PathGuardError::OutsideRoot {
                            path: path.display().to_string(),
                        });
                    }
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }

    /// Canonicalize the deepest existing ancestor of `path` (following
    /// symlinks) and re-append the non-existent tail.
    fn resolve_existing_prefix(&self, path: &Path) -> Result<PathBuf, PathGuardError> {
        let mut existing = path.to_path_buf();
        let mut tail: Vec<std::ffi::OsString> = Vec::new();

        loop {
            match existing.canonicalize() {
                Ok(canonical) => {
                    let mut resolved = canonical;
                    for part in tail.iter().rev() {
                        resolved.push(part);
                    }
                    return Ok(resolved);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    let Some(name) = existing.file_name() else {
                        return Err(PathGuardError::io(path, e));
                    };
                    tail.push(name.to_owned());
                    if !existing.pop() {
                        return Err(PathGuardError::io(path, e));
                    }
                }
                Err(e) => return Err(PathGuardError::io(path, e)),
            }
        }
    }

    /// Require `resolved` to be the root or strictly inside it.
    ///
    /// `Path::starts_with` compares whole components, so `/project` never
    /// matches a sibling like `/projectextra`.
    fn check_inside(&self, candidate: &Path, resolved: &Path) -> Result<(), PathGuardError> {
        if resolved == self.root || resolved.starts_with(&self.root) {
            return Ok(());
        }

        // Lexically inside but resolved outside means a symlink escaped.
        if candidate.starts_with(&self.root) {
            Err(PathGuardError::SymlinkEscape {
                path: candidate.display().to_string(),
            })
        } else {
            Err(PathGuardError::OutsideRoot {
                path: candidate.display().to_string(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
