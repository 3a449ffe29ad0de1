//! Store file lifecycle
//!
//! File naming, backups, recovery from a file left by a newer release, and
//! the first open of the primary file with its fresh-start fallbacks.
//!
//! Naming, for a primary file `{base}{ext}`:
//!
//! | file                                    | when                                   |
//! |-----------------------------------------|----------------------------------------|
//! | `{base}_{version}{ext}`                 | versioned filename convention          |
//! | `{base}_newer_version{ext}`             | primary written by a newer schema      |
//! | `{base}_{ts}_corrupt{ext}`              | primary unreadable after repair        |
//! | `{base}_{ts}_newer_version_before_recovery{ext}` | primary replaced by recovery  |
//!
//! `ts` is unix seconds. A startup backup whose name is taken is written as
//! `{name}_{n}{ext}` instead. Startup never fails because a backup could
//! not be written; the failure is logged.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use custodian_core::{AccessError, AccessResult, OpenOptions, SchemaVersion, StoreHandle};
use tracing::{error, info, warn};

use crate::handles::HandleOpener;

/// Attempts made to copy a backup before giving up.
pub const BACKUP_ATTEMPTS: u32 = 20;

const BACKUP_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Names and locations of the primary file and its siblings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFiles {
    directory: PathBuf,
    base: String,
    extension: String,
}

impl StoreFiles {
    /// Files for `filename` (e.g. `client.store`) inside `directory`.
    pub fn new(directory: impl Into<PathBuf>, filename: &str) -> Self {
        let path = Path::new(filename);
        let base = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_string());
        let extension = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        Self {
            directory: directory.into(),
            base,
            extension,
        }
    }

    /// Directory holding the files.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Filename of the primary file.
    pub fn filename(&self) -> String {
        format!("{}{}", self.base, self.extension)
    }

    /// Path of the primary file.
    pub fn primary_path(&self) -> PathBuf {
        self.path_for(&self.filename())
    }

    /// Path of a sibling file.
    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.directory.join(filename)
    }

    /// `{base}_{version}{ext}`
    pub fn versioned_filename(&self, version: u64) -> String {
        format!("{}_{}{}", self.base, version, self.extension)
    }

    /// `{base}_newer_version{ext}`
    pub fn newer_version_filename(&self) -> String {
        format!("{}_newer_version{}", self.base, self.extension)
    }

    /// `{base}_{ts}_corrupt{ext}`
    pub fn corrupt_backup_filename(&self, timestamp: i64) -> String {
        format!("{}_{}_corrupt{}", self.base, timestamp, self.extension)
    }

    /// `{base}_{ts}_newer_version_before_recovery{ext}`
    pub fn before_recovery_filename(&self, timestamp: i64) -> String {
        format!(
            "{}_{}_newer_version_before_recovery{}",
            self.base, timestamp, self.extension
        )
    }

    /// Switch to the versioned filename for `version`.
    ///
    /// If the versioned file does not exist yet, the newest file of an older
    /// version (or else the unversioned file) is copied into place.
    pub fn apply_versioned_filename(&mut self, version: SchemaVersion) -> AccessResult<()> {
        let original = self.clone();
        let version = version.as_u64();
        self.base = format!("{}_{}", original.base, version);

        let target = self.primary_path();
        if target.exists() {
            return Ok(());
        }

        for previous in (0..version).rev() {
            let candidate = original.path_for(&original.versioned_filename(previous));
            if candidate.exists() {
                info!(
                    target: "custodian::files",
                    from = %candidate.display(),
                    to = %target.display(),
                    "Copying store file from previous version"
                );
                fs::copy(&candidate, &target)?;
                return Ok(());
            }
        }

        let unversioned = original.primary_path();
        if unversioned.exists() {
            info!(
                target: "custodian::files",
                from = %unversioned.display(),
                to = %target.display(),
                "Copying unversioned store file"
            );
            fs::copy(&unversioned, &target)?;
        }
        Ok(())
    }

    /// Copy the primary file to `backup_filename` in the same directory.
    ///
    /// Never overwrites an existing file. A missing primary file is not an
    /// error. Transient failures are retried up to [`BACKUP_ATTEMPTS`] times.
    pub fn create_backup(&self, backup_filename: &str) -> AccessResult<()> {
        let source = self.primary_path();
        let destination = self.path_for(backup_filename);
        info!(
            target: "custodian::files",
            backup = %destination.display(),
            "Creating full store file backup"
        );

        let mut attempt = 1;
        loop {
            match copy_new(&source, &destination) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists || attempt >= BACKUP_ATTEMPTS => {
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(
                        target: "custodian::files",
                        attempt,
                        error = %e,
                        "Backup attempt failed, retrying"
                    );
                    attempt += 1;
                    thread::sleep(BACKUP_RETRY_INTERVAL);
                }
            }
        }
    }

    /// Back up the primary file during startup recovery, never failing.
    ///
    /// Falls back to `{stem}_{n}{ext}` when `backup_filename` is taken. Any
    /// other failure is logged. Returns the path written, if any.
    pub(crate) fn create_recovery_backup(&self, backup_filename: &str) -> Option<PathBuf> {
        let name = Path::new(backup_filename);
        let stem = name
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| backup_filename.to_string());
        let extension = name
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let mut candidate = backup_filename.to_string();
        for n in 1..=BACKUP_ATTEMPTS {
            match self.create_backup(&candidate) {
                Ok(()) => return Some(self.path_for(&candidate)),
                Err(AccessError::Io(ref e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                    candidate = format!("{}_{}{}", stem, n, extension);
                }
                Err(e) => {
                    error!(
                        target: "custodian::files",
                        backup = %self.path_for(&candidate).display(),
                        error = %e,
                        "Failed to back up store file"
                    );
                    return None;
                }
            }
        }
        error!(
            target: "custodian::files",
            backup = backup_filename,
            "No free backup filename left"
        );
        None
    }

    fn remove_primary(&self) -> io::Result<()> {
        match fs::remove_file(self.primary_path()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

fn copy_new(source: &Path, destination: &Path) -> io::Result<()> {
    let mut input = match fs::File::open(source) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let mut output = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)?;
    let copied = io::copy(&mut input, &mut output).and_then(|_| output.sync_all());
    if copied.is_err() {
        // Leave nothing behind that would make the retry hit AlreadyExists
        drop(output);
        let _ = fs::remove_file(destination);
    }
    copied
}

fn timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Replace the primary file with `recovery_filename` if that file opens at
/// the current schema.
///
/// Returns false, leaving the primary file in place, when the recovery file
/// cannot be opened, the primary cannot be backed up, or the copy fails.
pub(crate) fn attempt_recover_from_file(
    opener: &HandleOpener<'_>,
    options: &OpenOptions,
    files: &StoreFiles,
    recovery_filename: &str,
) -> bool {
    let recovery_path = files.path_for(recovery_filename);
    info!(
        target: "custodian::db",
        file = %recovery_path.display(),
        "Performing recovery from newer version file"
    );

    match opener.open(&options.with_path(&recovery_path)) {
        Ok(handle) => drop(handle),
        Err(e) => {
            info!(
                target: "custodian::db",
                error = %e,
                "Recovery aborted as the newer version could not be loaded by this version"
            );
            return false;
        }
    }

    if files.primary_path().exists()
        && files
            .create_recovery_backup(&files.before_recovery_filename(timestamp()))
            .is_none()
    {
        warn!(target: "custodian::db", "Recovery aborted as the current store file could not be backed up");
        return false;
    }

    // Copy beside the primary first so a failed copy never leaves a partial primary
    let staged = files.path_for(&format!("{}.recovering", files.filename()));
    let replaced = fs::copy(&recovery_path, &staged).and_then(|_| fs::rename(&staged, files.primary_path()));
    if let Err(e) = replaced {
        let _ = fs::remove_file(&staged);
        error!(target: "custodian::db", error = %e, "Recovery aborted as the newer version could not be moved into place");
        return false;
    }
    if let Err(e) = fs::remove_file(&recovery_path) {
        warn!(target: "custodian::db", error = %e, "Recovered, but the newer version file could not be removed");
    }

    info!(target: "custodian::db", "Recovery complete");
    true
}

/// Open the primary file for the first time, recovering where possible.
///
/// A file from a newer schema, or one still unreadable after a repair
/// attempt, is backed up and replaced by a fresh store. The repair cuts a
/// torn final write, keeping every committed frame. I/O and lock failures
/// propagate: the file may be fine and must not be wiped.
pub(crate) fn prepare_first_access(
    opener: &HandleOpener<'_>,
    options: &OpenOptions,
    files: &StoreFiles,
) -> AccessResult<Box<dyn StoreHandle>> {
    let newer_version = files.newer_version_filename();
    if files.path_for(&newer_version).exists() {
        info!(target: "custodian::db", "A newer store file has been found, attempting recovery");
        attempt_recover_from_file(opener, options, files, &newer_version);
    }

    match opener.open(options) {
        Ok(handle) => return Ok(handle),
        Err(e) if e.is_schema_too_new() => {
            let backup = files.create_recovery_backup(&newer_version);
            error!(
                target: "custodian::db",
                error = %e,
                backup = ?backup,
                "Store file is too new for this version; starting with a fresh store"
            );
        }
        Err(e) if e.is_recoverable_corruption() => {
            warn!(target: "custodian::db", error = %e, "Store file failed to open, attempting repair");
            match repair_and_reopen(opener, options, files) {
                Ok(handle) => {
                    info!(target: "custodian::db", "Store file repaired");
                    return Ok(handle);
                }
                Err(e) => {
                    let backup = files.create_recovery_backup(&files.corrupt_backup_filename(timestamp()));
                    error!(
                        target: "custodian::db",
                        error = %e,
                        backup = ?backup,
                        "Store startup failed with an unrecoverable error; starting with a fresh store"
                    );
                }
            }
        }
        Err(e) => return Err(e.into()),
    }

    files.remove_primary()?;
    opener.open(options).map_err(AccessError::from_open_failure)
}

/// Open the file read/write once to settle a pending OS-level truncation,
/// let the engine cut a torn final write, then try the engine again.
fn repair_and_reopen(
    opener: &HandleOpener<'_>,
    options: &OpenOptions,
    files: &StoreFiles,
) -> AccessResult<Box<dyn StoreHandle>> {
    drop(
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(files.primary_path())?,
    );
    if opener.engine.repair(options)? {
        info!(target: "custodian::db", "Discarded an incomplete final write");
    }
    opener.open(options).map_err(AccessError::from_open_failure)
}
