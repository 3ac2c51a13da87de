//! Writing certificate and key files.
//!
//! Each file is first written to a temp file in the destination directory and
//! synced, then renamed over its target. The certificate and key are swapped in
//! as one unit: if the second rename fails, the first is undone, so a
//! certificate never ends up next to a key it does not belong to.

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{
    fs, io,
    io::Write,
    path::{Path, PathBuf},
};

use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, warn};

use crate::error::ServerCertError;

#[cfg(unix)]
const CERT_MODE: u32 = 0o644;
#[cfg(unix)]
const KEY_MODE: u32 = 0o600;

/// Options for writing certificate and key files.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Create parent directories if they don't exist.
    pub create_parents: bool,
    /// Overwrite existing files.
    pub force: bool,
}

impl SaveOptions {
    /// Enable creating parent directories if they don't exist.
    pub fn create_parents(mut self) -> Self {
        self.create_parents = true;
        self
    }

    /// Enable overwriting existing files.
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Paths of a certificate file and its private key file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    /// Path to the PEM certificate.
    pub cert: PathBuf,
    /// Path to the PEM private key.
    pub key: PathBuf,
}

impl CertPaths {
    /// Creates paths from explicit certificate and key locations.
    pub fn new(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
        }
    }
}

/// Writes `cert_pem` and `key_pem` to `paths` as a single unit.
///
/// # Errors
///
/// - [`ServerCertError::WriteFailed`] if a directory is missing and
///   `create_parents` is false, if a file exists and `force` is false, or on
///   any I/O error. Previously existing files are left as they were.
pub fn write_pair(
    paths: &CertPaths,
    cert_pem: &str,
    key_pem: &str,
    options: &SaveOptions,
) -> Result<(), ServerCertError> {
    StagedPair::stage(paths, cert_pem, key_pem, options)?.commit()
}

/// A certificate and key written to temp files, not yet in place.
///
/// Dropping a `StagedPair` without committing deletes the temp files.
#[derive(Debug)]
pub struct StagedPair<'a> {
    paths: &'a CertPaths,
    cert: NamedTempFile,
    key: NamedTempFile,
}

impl<'a> StagedPair<'a> {
    /// Writes both files next to their destinations and syncs them.
    pub fn stage(
        paths: &'a CertPaths,
        cert_pem: &str,
        key_pem: &str,
        options: &SaveOptions,
    ) -> Result<Self, ServerCertError> {
        for target in [&paths.cert, &paths.key] {
            prepare_target(target, options)?;
        }

        #[cfg(unix)]
        let (cert_mode, key_mode) = (Some(CERT_MODE), Some(KEY_MODE));
        #[cfg(not(unix))]
        let (cert_mode, key_mode) = (None, None);

        let cert = stage_file(&paths.cert, cert_pem, cert_mode)?;
        let key = stage_file(&paths.key, key_pem, key_mode)?;
        debug!(
            cert = %paths.cert.display(),
            key = %paths.key.display(),
            "staged certificate and key"
        );
        Ok(Self { paths, cert, key })
    }

    /// Moves both files into place.
    ///
    /// If either rename fails, any file already replaced is restored from its
    /// backup and the error is returned.
    pub fn commit(self) -> Result<(), ServerCertError> {
        let mut swapped = Vec::with_capacity(2);
        for (tmp, target) in [(self.cert, &self.paths.cert), (self.key, &self.paths.key)] {
            match swap_file(tmp, target) {
                Ok(done) => swapped.push(done),
                Err(e) => {
                    for done in swapped.into_iter().rev() {
                        done.rollback();
                    }
                    return Err(e);
                }
            }
        }
        for done in swapped {
            done.finalize();
        }
        Ok(())
    }
}

/// A target that has been replaced, with the backup of its old contents.
///
/// The backup is a temp file created by [`swap_file`], never a path that
/// existed before.
struct Swapped {
    target: PathBuf,
    backup: Option<TempPath>,
}

impl Swapped {
    fn rollback(self) {
        let result = match self.backup {
            Some(backup) => backup.persist(&self.target).map_err(|e| e.error),
            None => fs::remove_file(&self.target),
        };
        if let Err(e) = result {
            warn!(path = %self.target.display(), error = %e, "unable to roll back file");
        }
    }

    fn finalize(self) {
        if let Some(backup) = self.backup {
            discard_backup(backup);
        }
    }
}

fn discard_backup(backup: TempPath) {
    let path = backup.to_path_buf();
    if let Err(e) = backup.close() {
        warn!(path = %path.display(), error = %e, "unable to remove backup");
    }
}

fn prepare_target(target: &Path, options: &SaveOptions) -> Result<(), ServerCertError> {
    let dir = parent_dir(target);
    if !dir.exists() {
        if options.create_parents {
            fs::create_dir_all(dir).map_err(|e| ServerCertError::write_failed(dir, e))?;
        } else {
            return Err(ServerCertError::write_failed(
                dir,
                io::Error::new(io::ErrorKind::NotFound, "directory does not exist"),
            ));
        }
    }
    if !options.force && target.exists() {
        return Err(ServerCertError::write_failed(
            target,
            io::Error::new(io::ErrorKind::AlreadyExists, "file already exists"),
        ));
    }
    Ok(())
}

fn stage_file(
    target: &Path,
    contents: &str,
    mode: Option<u32>,
) -> Result<NamedTempFile, ServerCertError> {
    let write_failed = |e| ServerCertError::write_failed(target, e);

    // Temp files are created 0600, so key material is never world-readable.
    let mut tmp = temp_file_in(parent_dir(target)).map_err(write_failed)?;
    tmp.write_all(contents.as_bytes()).map_err(write_failed)?;
    tmp.as_file().sync_all().map_err(write_failed)?;
    if let Some(mode) = mode {
        set_mode(tmp.path(), mode).map_err(write_failed)?;
    }
    Ok(tmp)
}

fn swap_file(tmp: NamedTempFile, target: &Path) -> Result<Swapped, ServerCertError> {
    let backup = if target.exists() {
        let backup = backup_file_in(parent_dir(target))
            .map_err(|e| ServerCertError::write_failed(target, e))?;
        if let Err(e) = fs::copy(target, &backup) {
            let err = ServerCertError::write_failed(&backup, e);
            discard_backup(backup);
            return Err(err);
        }
        Some(backup)
    } else {
        None
    };

    if let Err(e) = tmp.persist(target) {
        if let Some(backup) = backup {
            discard_backup(backup);
        }
        return Err(ServerCertError::write_failed(target, e.error));
    }

    Ok(Swapped {
        target: target.to_path_buf(),
        backup,
    })
}

fn backup_file_in(dir: &Path) -> io::Result<TempPath> {
    Ok(tempfile::Builder::new()
        .prefix(".bak")
        .tempfile_in(dir)?
        .into_temp_path())
}

/// Returns the directory containing `path`, `.` for bare file names.
pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

pub(crate) fn temp_file_in(dir: &Path) -> io::Result<NamedTempFile> {
    tempfile::Builder::new().prefix(".tmp").tempfile_in(dir)
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]

    use super::*;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn paths_in(dir: &Path) -> CertPaths {
        CertPaths::new(dir.join("server.crt"), dir.join("server.key"))
    }

    #[test]
    fn test_write_pair_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());

        write_pair(&paths, "CERT", "KEY", &SaveOptions::default()).expect("should write");

        assert_eq!(fs::read_to_string(&paths.cert).unwrap(), "CERT");
        assert_eq!(fs::read_to_string(&paths.key).unwrap(), "KEY");
        assert_eq!(entries(dir.path()), ["server.crt", "server.key"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_modes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());

        write_pair(&paths, "CERT", "KEY", &SaveOptions::default()).unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&paths.cert), CERT_MODE);
        assert_eq!(mode(&paths.key), KEY_MODE);
    }

    #[test]
    fn test_fails_if_dir_not_exists() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(&dir.path().join("nonexistent"));

        let result = write_pair(&paths, "CERT", "KEY", &SaveOptions::default());
        assert!(
            matches!(result, Err(ServerCertError::WriteFailed { ref source, .. }) if source.kind() == io::ErrorKind::NotFound),
            "expected WriteFailed(NotFound), got {result:?}"
        );
    }

    #[test]
    fn test_fails_if_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        write_pair(&paths, "CERT", "KEY", &SaveOptions::default()).unwrap();

        let result = write_pair(&paths, "CERT2", "KEY2", &SaveOptions::default());
        assert!(
            matches!(result, Err(ServerCertError::WriteFailed { ref source, .. }) if source.kind() == io::ErrorKind::AlreadyExists),
            "expected WriteFailed(AlreadyExists), got {result:?}"
        );
        assert_eq!(fs::read_to_string(&paths.cert).unwrap(), "CERT");
    }

    #[test]
    fn test_create_parents() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(&dir.path().join("a").join("b"));

        write_pair(
            &paths,
            "CERT",
            "KEY",
            &SaveOptions::default().create_parents(),
        )
        .expect("should create parents");
        assert!(paths.cert.exists());
        assert!(paths.key.exists());
    }

    #[test]
    fn test_force_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        write_pair(&paths, "OLD", "OLDKEY", &SaveOptions::default()).unwrap();

        write_pair(&paths, "NEW", "NEWKEY", &SaveOptions::default().force()).unwrap();

        assert_eq!(fs::read_to_string(&paths.cert).unwrap(), "NEW");
        assert_eq!(fs::read_to_string(&paths.key).unwrap(), "NEWKEY");
        assert_eq!(entries(dir.path()), ["server.crt", "server.key"]);
    }

    #[test]
    fn test_force_keeps_unrelated_bak_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        write_pair(&paths, "OLD", "OLDKEY", &SaveOptions::default()).unwrap();
        let user_backup = dir.path().join("server.crt.bak");
        fs::write(&user_backup, "USER BACKUP").unwrap();

        write_pair(&paths, "NEW", "NEWKEY", &SaveOptions::default().force()).unwrap();

        assert_eq!(fs::read_to_string(&user_backup).unwrap(), "USER BACKUP");
        assert_eq!(fs::read_to_string(&paths.cert).unwrap(), "NEW");
    }

    #[test]
    fn test_failed_key_swap_restores_cert() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        fs::write(&paths.cert, "OLD").unwrap();
        // A directory cannot be replaced by a file, so the key swap fails.
        fs::create_dir(&paths.key).unwrap();
        fs::write(paths.key.join("keep"), "x").unwrap();

        let result = write_pair(&paths, "NEW", "NEWKEY", &SaveOptions::default().force());

        assert!(matches!(result, Err(ServerCertError::WriteFailed { .. })));
        assert_eq!(fs::read_to_string(&paths.cert).unwrap(), "OLD");
        assert_eq!(entries(dir.path()), ["server.crt", "server.key"]);
    }

    #[test]
    fn test_failed_key_swap_removes_new_cert() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        fs::create_dir(&paths.key).unwrap();
        fs::write(paths.key.join("keep"), "x").unwrap();

        let result = write_pair(&paths, "NEW", "NEWKEY", &SaveOptions::default().force());

        assert!(result.is_err());
        assert!(!paths.cert.exists());
    }

    #[test]
    fn test_dropped_stage_leaves_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());

        let staged =
            StagedPair::stage(&paths, "CERT", "KEY", &SaveOptions::default()).unwrap();
        drop(staged);

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir(Path::new("server.crt")), Path::new("."));
        assert_eq!(parent_dir(Path::new("certs/server.crt")), Path::new("certs"));
    }
}
