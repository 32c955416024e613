//! Per-host instance lock
//!
//! Two deployer instances on one host must not claim overlapping port
//! ranges. Each instance writes a lock file named after its port range and a
//! digest of its install path; startup fails while another live instance
//! holds the same file.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Default lock directory root
pub const LOCK_DIR: &str = "/var/lock";

#[derive(Error, Debug)]
pub enum LockError {
    #[error("another instance holds {path} (pid {pid})")]
    Held { path: PathBuf, pid: String },

    #[error("failed to create lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive lock file for one deployer instance.
///
/// Removed on drop; a crashed process leaves the file behind, which the next
/// start reclaims when the recorded pid is no longer alive.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

/// First 16 hex chars of the SHA-256 digest of the canonical install path.
pub fn instance_id(install_path: &Path) -> String {
    let canonical = install_path
        .canonicalize()
        .unwrap_or_else(|_| install_path.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

impl InstanceLock {
    /// Acquire the lock under the default `/var/lock/<app>/` directory.
    pub fn acquire(
        app: &str,
        start_range: u16,
        stop_range: u16,
        install_path: &Path,
    ) -> Result<Self, LockError> {
        Self::acquire_in(Path::new(LOCK_DIR), app, start_range, stop_range, install_path)
    }

    /// Acquire the lock under an explicit base directory.
    pub fn acquire_in(
        base: &Path,
        app: &str,
        start_range: u16,
        stop_range: u16,
        install_path: &Path,
    ) -> Result<Self, LockError> {
        let dir = base.join(app);
        fs::create_dir_all(&dir).map_err(|source| LockError::Io {
            path: dir.clone(),
            source,
        })?;

        let name = format!(
            "{}-{}_{}",
            start_range,
            stop_range,
            instance_id(install_path)
        );
        let path = dir.join(name);

        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                info!(lock = %path.display(), "Acquired instance lock");
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let pid = fs::read_to_string(&path).unwrap_or_default();
                if pid_is_alive(pid.trim()) {
                    Err(LockError::Held {
                        path,
                        pid: pid.trim().to_string(),
                    })
                } else {
                    warn!(lock = %path.display(), stale_pid = %pid.trim(), "Reclaiming stale instance lock");
                    let mut file = fs::OpenOptions::new()
                        .write(true)
                        .truncate(true)
                        .open(&path)
                        .map_err(|source| LockError::Io {
                            path: path.clone(),
                            source,
                        })?;
                    let _ = write!(file, "{}", std::process::id());
                    Ok(Self { path })
                }
            }
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn pid_is_alive(pid: &str) -> bool {
    match pid.parse::<u32>() {
        Ok(pid) => Path::new(&format!("/proc/{}", pid)).exists(),
        Err(_) => false,
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to remove instance lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_is_16_hex_chars() {
        let id = instance_id(Path::new("/opt/ctf-deployer"));
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_instance_id_is_stable() {
        let a = instance_id(Path::new("/opt/ctf-deployer"));
        let b = instance_id(Path::new("/opt/ctf-deployer"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock =
            InstanceLock::acquire_in(dir.path(), "ctf-deployer", 9000, 9100, Path::new("/tmp"))
                .expect("first acquire");
        let path = lock.path().to_path_buf();
        assert!(path.exists());

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let _lock =
            InstanceLock::acquire_in(dir.path(), "ctf-deployer", 9000, 9100, Path::new("/tmp"))
                .expect("first acquire");

        let err =
            InstanceLock::acquire_in(dir.path(), "ctf-deployer", 9000, 9100, Path::new("/tmp"))
                .expect_err("held lock");
        assert!(matches!(err, LockError::Held { .. }));
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let lock_dir = dir.path().join("ctf-deployer");
        fs::create_dir_all(&lock_dir).unwrap();
        let name = format!("9000-9100_{}", instance_id(Path::new("/tmp")));
        // Pid 0 never appears under /proc.
        fs::write(lock_dir.join(&name), "0").unwrap();

        let lock =
            InstanceLock::acquire_in(dir.path(), "ctf-deployer", 9000, 9100, Path::new("/tmp"))
                .expect("stale lock reclaimed");
        assert!(lock.path().exists());
    }

    #[test]
    fn test_distinct_ranges_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let _a = InstanceLock::acquire_in(dir.path(), "ctf-deployer", 9000, 9100, Path::new("/tmp"))
            .unwrap();
        let _b = InstanceLock::acquire_in(dir.path(), "ctf-deployer", 9100, 9200, Path::new("/tmp"))
            .unwrap();
    }
}
