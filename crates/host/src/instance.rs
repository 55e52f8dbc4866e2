//! Single-instance guard
//!
//! Two hosts driving the same accessory would fight over its interface. The
//! first host to start holds an exclusive advisory lock on a PID file; later
//! ones fail fast. The lock goes away with the process.

use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Held for as long as this process is the running host
#[derive(Debug)]
pub struct InstanceLock {
    _file: Flock<File>,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock at `path` and record our PID in it
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create lock directory: {}", parent.display())
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        let mut file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, Errno::EWOULDBLOCK)) => {
                let holder = fs::read_to_string(path).unwrap_or_default();
                return Err(anyhow!(
                    "Another aoa-host is already running (pid {}, lock {})",
                    holder.trim(),
                    path.display()
                ));
            }
            Err((_, errno)) => {
                return Err(anyhow!("Failed to lock {}: {}", path.display(), errno));
            }
        };

        file.set_len(0)
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .with_context(|| format!("Failed to write lock file: {}", path.display()))?;

        tracing::debug!("Holding instance lock {}", path.display());
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
