//! PID file handling.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Create the PID file, refusing when a live process already owns it. A
    /// stale file left behind by a dead process is taken over.
    pub fn create(path: &Path) -> Result<PidFile> {
        match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())
                    .with_context(|| format!("write of pid file {} failed", path.display()))?;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("read of pid file {} failed", path.display()))?;
                if let Ok(pid) = contents.trim().parse::<u32>() {
                    if pid_alive(pid) {
                        bail!("pid file {} is in use by process {}", path.display(), pid);
                    }
                }
                fs::write(path, format!("{}\n", std::process::id()))
                    .with_context(|| format!("write of pid file {} failed", path.display()))?;
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("create of pid file {} failed", path.display()));
            }
        }

        Ok(PidFile {
            path: path.to_path_buf(),
        })
    }

    pub fn remove(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

// Without procfs a leftover file is assumed stale and taken over.
#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mdns-bridge-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn create_writes_our_pid() {
        let path = scratch_path("create");
        let pidfile = PidFile::create(&path).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        pidfile.remove();
        assert!(!path.exists());
    }

    #[test]
    fn live_pid_is_refused_and_stale_pid_taken_over() {
        let path = scratch_path("stale");

        // Our own pid is definitely alive.
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        if cfg!(target_os = "linux") {
            assert!(PidFile::create(&path).is_err());
        }

        // A pid beyond the default pid_max is definitely dead.
        fs::write(&path, "4194400\n").unwrap();
        let pidfile = PidFile::create(&path).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        pidfile.remove();
    }
}
