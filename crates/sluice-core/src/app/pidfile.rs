//! PidFile - 1 台のマシンで Foreman が 2 つ動くのを防ぐ
//!
//! 競合を完全には防げないが、よくあるミス（手で 2 つ目を起動、同じパスで 2 インストール）は捕まえる
//! 生存確認は unix では `kill(pid, 0)`
//! それ以外では記録された pid は常に生存扱いで、古いファイルは手で消す

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::ForemanError;

#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // シグナル 0：存在と権限の確認だけ
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

impl PidFile {
    /// 自分の pid を `path` に書く
    ///
    /// 既存ファイルが生きているプロセスを指していれば `AlreadyRunning`
    /// 古い、または読めないファイルは置き換える
    pub fn acquire(path: &Path) -> Result<Self, ForemanError> {
        let own = std::process::id();
        match fs::read_to_string(path) {
            Ok(content) => match content.trim().parse::<u32>() {
                Ok(pid) if pid != own && pid_is_alive(pid) => {
                    return Err(ForemanError::AlreadyRunning {
                        pid,
                        path: path.to_path_buf(),
                    });
                }
                Ok(pid) => warn!(pid, path = %path.display(), "stale pid file found, replacing it"),
                Err(e) => warn!(path = %path.display(), error = %e, "unreadable pid file, replacing it"),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "could not read pid file, replacing it"),
        }

        let write = || -> io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, own.to_string())
        };
        write().map_err(|source| ForemanError::PidFile {
            path: path.to_path_buf(),
            source,
        })?;

        info!(pid = own, path = %path.display(), "pid file written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "pid file removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "could not remove pid file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_own_pid_and_removes_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("foreman.pid");

        let pid_file = PidFile::acquire(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );

        pid_file.release();
        assert!(!path.exists());
    }

    #[test]
    fn stale_pid_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.pid");
        // pid_t で表現できない
        fs::write(&path, "4294967000").unwrap();

        let _pid_file = PidFile::acquire(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    #[cfg(unix)]
    fn exited_process_counts_as_stale() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!pid_is_alive(pid));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.pid");
        fs::write(&path, pid.to_string()).unwrap();
        assert!(PidFile::acquire(&path).is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn live_pid_aborts_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.pid");
        // pid 1 は常に生きていて、自分ではない
        fs::write(&path, "1").unwrap();

        let err = PidFile::acquire(&path).unwrap_err();
        assert!(matches!(err, ForemanError::AlreadyRunning { pid: 1, .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "1");
    }
}
