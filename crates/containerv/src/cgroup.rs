//! Cgroup v2 management for container sessions.
//!
//! The manager resolves the caller's own cgroup scope from
//! `/proc/self/cgroup` so containers nest correctly under systemd
//! slices. A container cgroup's kernel id is the inode of its
//! directory; that id keys the policy map.

#![cfg(target_os = "linux")]

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{ContainerError, Result};

pub struct CgroupManager {
    root_path: PathBuf,
}

/// An owned container cgroup; removed on `remove` (or best-effort on
/// drop).
pub struct ContainerCgroup {
    path: PathBuf,
    id: u64,
}

impl CgroupManager {
    /// Resolve the unified-hierarchy scope this process lives in.
    pub fn new() -> Result<Self> {
        let mount_point = PathBuf::from("/sys/fs/cgroup");
        if !mount_point.is_dir() {
            return Err(ContainerError::NotSupported("cgroup v2 mount not found"));
        }

        let content = fs::read_to_string("/proc/self/cgroup")?;
        let line = content
            .lines()
            .find(|line| line.starts_with("0::"))
            .ok_or_else(|| {
                ContainerError::NotSupported("no unified hierarchy in /proc/self/cgroup")
            })?;
        let self_path = line
            .split("::")
            .nth(1)
            .ok_or_else(|| ContainerError::InvalidArgument("malformed cgroup line".into()))?;

        let relative = if self_path == "/" {
            Path::new("")
        } else {
            self_path.strip_prefix('/').unwrap_or(self_path).as_ref()
        };
        let root_path = mount_point.join(relative);
        if !root_path.exists() {
            return Err(ContainerError::NotFound(format!(
                "own cgroup path {}",
                root_path.display()
            )));
        }
        Ok(Self { root_path })
    }

    /// Create the cgroup for one container.
    pub fn create(&self, container_id: &str) -> Result<ContainerCgroup> {
        let name = format!("cv-{container_id}");
        let path = self.root_path.join(&name);
        if path.exists() {
            return Err(ContainerError::Busy(format!(
                "cgroup {name} already exists"
            )));
        }
        fs::create_dir(&path)?;

        // Best-effort controller delegation; we may lack permission.
        let subtree = self.root_path.join("cgroup.subtree_control");
        if subtree.exists() {
            let _ = fs::write(&subtree, "+pids");
        }

        let meta = fs::metadata(&path)?;
        Ok(ContainerCgroup {
            path,
            id: meta.ino(),
        })
    }
}

impl ContainerCgroup {
    /// Kernel cgroup id: the directory inode on cgroupfs.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_process(&self, pid: u32) -> Result<()> {
        fs::write(self.path.join("cgroup.procs"), pid.to_string())?;
        Ok(())
    }

    pub fn procs(&self) -> Result<Vec<i32>> {
        let raw = fs::read_to_string(self.path.join("cgroup.procs"))?;
        let mut pids: Vec<i32> = raw.lines().filter_map(|l| l.trim().parse().ok()).collect();
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    fn freeze_file(&self, value: &str) -> Result<()> {
        let p = self.path.join("cgroup.freeze");
        if p.exists() {
            fs::write(p, value)?;
        }
        Ok(())
    }

    pub fn freeze(&self) -> Result<()> {
        self.freeze_file("1")
    }

    pub fn thaw(&self) -> Result<()> {
        self.freeze_file("0")
    }

    /// Kill every member through `cgroup.kill`.
    pub fn kill(&self) -> Result<()> {
        let p = self.path.join("cgroup.kill");
        if !p.exists() {
            return Err(ContainerError::NotSupported("cgroup.kill missing"));
        }
        fs::write(p, "1")?;
        Ok(())
    }

    /// SIGTERM members via pidfd (immune to pid reuse), wait out the
    /// grace period, then hard-kill the rest.
    pub fn kill_graceful(&self, grace: std::time::Duration) -> Result<()> {
        let _ = self.freeze();
        let pids = self.procs().unwrap_or_default();
        let _ = self.thaw();

        for pid in pids {
            if pid <= 0 {
                continue;
            }
            pidfd_sigterm(pid);
        }

        std::thread::sleep(grace);
        self.kill()
    }

    /// Remove the cgroup directory, retrying while members drain.
    pub fn remove(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        for _ in 0..3 {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(_) => {
                    let _ = self.kill();
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
            }
        }
        fs::remove_dir(&self.path).map_err(|err| {
            ContainerError::Busy(format!(
                "cgroup {} not removable: {err}",
                self.path.display()
            ))
        })
    }
}

impl Drop for ContainerCgroup {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(err) = self.remove() {
                warn!(path = %self.path.display(), %err, "cgroup cleanup on drop failed");
            }
        }
    }
}

#[allow(unsafe_code)]
fn pidfd_sigterm(pid: i32) {
    // SAFETY: raw syscalls with checked arguments; the fd is closed on
    // every path.
    unsafe {
        let fd = libc::syscall(libc::SYS_pidfd_open, pid, 0) as i32;
        if fd >= 0 {
            let _ = libc::syscall(
                libc::SYS_pidfd_send_signal,
                fd,
                libc::SIGTERM,
                std::ptr::null::<libc::siginfo_t>(),
                0,
            );
            libc::close(fd);
        } else {
            libc::kill(pid, libc::SIGTERM);
        }
    }
}
