//! Mount plan construction and execution.
//!
//! A plan is an ordered list of `(what, where, fstype, flags)` entries.
//! Execution is idempotent: entries already performed (keyed by
//! source+target) are skipped, so a plan can be replayed inside a fresh
//! mount namespace.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ContainerError, Result};

/// Entry flags; a subset of `{bind, recursive, readonly, create}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountFlags {
    #[serde(default)]
    pub bind: bool,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub create: bool,
}

impl MountFlags {
    pub fn bind() -> Self {
        Self {
            bind: true,
            recursive: true,
            ..Default::default()
        }
    }

    pub fn bind_ro() -> Self {
        Self {
            bind: true,
            recursive: true,
            readonly: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    /// Source device, directory, or pseudo-fs name.
    pub what: String,
    /// Absolute target path.
    pub target: PathBuf,
    /// Filesystem type for non-bind mounts.
    #[serde(default)]
    pub fstype: Option<String>,
    /// `data` string handed to mount(2) (e.g. overlay dirs).
    #[serde(default)]
    pub options: Option<String>,
    #[serde(default)]
    pub flags: MountFlags,
}

impl MountEntry {
    pub fn bind(what: impl Into<String>, target: impl Into<PathBuf>, readonly: bool) -> Self {
        Self {
            what: what.into(),
            target: target.into(),
            fstype: None,
            options: None,
            flags: if readonly {
                MountFlags::bind_ro()
            } else {
                MountFlags::bind()
            },
        }
    }

    fn key(&self) -> (String, PathBuf) {
        (self.what.clone(), self.target.clone())
    }
}

/// Ordered mount plan plus the record of what has been performed.
///
/// Performed mounts are owned: `unwind` unmounts them in reverse order.
#[derive(Debug, Default)]
pub struct MountPlan {
    entries: Vec<MountEntry>,
    performed: Vec<MountEntry>,
    performed_keys: HashSet<(String, PathBuf)>,
}

impl MountPlan {
    pub fn push(&mut self, entry: MountEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    pub fn performed(&self) -> &[MountEntry] {
        &self.performed
    }

    /// Validate an entry before execution. A missing target without the
    /// `create` flag is the caller's error, not a mount failure.
    fn prepare_target(entry: &MountEntry) -> Result<()> {
        if !entry.target.is_absolute() {
            return Err(ContainerError::InvalidArgument(format!(
                "mount target {} is not absolute",
                entry.target.display()
            )));
        }
        if entry.target.exists() {
            return Ok(());
        }
        if !entry.flags.create {
            return Err(ContainerError::InvalidArgument(format!(
                "mount target {} missing and 'create' not set",
                entry.target.display()
            )));
        }
        // Create as file or directory depending on what the source is.
        let source = Path::new(&entry.what);
        if entry.flags.bind && source.is_file() {
            if let Some(parent) = entry.target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::File::create(&entry.target)?;
        } else {
            std::fs::create_dir_all(&entry.target)?;
        }
        Ok(())
    }

    /// Execute every not-yet-performed entry, in order.
    pub fn execute(&mut self) -> Result<()> {
        let pending: Vec<MountEntry> = self
            .entries
            .iter()
            .filter(|e| !self.performed_keys.contains(&e.key()))
            .cloned()
            .collect();
        for entry in pending {
            Self::prepare_target(&entry)?;
            perform_mount(&entry)?;
            debug!(what = %entry.what, target = %entry.target.display(), "mounted");
            self.performed_keys.insert(entry.key());
            self.performed.push(entry);
        }
        Ok(())
    }

    /// Unmount performed entries in reverse order. Individual failures
    /// are logged and skipped; the first error is reported after the
    /// walk completes so the caller can surface the leak.
    pub fn unwind(&mut self) -> Result<()> {
        let mut first_err: Option<ContainerError> = None;
        while let Some(entry) = self.performed.pop() {
            self.performed_keys.remove(&entry.key());
            if let Err(err) = perform_unmount(&entry.target) {
                warn!(target = %entry.target.display(), %err, "unmount failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

#[cfg(target_os = "linux")]
fn perform_mount(entry: &MountEntry) -> Result<()> {
    use nix::mount::{mount, MsFlags};

    let mut flags = MsFlags::empty();
    if entry.flags.bind {
        flags |= MsFlags::MS_BIND;
    }
    if entry.flags.recursive {
        flags |= MsFlags::MS_REC;
    }

    mount(
        Some(entry.what.as_str()),
        &entry.target,
        entry.fstype.as_deref(),
        flags,
        entry.options.as_deref(),
    )?;

    // Read-only bind mounts need a remount pass; MS_RDONLY is ignored on
    // the initial MS_BIND.
    if entry.flags.readonly {
        mount(
            None::<&str>,
            &entry.target,
            None::<&str>,
            flags | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn perform_mount(_entry: &MountEntry) -> Result<()> {
    Err(ContainerError::NotSupported("mount"))
}

#[cfg(target_os = "linux")]
fn perform_unmount(target: &Path) -> Result<()> {
    use nix::mount::{umount2, MntFlags};
    umount2(target, MntFlags::MNT_DETACH)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn perform_unmount(_target: &Path) -> Result<()> {
    Err(ContainerError::NotSupported("umount"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_target_without_create_is_invalid() {
        let entry = MountEntry::bind("/etc", "/nonexistent-target-for-test", false);
        let err = MountPlan::prepare_target(&entry).unwrap_err();
        assert!(matches!(err, ContainerError::InvalidArgument(_)));
    }

    #[test]
    fn relative_target_is_invalid() {
        let entry = MountEntry::bind("/etc", "relative/target", false);
        let err = MountPlan::prepare_target(&entry).unwrap_err();
        assert!(matches!(err, ContainerError::InvalidArgument(_)));
    }

    #[test]
    fn create_flag_materializes_directory_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mnt/point");
        let mut entry = MountEntry::bind("/etc", &target, false);
        entry.flags.create = true;
        MountPlan::prepare_target(&entry).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn create_flag_materializes_file_target_for_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("data.txt");
        std::fs::write(&source, b"x").unwrap();
        let target = dir.path().join("inner/data.txt");
        let mut entry = MountEntry::bind(source.to_str().unwrap(), &target, true);
        entry.flags.create = true;
        MountPlan::prepare_target(&entry).unwrap();
        assert!(target.is_file());
    }

    #[test]
    fn entry_serde_round_trip() {
        let entry = MountEntry {
            what: "overlay".into(),
            target: "/compose".into(),
            fstype: Some("overlay".into()),
            options: Some("lowerdir=/a:/b,upperdir=/u,workdir=/w".into()),
            flags: MountFlags::default(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: MountEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, back);
    }
}
