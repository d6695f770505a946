//! Rootfs composition from stacked layers.
//!
//! An ordered layer list becomes a single mount plan: base rootfs first,
//! read-only package layers at synthetic paths, a writable overlay on
//! top, host-directory binds last. The context owns every mount it
//! performs and every directory it creates; `destroy` unwinds in reverse
//! insertion order and keeps going past individual failures.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ContainerError, Result};
use crate::mounts::{MountEntry, MountFlags, MountPlan};

/// Environment override for the default base rootfs directory.
pub const BASE_ROOTFS_ENV: &str = "CVD_BASE_ROOTFS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LayerSpec {
    /// Directory that seeds the container's `/`.
    BaseRootfs { path: PathBuf },
    /// Package layer, mounted read-only at a synthetic path and stacked
    /// into the overlay lowerdir chain.
    Package {
        path: PathBuf,
        #[serde(default = "default_true")]
        readonly: bool,
    },
    /// Host directory bound into the composed tree.
    HostDir {
        source: PathBuf,
        target: PathBuf,
        #[serde(default)]
        readonly: bool,
    },
    /// Writable overlay; `upper` defaults to a per-container work dir.
    Overlay {
        #[serde(default)]
        upper: Option<PathBuf>,
    },
}

fn default_true() -> bool {
    true
}

/// One record per resource the composer owns, in acquisition order.
#[derive(Debug)]
enum OwnedResource {
    /// Directory created by the composer, removed on destroy.
    Dir(PathBuf),
}

/// The composed-rootfs context a container owns for its lifetime.
#[derive(Debug)]
pub struct LayerContext {
    container_id: String,
    root: PathBuf,
    work_dir: PathBuf,
    plan: MountPlan,
    owned: Vec<OwnedResource>,
}

impl LayerContext {
    /// Stage directories and derive the mount plan. No mounts are
    /// performed here; `mount_in_namespace` replays the plan wherever
    /// the caller needs it.
    pub fn compose(layers: &[LayerSpec], container_id: &str, work_root: &Path) -> Result<Self> {
        if container_id.is_empty() {
            return Err(ContainerError::InvalidArgument("empty container id".into()));
        }

        let work_dir = work_root.join(container_id);
        let mut ctx = Self {
            container_id: container_id.to_string(),
            root: PathBuf::new(),
            work_dir: work_dir.clone(),
            plan: MountPlan::default(),
            owned: Vec::new(),
        };

        let base = resolve_base(layers)?;
        let mut lowers: Vec<PathBuf> = vec![base.clone()];
        let mut overlay: Option<Option<PathBuf>> = None;
        let mut binds: Vec<(PathBuf, PathBuf, bool)> = Vec::new();

        ctx.make_dir(&work_dir)?;

        // Package layers become read-only mounts at synthetic paths under
        // the work dir, stacked underneath the overlay upper dir.
        let mut pack_index = 0usize;
        for layer in layers {
            match layer {
                LayerSpec::BaseRootfs { .. } => {}
                LayerSpec::Package { path, readonly } => {
                    if !path.exists() {
                        return Err(ContainerError::NotFound(format!(
                            "package layer {}",
                            path.display()
                        )));
                    }
                    let target = work_dir.join(format!("pack.{pack_index}"));
                    pack_index += 1;
                    ctx.make_dir(&target)?;
                    ctx.plan.push(MountEntry::bind(
                        path.to_string_lossy().into_owned(),
                        &target,
                        *readonly,
                    ));
                    lowers.push(target);
                }
                LayerSpec::Overlay { upper } => {
                    overlay = Some(upper.clone());
                }
                LayerSpec::HostDir {
                    source,
                    target,
                    readonly,
                } => {
                    binds.push((source.clone(), target.clone(), *readonly));
                }
            }
        }

        ctx.root = match overlay {
            None => base,
            Some(upper) => {
                let upper = match upper {
                    Some(path) => path,
                    None => {
                        let path = work_dir.join("upper");
                        ctx.make_dir(&path)?;
                        path
                    }
                };
                let overlay_work = work_dir.join("work");
                let merged = work_dir.join("merged");
                ctx.make_dir(&overlay_work)?;
                ctx.make_dir(&merged)?;

                // overlayfs wants lowerdirs top-most first.
                let lowerdir = lowers
                    .iter()
                    .rev()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join(":");
                ctx.plan.push(MountEntry {
                    what: "overlay".into(),
                    target: merged.clone(),
                    fstype: Some("overlay".into()),
                    options: Some(format!(
                        "lowerdir={lowerdir},upperdir={},workdir={}",
                        upper.display(),
                        overlay_work.display()
                    )),
                    flags: MountFlags::default(),
                });
                merged
            }
        };

        // Host binds land inside the composed root at their declared
        // targets.
        for (source, target, readonly) in binds {
            if !target.is_absolute() {
                return Err(ContainerError::InvalidArgument(format!(
                    "host-dir target {} is not absolute",
                    target.display()
                )));
            }
            if !source.exists() {
                return Err(ContainerError::NotFound(format!(
                    "host-dir source {}",
                    source.display()
                )));
            }
            let inside = ctx
                .root
                .join(target.strip_prefix("/").unwrap_or(target.as_path()));
            let mut entry = MountEntry::bind(source.to_string_lossy().into_owned(), inside, readonly);
            entry.flags.create = true;
            ctx.plan.push(entry);
        }

        debug!(
            id = %ctx.container_id,
            root = %ctx.root.display(),
            mounts = ctx.plan.entries().len(),
            "composed layer stack"
        );
        Ok(ctx)
    }

    fn make_dir(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::create_dir_all(path)?;
            self.owned.push(OwnedResource::Dir(path.to_path_buf()));
        }
        Ok(())
    }

    /// Top of the composed stack; the chroot/pivot target.
    pub fn rootfs_path(&self) -> &Path {
        &self.root
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn plan(&self) -> &[MountEntry] {
        self.plan.entries()
    }

    /// Replay the plan inside the caller's mount namespace. Already
    /// performed entries are skipped, so the call is idempotent.
    pub fn mount_in_namespace(&mut self) -> Result<()> {
        self.plan.execute()
    }

    /// Unmount everything this context performed, newest first, then
    /// release owned directories. Failures are logged and the walk
    /// continues; the first unmount error is returned as the leak
    /// indicator.
    pub fn destroy(&mut self) -> Result<()> {
        let unmount_result = self.plan.unwind();
        while let Some(res) = self.owned.pop() {
            match res {
                OwnedResource::Dir(path) => {
                    if let Err(err) = std::fs::remove_dir_all(&path) {
                        warn!(path = %path.display(), %err, "failed to remove owned dir");
                    }
                }
            }
        }
        unmount_result
    }
}

fn resolve_base(layers: &[LayerSpec]) -> Result<PathBuf> {
    for layer in layers {
        if let LayerSpec::BaseRootfs { path } = layer {
            if !path.is_dir() {
                return Err(ContainerError::NotFound(format!(
                    "base rootfs {}",
                    path.display()
                )));
            }
            return Ok(path.clone());
        }
    }
    if let Ok(env_base) = std::env::var(BASE_ROOTFS_ENV) {
        let path = PathBuf::from(env_base);
        if path.is_dir() {
            return Ok(path);
        }
    }
    Err(ContainerError::InvalidArgument(
        "no base rootfs layer and no usable CVD_BASE_ROOTFS".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("base/usr/bin")).unwrap();
        dir
    }

    #[test]
    fn base_only_compose_uses_base_as_root() {
        let dir = base_dir();
        let layers = [LayerSpec::BaseRootfs {
            path: dir.path().join("base"),
        }];
        let ctx = LayerContext::compose(&layers, "c1", &dir.path().join("work")).unwrap();
        assert_eq!(ctx.rootfs_path(), dir.path().join("base"));
        assert!(ctx.plan().is_empty());
    }

    #[test]
    fn overlay_compose_builds_merged_root_and_overlay_entry() {
        let dir = base_dir();
        let layers = [
            LayerSpec::BaseRootfs {
                path: dir.path().join("base"),
            },
            LayerSpec::Overlay { upper: None },
        ];
        let ctx = LayerContext::compose(&layers, "c2", &dir.path().join("work")).unwrap();
        assert!(ctx.rootfs_path().ends_with("merged"));
        assert_eq!(ctx.plan().len(), 1);
        let entry = &ctx.plan()[0];
        assert_eq!(entry.fstype.as_deref(), Some("overlay"));
        let opts = entry.options.as_deref().unwrap();
        assert!(opts.contains("lowerdir="));
        assert!(opts.contains("upperdir="));
        assert!(opts.contains("workdir="));
    }

    #[test]
    fn package_layers_stack_under_overlay_topmost_first() {
        let dir = base_dir();
        std::fs::create_dir_all(dir.path().join("pkg-a")).unwrap();
        std::fs::create_dir_all(dir.path().join("pkg-b")).unwrap();
        let layers = [
            LayerSpec::BaseRootfs {
                path: dir.path().join("base"),
            },
            LayerSpec::Package {
                path: dir.path().join("pkg-a"),
                readonly: true,
            },
            LayerSpec::Package {
                path: dir.path().join("pkg-b"),
                readonly: true,
            },
            LayerSpec::Overlay { upper: None },
        ];
        let ctx = LayerContext::compose(&layers, "c3", &dir.path().join("work")).unwrap();
        // Two pack binds plus the overlay mount.
        assert_eq!(ctx.plan().len(), 3);
        let overlay = ctx.plan().last().unwrap();
        let opts = overlay.options.as_deref().unwrap();
        let lower = opts
            .split(',')
            .find(|p| p.starts_with("lowerdir="))
            .unwrap();
        // Later layers shadow earlier ones: pack.1 before pack.0 before
        // the base.
        let idx_p1 = lower.find("pack.1").unwrap();
        let idx_p0 = lower.find("pack.0").unwrap();
        let idx_base = lower.find("base").unwrap();
        assert!(idx_p1 < idx_p0 && idx_p0 < idx_base);
    }

    #[test]
    fn host_dir_bind_lands_inside_root_with_create() {
        let dir = base_dir();
        std::fs::create_dir_all(dir.path().join("shared")).unwrap();
        let layers = [
            LayerSpec::BaseRootfs {
                path: dir.path().join("base"),
            },
            LayerSpec::Overlay { upper: None },
            LayerSpec::HostDir {
                source: dir.path().join("shared"),
                target: "/mnt/shared".into(),
                readonly: true,
            },
        ];
        let ctx = LayerContext::compose(&layers, "c4", &dir.path().join("work")).unwrap();
        let bind = ctx.plan().last().unwrap();
        assert!(bind.target.ends_with("merged/mnt/shared"));
        assert!(bind.flags.readonly);
        assert!(bind.flags.create);
    }

    #[test]
    fn missing_base_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let layers = [LayerSpec::BaseRootfs {
            path: dir.path().join("nope"),
        }];
        assert!(LayerContext::compose(&layers, "c5", &dir.path().join("w")).is_err());
    }

    #[test]
    fn relative_host_target_is_invalid() {
        let dir = base_dir();
        std::fs::create_dir_all(dir.path().join("shared")).unwrap();
        let layers = [
            LayerSpec::BaseRootfs {
                path: dir.path().join("base"),
            },
            LayerSpec::HostDir {
                source: dir.path().join("shared"),
                target: "mnt/shared".into(),
                readonly: false,
            },
        ];
        let err = LayerContext::compose(&layers, "c6", &dir.path().join("w")).unwrap_err();
        assert!(matches!(err, ContainerError::InvalidArgument(_)));
    }

    #[test]
    fn destroy_releases_owned_dirs() {
        let dir = base_dir();
        let layers = [
            LayerSpec::BaseRootfs {
                path: dir.path().join("base"),
            },
            LayerSpec::Overlay { upper: None },
        ];
        let work = dir.path().join("work");
        let mut ctx = LayerContext::compose(&layers, "c7", &work).unwrap();
        assert!(work.join("c7").exists());
        ctx.destroy().unwrap();
        assert!(!work.join("c7").exists());
    }

    #[test]
    fn layer_spec_serde_round_trip() {
        let layers = vec![
            LayerSpec::BaseRootfs {
                path: "/tmp/rootfs".into(),
            },
            LayerSpec::Package {
                path: "/var/chef/packs/a.pack".into(),
                readonly: true,
            },
            LayerSpec::Overlay { upper: None },
            LayerSpec::HostDir {
                source: "/home/u/src".into(),
                target: "/src".into(),
                readonly: false,
            },
        ];
        let json = serde_json::to_string(&layers).unwrap();
        let back: Vec<LayerSpec> = serde_json::from_str(&json).unwrap();
        assert_eq!(layers, back);
    }
}
