//! Process-wide owner of the BPF-LSM enforcement layer.
//!
//! One manager loads and pins the LSM skeleton under the cvd bpffs
//! directory, owns the `(cgroup_id, dev, ino) → (mask, action)` policy
//! map, and accounts for every entry it installs. Populate and cleanup
//! are serialized behind one exclusive lock: a container's entries are
//! fully installed or fully reclaimed, never interleaved with another
//! mutation.
//!
//! On kernels without the `bpf` LSM (or off Linux) `initialize`
//! succeeds with `available() == false`; choosing a fallback mechanism
//! is the caller's concern.

mod error;
mod manager;
mod metrics;
pub mod resolver;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

pub use error::{BpfError, Result};
pub use metrics::{BpfMetrics, ContainerMetrics};
pub use resolver::{resolve, FileIdentity, MAX_RESOLVE_DEPTH};

use protecc::PathRule;

/// Default bpffs directory for the cvd pins.
pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/cvd";

/// Default LSM object location installed by the chef packaging.
pub const DEFAULT_OBJECT_PATH: &str = "/usr/lib/chef/cvd-lsm.bpf.o";

#[derive(Debug, Clone)]
pub struct BpfConfig {
    pub object_path: PathBuf,
    pub pin_dir: PathBuf,
    /// Fixed at initialize; inserts beyond it fail with
    /// `CapacityExceeded`.
    pub map_capacity: u32,
}

impl Default for BpfConfig {
    fn default() -> Self {
        Self {
            object_path: PathBuf::from(DEFAULT_OBJECT_PATH),
            pin_dir: PathBuf::from(DEFAULT_PIN_DIR),
            map_capacity: 16384,
        }
    }
}

/// Allow/deny path rules for one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySpec {
    #[serde(default)]
    pub allow: Vec<SpecRule>,
    #[serde(default)]
    pub deny: Vec<SpecRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecRule {
    pub pattern: String,
    pub perms: u32,
}

impl SpecRule {
    pub fn new(pattern: impl Into<String>, perms: u32) -> Self {
        Self {
            pattern: pattern.into(),
            perms,
        }
    }
}

impl From<PathRule> for SpecRule {
    fn from(rule: PathRule) -> Self {
        Self {
            pattern: rule.pattern,
            perms: rule.perms,
        }
    }
}

enum Inner {
    /// Enforcement running.
    #[cfg(target_os = "linux")]
    Active(manager::LinuxBpfManager),
    /// Kernel or platform cannot enforce; metrics still readable.
    Unavailable,
}

pub struct BpfManager {
    inner: Mutex<Inner>,
}

impl BpfManager {
    /// Load, attach, and pin the skeleton. A kernel without BPF-LSM (or
    /// a missing skeleton object) is not an error: the manager comes up
    /// with `available() == false`.
    pub fn initialize(config: BpfConfig) -> Result<Self> {
        #[cfg(target_os = "linux")]
        {
            if !manager::lsm_available() || !config.object_path.exists() {
                tracing::warn!(
                    object = %config.object_path.display(),
                    "bpf-lsm unavailable, enforcement disabled"
                );
                return Ok(Self {
                    inner: Mutex::new(Inner::Unavailable),
                });
            }
            let inner = manager::LinuxBpfManager::initialize(&config)?;
            Ok(Self {
                inner: Mutex::new(Inner::Active(inner)),
            })
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = config;
            Ok(Self {
                inner: Mutex::new(Inner::Unavailable),
            })
        }
    }

    pub fn available(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            matches!(*self.inner.lock().unwrap(), Inner::Active(_))
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }

    /// Resolve the policy against the container's mount view and insert
    /// its map entries. Individual unresolvable paths are counted and
    /// skipped; only a full map or a kernel failure errors.
    pub fn populate_policy(
        &self,
        container_id: &str,
        cgroup_id: u64,
        rootfs: &Path,
        policy: &PolicySpec,
    ) -> Result<()> {
        match &mut *self.inner.lock().unwrap() {
            #[cfg(target_os = "linux")]
            Inner::Active(m) => m.populate_policy(container_id, cgroup_id, rootfs, policy),
            Inner::Unavailable => {
                let _ = (container_id, cgroup_id, rootfs, policy);
                Err(BpfError::NotSupported)
            }
        }
    }

    /// Delete every entry owned by `container_id`. Idempotent.
    pub fn cleanup_policy(&self, container_id: &str) -> Result<()> {
        match &mut *self.inner.lock().unwrap() {
            #[cfg(target_os = "linux")]
            Inner::Active(m) => m.cleanup_policy(container_id),
            Inner::Unavailable => {
                let _ = container_id;
                Err(BpfError::NotSupported)
            }
        }
    }

    /// Both pins present? Distinguishes "initialized" from
    /// "enforcement currently active".
    pub fn sanity_check_pins(&self) -> bool {
        match &*self.inner.lock().unwrap() {
            #[cfg(target_os = "linux")]
            Inner::Active(m) => m.sanity_check_pins(),
            Inner::Unavailable => false,
        }
    }

    pub fn get_metrics(&self) -> BpfMetrics {
        match &*self.inner.lock().unwrap() {
            #[cfg(target_os = "linux")]
            Inner::Active(m) => m.metrics(),
            Inner::Unavailable => BpfMetrics::default(),
        }
    }

    pub fn get_container_metrics(&self, container_id: &str) -> Option<ContainerMetrics> {
        match &*self.inner.lock().unwrap() {
            #[cfg(target_os = "linux")]
            Inner::Active(m) => m.container_metrics(container_id),
            Inner::Unavailable => {
                let _ = container_id;
                None
            }
        }
    }

    /// Unpin, release, zero the counters.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        #[cfg(target_os = "linux")]
        if let Inner::Active(m) = &mut *inner {
            m.shutdown();
        }
        *inner = Inner::Unavailable;
    }
}
