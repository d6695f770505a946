//! Linux container runtime for the chef toolchain.
//!
//! A container is a composed rootfs (base + package layers + writable
//! overlay + host binds) hosted inside fresh namespaces and an owned
//! cgroup. The lifecycle guarantees strict LIFO teardown of everything
//! it acquires, with best-effort continuation when individual steps
//! fail.

mod error;

pub mod layers;
pub mod machine;
pub mod mounts;
pub mod txn;

#[cfg(target_os = "linux")]
pub mod cgroup;
#[cfg(target_os = "linux")]
mod container;
#[cfg(target_os = "linux")]
mod control;

pub use error::{ContainerError, Result};
pub use layers::{LayerContext, LayerSpec, BASE_ROOTFS_ENV};
pub use machine::{
    DestroyStep, TransactionEvent, TransactionHandler, TransactionRunner, TransactionState,
    DEFAULT_RETRY_BUDGET,
};
pub use mounts::{MountEntry, MountFlags, MountPlan};
pub use txn::{StateStore, StateTxn};

#[cfg(target_os = "linux")]
pub use container::{
    join_namespaces, Capabilities, Container, ContainerOptions, ContainerState, SpawnOptions,
    SpawnResult,
};
