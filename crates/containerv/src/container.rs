//! Container lifecycle: namespace entry, rootfs pivot, spawn, destroy.
//!
//! `create` forks an init process which enters its namespaces, replays
//! the mount plan, pivots into the composed rootfs, and then serves the
//! control channel. The parent waits on a ready pipe with a fixed
//! ceiling. Teardown walks `StopServices → Unload → UnmountLayers →
//! RemoveCgroup` and keeps going past individual failures; only
//! resource leaks surface in the return value.

#![cfg(target_os = "linux")]
#![allow(unsafe_code)]

use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use nix::sched::{setns, unshare, CloneFlags};
use nix::sys::signal::{kill as send_signal, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cgroup::{CgroupManager, ContainerCgroup};
use crate::control::{read_frame, write_frame, ChildReply, ChildRequest};
use crate::error::{ContainerError, Result};
use crate::layers::{LayerContext, LayerSpec};
use crate::machine::DestroyStep;
use crate::mounts::{MountEntry, MountPlan};

/// Namespace capability bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const NETWORK: Capabilities = Capabilities(1 << 0);
    pub const PROCESS_CONTROL: Capabilities = Capabilities(1 << 1);
    pub const IPC: Capabilities = Capabilities(1 << 2);
    pub const FILESYSTEM: Capabilities = Capabilities(1 << 3);
    pub const CGROUPS: Capabilities = Capabilities(1 << 4);
    pub const USERS: Capabilities = Capabilities(1 << 5);

    pub const fn empty() -> Self {
        Capabilities(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Capabilities(bits)
    }

    pub const fn union(self, other: Capabilities) -> Self {
        Capabilities(self.0 | other.0)
    }

    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    fn clone_flags(self) -> CloneFlags {
        // UTS is unconditional: every container gets its own hostname.
        let mut flags = CloneFlags::CLONE_NEWUTS;
        if self.contains(Self::FILESYSTEM) {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.contains(Self::PROCESS_CONTROL) {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.contains(Self::IPC) {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.contains(Self::NETWORK) {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.contains(Self::CGROUPS) {
            flags |= CloneFlags::CLONE_NEWCGROUP;
        }
        if self.contains(Self::USERS) {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        flags
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::FILESYSTEM
            .union(Self::PROCESS_CONTROL)
            .union(Self::IPC)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Initializing,
    Running,
    Destroying,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct ContainerOptions {
    /// Defaults to a generated id.
    pub id: Option<String>,
    pub capabilities: Capabilities,
    /// Extra mounts applied after the layer plan.
    pub mounts: Vec<MountEntry>,
    pub hostname: Option<String>,
    /// Ceiling on the child ready barrier.
    pub ready_timeout: Duration,
    /// Where per-container work directories live.
    pub work_root: PathBuf,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            id: None,
            capabilities: Capabilities::default(),
            mounts: Vec::new(),
            hostname: None,
            ready_timeout: Duration::from_secs(30),
            work_root: PathBuf::from("/var/chef/mnt"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Block until the process exits and deliver its status.
    pub wait: bool,
    pub user: Option<u32>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnResult {
    pub pid: i32,
    /// Present when `wait` was set.
    pub exit_status: Option<i32>,
}

static NEXT_CONTAINER: AtomicU64 = AtomicU64::new(1);

fn generate_id() -> String {
    let n = NEXT_CONTAINER.fetch_add(1, Ordering::Relaxed);
    format!("cv{}-{n}", std::process::id())
}

pub struct Container {
    id: String,
    state: Mutex<ContainerState>,
    layers: Mutex<LayerContext>,
    cgroup: Mutex<Option<ContainerCgroup>>,
    cgroup_id: u64,
    init_pid: Pid,
    control: Mutex<UnixStream>,
    children: Mutex<Vec<i32>>,
    capabilities: Capabilities,
}

impl Container {
    /// Build the rootfs, enter namespaces, and bring up the init
    /// barrier. On any failure every partial resource is reversed
    /// before the error returns.
    pub fn create(layers: &[LayerSpec], options: ContainerOptions) -> Result<Container> {
        let id = options.id.clone().unwrap_or_else(generate_id);
        if id.contains('/') || id.is_empty() {
            return Err(ContainerError::InvalidArgument(format!(
                "container id '{id}'"
            )));
        }

        let mut layer_ctx = LayerContext::compose(layers, &id, &options.work_root)?;

        let manager = CgroupManager::new()?;
        let cgroup = match manager.create(&id) {
            Ok(cg) => cg,
            Err(err) => {
                let _ = layer_ctx.destroy();
                return Err(err);
            }
        };
        let cgroup_id = cgroup.id();

        let (parent_sock, child_sock) = match UnixStream::pair() {
            Ok(pair) => pair,
            Err(err) => {
                let _ = cgroup.remove();
                let _ = layer_ctx.destroy();
                return Err(err.into());
            }
        };
        let (ready_r, ready_w) = match nix::unistd::pipe() {
            Ok(pair) => pair,
            Err(err) => {
                let _ = cgroup.remove();
                let _ = layer_ctx.destroy();
                return Err(err.into());
            }
        };

        // SAFETY: the child only calls async-signal-unsafe facilities
        // after unshare; it never touches the parent's locks before
        // exec-like entry into its own serve loop.
        let fork_result = unsafe { fork() };
        let child = match fork_result {
            Ok(ForkResult::Child) => {
                drop(parent_sock);
                drop(ready_r);
                // Never returns.
                child_init(layer_ctx, &options, child_sock, ready_w);
            }
            Ok(ForkResult::Parent { child }) => child,
            Err(err) => {
                let _ = cgroup.remove();
                let _ = layer_ctx.destroy();
                return Err(err.into());
            }
        };
        drop(child_sock);
        drop(ready_w);

        if let Err(err) = cgroup.add_process(child.as_raw() as u32) {
            warn!(%id, %err, "failed to place init in cgroup");
        }

        if let Err(err) = wait_ready(ready_r, options.ready_timeout) {
            let _ = send_signal(child, Signal::SIGKILL);
            let _ = waitpid(child, None);
            let _ = cgroup.remove();
            let _ = layer_ctx.destroy();
            return Err(match err {
                ContainerError::Transient(_) => ContainerError::ReadyTimeout {
                    id: id.clone(),
                    timeout_secs: options.ready_timeout.as_secs(),
                },
                other => other,
            });
        }

        info!(%id, cgroup_id, init = child.as_raw(), "container running");
        Ok(Container {
            id,
            state: Mutex::new(ContainerState::Running),
            layers: Mutex::new(layer_ctx),
            cgroup: Mutex::new(Some(cgroup)),
            cgroup_id,
            init_pid: child,
            control: Mutex::new(parent_sock),
            children: Mutex::new(Vec::new()),
            capabilities: options.capabilities,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cgroup_id(&self) -> u64 {
        self.cgroup_id
    }

    pub fn state(&self) -> ContainerState {
        *self.state.lock().unwrap()
    }

    pub fn rootfs_path(&self) -> PathBuf {
        self.layers.lock().unwrap().rootfs_path().to_path_buf()
    }

    pub fn child_pids(&self) -> Vec<i32> {
        self.children.lock().unwrap().clone()
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            ContainerState::Running => Ok(()),
            state => Err(ContainerError::Busy(format!(
                "container '{}' is {state:?}",
                self.id
            ))),
        }
    }

    /// Run a command inside the container.
    pub fn spawn(&self, path: &str, args: &[String], options: &SpawnOptions) -> Result<SpawnResult> {
        self.ensure_running()?;
        if !path.starts_with('/') {
            return Err(ContainerError::InvalidArgument(format!(
                "spawn path '{path}' is not absolute"
            )));
        }

        let mut control = self.control.lock().unwrap();
        write_frame(
            &mut *control,
            &ChildRequest::Spawn {
                path: path.to_string(),
                args: args.to_vec(),
                env: options.env.clone(),
                user: options.user,
                wait: options.wait,
            },
        )?;

        let pid = match read_frame::<ChildReply>(&mut *control)? {
            ChildReply::Spawned { pid } => pid,
            ChildReply::Err { message } => return Err(ContainerError::Child(message)),
            other => {
                return Err(ContainerError::Child(format!(
                    "unexpected reply {other:?}"
                )))
            }
        };
        self.children.lock().unwrap().push(pid);

        if !options.wait {
            return Ok(SpawnResult {
                pid,
                exit_status: None,
            });
        }
        match read_frame::<ChildReply>(&mut *control)? {
            ChildReply::Exited { status } => Ok(SpawnResult {
                pid,
                exit_status: Some(status),
            }),
            ChildReply::Err { message } => Err(ContainerError::Child(message)),
            other => Err(ContainerError::Child(format!(
                "unexpected reply {other:?}"
            ))),
        }
    }

    /// Terminate a spawned process. A pid that is already gone is not
    /// an error.
    pub fn kill(&self, pid: i32) -> Result<()> {
        self.ensure_running()?;
        let mut control = self.control.lock().unwrap();
        write_frame(&mut *control, &ChildRequest::Kill { pid })?;
        match read_frame::<ChildReply>(&mut *control)? {
            ChildReply::Ok => Ok(()),
            ChildReply::Err { message } => Err(ContainerError::Child(message)),
            other => Err(ContainerError::Child(format!(
                "unexpected reply {other:?}"
            ))),
        }
    }

    /// Copy host files into the container. Both sides must be absolute.
    pub fn upload(&self, host_paths: &[PathBuf], container_paths: &[PathBuf]) -> Result<()> {
        self.ensure_running()?;
        if host_paths.len() != container_paths.len() {
            return Err(ContainerError::InvalidArgument(
                "upload path lists differ in length".into(),
            ));
        }
        for (src, dst) in host_paths.iter().zip(container_paths) {
            if !src.is_absolute() || !dst.is_absolute() {
                return Err(ContainerError::InvalidArgument(format!(
                    "upload paths must be absolute: {} -> {}",
                    src.display(),
                    dst.display()
                )));
            }
            let data = std::fs::read(src)?;
            let mode = file_mode(src).unwrap_or(0o644);
            let mut control = self.control.lock().unwrap();
            write_frame(
                &mut *control,
                &ChildRequest::Upload {
                    path: dst.to_string_lossy().into_owned(),
                    mode,
                    data,
                },
            )?;
            match read_frame::<ChildReply>(&mut *control)? {
                ChildReply::Ok => {}
                ChildReply::Err { message } => return Err(ContainerError::Child(message)),
                other => {
                    return Err(ContainerError::Child(format!(
                        "unexpected reply {other:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Copy container files out to the host. Both sides must be
    /// absolute.
    pub fn download(&self, container_paths: &[PathBuf], host_paths: &[PathBuf]) -> Result<()> {
        self.ensure_running()?;
        if host_paths.len() != container_paths.len() {
            return Err(ContainerError::InvalidArgument(
                "download path lists differ in length".into(),
            ));
        }
        for (src, dst) in container_paths.iter().zip(host_paths) {
            if !src.is_absolute() || !dst.is_absolute() {
                return Err(ContainerError::InvalidArgument(format!(
                    "download paths must be absolute: {} -> {}",
                    src.display(),
                    dst.display()
                )));
            }
            let mut control = self.control.lock().unwrap();
            write_frame(
                &mut *control,
                &ChildRequest::Download {
                    path: src.to_string_lossy().into_owned(),
                },
            )?;
            match read_frame::<ChildReply>(&mut *control)? {
                ChildReply::Data { data } => {
                    drop(control);
                    std::fs::write(dst, data)?;
                }
                ChildReply::Err { message } => return Err(ContainerError::Child(message)),
                other => {
                    return Err(ContainerError::Child(format!(
                        "unexpected reply {other:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn init_pid(&self) -> i32 {
        self.init_pid.as_raw()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Attach the calling thread to the container's namespaces.
    /// Diagnostic surface; the thread keeps the namespaces until it
    /// exits.
    pub fn join(&self) -> Result<()> {
        self.ensure_running()?;
        join_namespaces(self.init_pid.as_raw(), self.capabilities)
    }

    /// Drive teardown. Every step is attempted; only resource-leak
    /// errors become the return value. Idempotent: destroying a
    /// destroyed container is a success no-op.
    pub fn destroy(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ContainerState::Destroyed | ContainerState::Destroying => return Ok(()),
                _ => *state = ContainerState::Destroying,
            }
        }

        let mut leak: Option<ContainerError> = None;
        let mut step = DestroyStep::StopServices;
        loop {
            match step {
                DestroyStep::StopServices => {
                    let mut control = self.control.lock().unwrap();
                    if let Err(err) = write_frame(&mut *control, &ChildRequest::Shutdown) {
                        debug!(id = %self.id, %err, "init already gone at shutdown");
                    }
                }
                DestroyStep::Unload => {
                    if let Some(cgroup) = &*self.cgroup.lock().unwrap() {
                        if let Err(err) = cgroup.kill_graceful(Duration::from_millis(100)) {
                            debug!(id = %self.id, %err, "cgroup kill failed");
                        }
                    }
                    let _ = waitpid(self.init_pid, Some(WaitPidFlag::WNOHANG));
                    let _ = send_signal(self.init_pid, Signal::SIGKILL);
                    let _ = waitpid(self.init_pid, None);
                }
                DestroyStep::UnmountLayers => {
                    if let Err(err) = self.layers.lock().unwrap().destroy() {
                        warn!(id = %self.id, %err, "layer teardown leaked a mount");
                        leak.get_or_insert(err);
                    }
                }
                DestroyStep::RemoveCgroup => {
                    if let Some(cgroup) = self.cgroup.lock().unwrap().take() {
                        if let Err(err) = cgroup.remove() {
                            warn!(id = %self.id, %err, "cgroup removal leaked");
                            leak.get_or_insert(err);
                        }
                    }
                }
                DestroyStep::Destroyed => {
                    *self.state.lock().unwrap() = ContainerState::Destroyed;
                    break;
                }
            }
            step = step.next();
        }

        info!(id = %self.id, "container destroyed");
        match leak {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// Attach the calling thread to the namespaces of `init_pid`, per the
/// capability set the container was created with. The pid namespace
/// only applies to processes spawned afterwards.
pub fn join_namespaces(init_pid: i32, capabilities: Capabilities) -> Result<()> {
    let proc_ns = PathBuf::from(format!("/proc/{init_pid}/ns"));
    let mut pairs: Vec<(&str, CloneFlags)> = vec![("uts", CloneFlags::CLONE_NEWUTS)];
    if capabilities.contains(Capabilities::FILESYSTEM) {
        pairs.push(("mnt", CloneFlags::CLONE_NEWNS));
    }
    if capabilities.contains(Capabilities::PROCESS_CONTROL) {
        pairs.push(("pid", CloneFlags::CLONE_NEWPID));
    }
    if capabilities.contains(Capabilities::IPC) {
        pairs.push(("ipc", CloneFlags::CLONE_NEWIPC));
    }
    if capabilities.contains(Capabilities::NETWORK) {
        pairs.push(("net", CloneFlags::CLONE_NEWNET));
    }
    for (name, flag) in pairs {
        let file = std::fs::File::open(proc_ns.join(name))?;
        setns(file.as_fd(), flag)?;
    }
    Ok(())
}

fn file_mode(path: &std::path::Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .ok()
        .map(|m| m.permissions().mode() & 0o7777)
}

#[allow(unsafe_code)]
fn wait_ready(ready_r: OwnedFd, timeout: Duration) -> Result<()> {
    let mut pfd = libc::pollfd {
        fd: ready_r.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    // SAFETY: pfd points at one valid pollfd for the duration of the
    // call.
    let n = unsafe { libc::poll(&mut pfd, 1, millis) };
    if n < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if n == 0 {
        return Err(ContainerError::Transient("ready barrier timeout".into()));
    }
    let mut byte = [0u8; 1];
    let mut file = std::fs::File::from(ready_r);
    match file.read_exact(&mut byte) {
        Ok(()) => Ok(()),
        Err(_) => Err(ContainerError::Child(
            "init exited before signalling ready".into(),
        )),
    }
}

/// Init-side setup and serve loop. Never returns.
fn child_init(
    mut layers: LayerContext,
    options: &ContainerOptions,
    control: UnixStream,
    ready_w: OwnedFd,
) -> ! {
    let outcome = child_setup(&mut layers, options);
    match outcome {
        Ok(()) => {
            let mut ready = std::fs::File::from(ready_w);
            let _ = ready.write_all(&[1]);
            drop(ready);
            serve_control(control);
            std::process::exit(0);
        }
        Err(err) => {
            // The parent sees EOF on the ready pipe.
            warn!(%err, "container init failed");
            drop(ready_w);
            std::process::exit(1);
        }
    }
}

fn child_setup(layers: &mut LayerContext, options: &ContainerOptions) -> Result<()> {
    let uid = nix::unistd::getuid();
    let gid = nix::unistd::getgid();

    unshare(options.capabilities.clone_flags())?;

    if options.capabilities.contains(Capabilities::USERS) {
        // Map the outer identity to root inside the user namespace.
        std::fs::write("/proc/self/setgroups", "deny")?;
        std::fs::write("/proc/self/uid_map", format!("0 {uid} 1\n"))?;
        std::fs::write("/proc/self/gid_map", format!("0 {gid} 1\n"))?;
    }

    if let Some(hostname) = &options.hostname {
        nix::unistd::sethostname(hostname)?;
    }

    // Mount propagation off before touching anything.
    if options.capabilities.contains(Capabilities::FILESYSTEM) {
        nix::mount::mount(
            None::<&str>,
            "/",
            None::<&str>,
            nix::mount::MsFlags::MS_REC | nix::mount::MsFlags::MS_PRIVATE,
            None::<&str>,
        )?;

        layers.mount_in_namespace()?;

        let mut extra = MountPlan::default();
        for entry in &options.mounts {
            extra.push(entry.clone());
        }
        extra.execute()?;

        pivot_into(layers.rootfs_path())?;

        // A pid namespace without /proc confuses everything that runs
        // afterwards.
        if options.capabilities.contains(Capabilities::PROCESS_CONTROL)
            && std::path::Path::new("/proc").is_dir()
        {
            let _ = nix::mount::mount(
                Some("proc"),
                "/proc",
                Some("proc"),
                nix::mount::MsFlags::empty(),
                None::<&str>,
            );
        }
    }
    Ok(())
}

fn pivot_into(rootfs: &std::path::Path) -> Result<()> {
    use nix::mount::{mount, umount2, MntFlags, MsFlags};

    // The new root must itself be a mount point.
    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;
    nix::unistd::chdir(rootfs)?;
    nix::unistd::pivot_root(".", ".")?;
    umount2(".", MntFlags::MNT_DETACH)?;
    nix::unistd::chdir("/")?;
    Ok(())
}

/// Serve spawn/kill/upload/download until shutdown or channel close.
fn serve_control(mut control: UnixStream) {
    loop {
        let request: ChildRequest = match read_frame(&mut control) {
            Ok(req) => req,
            Err(_) => return,
        };
        match request {
            ChildRequest::Spawn {
                path,
                args,
                env,
                user,
                wait,
            } => {
                let reply = do_spawn(&path, &args, &env, user);
                match reply {
                    Ok(pid) => {
                        let _ = write_frame(&mut control, &ChildReply::Spawned { pid: pid.as_raw() });
                        if wait {
                            let status = match waitpid(pid, None) {
                                Ok(WaitStatus::Exited(_, code)) => code,
                                Ok(WaitStatus::Signaled(_, sig, _)) => 128 + sig as i32,
                                _ => -1,
                            };
                            let _ = write_frame(&mut control, &ChildReply::Exited { status });
                        }
                    }
                    Err(err) => {
                        let _ = write_frame(
                            &mut control,
                            &ChildReply::Err {
                                message: err.to_string(),
                            },
                        );
                    }
                }
            }
            ChildRequest::Kill { pid } => {
                let reply = match send_signal(Pid::from_raw(pid), Signal::SIGKILL) {
                    Ok(()) | Err(nix::errno::Errno::ESRCH) => ChildReply::Ok,
                    Err(err) => ChildReply::Err {
                        message: err.to_string(),
                    },
                };
                let _ = write_frame(&mut control, &reply);
            }
            ChildRequest::Upload { path, mode, data } => {
                let reply = match write_file(&path, mode, &data) {
                    Ok(()) => ChildReply::Ok,
                    Err(err) => ChildReply::Err {
                        message: err.to_string(),
                    },
                };
                let _ = write_frame(&mut control, &reply);
            }
            ChildRequest::Download { path } => {
                let reply = match std::fs::read(&path) {
                    Ok(data) => ChildReply::Data { data },
                    Err(err) => ChildReply::Err {
                        message: err.to_string(),
                    },
                };
                let _ = write_frame(&mut control, &reply);
            }
            ChildRequest::Shutdown => return,
        }
    }
}

fn write_file(path: &str, mode: u32, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

fn do_spawn(
    path: &str,
    args: &[String],
    env: &[(String, String)],
    user: Option<u32>,
) -> Result<Pid> {
    use std::ffi::CString;

    let c_path = CString::new(path)
        .map_err(|_| ContainerError::InvalidArgument("NUL in spawn path".into()))?;
    let mut c_args = vec![c_path.clone()];
    for arg in args {
        c_args.push(
            CString::new(arg.as_str())
                .map_err(|_| ContainerError::InvalidArgument("NUL in spawn arg".into()))?,
        );
    }
    let mut c_env = Vec::with_capacity(env.len());
    for (k, v) in env {
        c_env.push(
            CString::new(format!("{k}={v}"))
                .map_err(|_| ContainerError::InvalidArgument("NUL in environment".into()))?,
        );
    }

    // SAFETY: between fork and exec the child only calls
    // async-signal-safe functions.
    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            if let Some(uid) = user {
                let _ = nix::unistd::setuid(nix::unistd::Uid::from_raw(uid));
            }
            let _ = nix::unistd::execve(&c_path, &c_args, &c_env);
            std::process::exit(127);
        }
    }
}
