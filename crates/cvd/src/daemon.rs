//! The daemon: container registry, policy wiring, connection handling.

#![cfg(target_os = "linux")]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use bpf_manager::{BpfConfig, BpfManager, PolicySpec};
use containerv::{Container, ContainerOptions, SpawnOptions};
use cvd_protocol::{
    read_message, write_message, Endpoint, ErrorKind, Event, Message, Reply, Request,
};

use crate::errmap;

pub struct DaemonConfig {
    pub work_root: PathBuf,
    pub bpf: BpfConfig,
}

pub struct Daemon {
    containers: Mutex<HashMap<String, Arc<Container>>>,
    bpf: BpfManager,
    events: broadcast::Sender<Event>,
    work_root: PathBuf,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> anyhow::Result<Arc<Self>> {
        let bpf = BpfManager::initialize(config.bpf)?;
        if !bpf.available() {
            warn!("running without bpf-lsm enforcement");
        }
        let (events, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            containers: Mutex::new(HashMap::new()),
            bpf,
            events,
            work_root: config.work_root,
        }))
    }

    pub async fn serve(self: Arc<Self>, endpoint: Endpoint) -> anyhow::Result<()> {
        let listener = endpoint.bind().await?;
        info!(%endpoint, "cvd listening");
        loop {
            let conn = listener.accept().await?;
            let daemon = self.clone();
            tokio::spawn(async move {
                if let Err(err) = daemon.handle_connection(conn).await {
                    debug!(%err, "connection closed");
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        conn: Box<dyn cvd_protocol::Conn>,
    ) -> anyhow::Result<()> {
        let (mut reader, mut writer) = tokio::io::split(conn);
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);

        // One writer task per connection; replies and broadcast events
        // are serialized through it.
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if write_message(&mut writer, &msg).await.is_err() {
                    break;
                }
            }
        });

        let mut events = self.events.subscribe();
        let event_tx = out_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Ok(body) = events.recv().await {
                if event_tx.send(Message::Event { body }).await.is_err() {
                    break;
                }
            }
        });

        let result = loop {
            let msg: Message = match read_message(&mut reader).await {
                Ok(msg) => msg,
                Err(cvd_protocol::ProtocolError::Closed) => break Ok(()),
                Err(err) => break Err(err.into()),
            };
            let Message::Request { seq, body } = msg else {
                // A reply or event from a client is a protocol abuse;
                // drop the connection.
                break Ok(());
            };
            let daemon = self.clone();
            let reply = tokio::task::spawn_blocking(move || daemon.dispatch(body))
                .await
                .unwrap_or_else(|err| Reply::Error {
                    kind: ErrorKind::Io,
                    message: format!("handler panicked: {err}"),
                });
            if out_tx.send(Message::Reply { seq, body: reply }).await.is_err() {
                break Ok(());
            }
        };

        forwarder.abort();
        drop(out_tx);
        let _ = writer_task.await;
        result
    }

    fn dispatch(&self, request: Request) -> Reply {
        match request {
            Request::Create {
                id,
                layers,
                mounts,
                policy,
                hostname,
            } => self.create(id, layers, mounts, policy, hostname),
            Request::Spawn {
                id,
                command,
                args,
                env,
                user,
                wait,
            } => self.spawn(&id, &command, args, env, user, wait),
            Request::Kill { id, pid } => self.kill(&id, pid),
            Request::Upload { id, src, dst, user: _ } => self.upload(&id, src, dst),
            Request::Download { id, src, dst } => self.download(&id, src, dst),
            Request::Destroy { id } => self.destroy(&id),
            Request::Info { id } => self.info(&id),
            Request::Metrics => {
                let containers = self.containers.lock().unwrap().len() as u64;
                Reply::Metrics {
                    bpf: self.bpf.get_metrics(),
                    containers,
                }
            }
        }
    }

    fn create(
        &self,
        id: Option<String>,
        layers: Vec<containerv::LayerSpec>,
        mounts: Vec<containerv::MountEntry>,
        policy: Option<PolicySpec>,
        hostname: Option<String>,
    ) -> Reply {
        let options = ContainerOptions {
            id,
            mounts,
            hostname,
            work_root: self.work_root.clone(),
            ..Default::default()
        };
        let container = match Container::create(&layers, options) {
            Ok(container) => Arc::new(container),
            Err(err) => {
                return Reply::Error {
                    kind: errmap::container_kind(&err),
                    message: err.to_string(),
                }
            }
        };
        let id = container.id().to_string();
        let cgroup_id = container.cgroup_id();

        if let Some(policy) = policy {
            match self
                .bpf
                .populate_policy(&id, cgroup_id, &container.rootfs_path(), &policy)
            {
                Ok(()) => {}
                Err(bpf_manager::BpfError::NotSupported) => {
                    warn!(%id, "policy supplied but enforcement unavailable");
                }
                Err(err) => {
                    // A partially-installed policy is reclaimed along
                    // with the container.
                    let _ = self.bpf.cleanup_policy(&id);
                    let _ = container.destroy();
                    return Reply::Error {
                        kind: errmap::bpf_kind(&err),
                        message: err.to_string(),
                    };
                }
            }
        }

        self.containers
            .lock()
            .unwrap()
            .insert(id.clone(), container);
        let _ = self.events.send(Event::ContainerCreated { id: id.clone() });
        Reply::Created { id, cgroup_id }
    }

    fn lookup(&self, id: &str) -> Result<Arc<Container>, Reply> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Reply::Error {
                kind: ErrorKind::NotFound,
                message: format!("container '{id}'"),
            })
    }

    fn spawn(
        &self,
        id: &str,
        command: &str,
        args: Vec<String>,
        env: Vec<(String, String)>,
        user: Option<u32>,
        wait: bool,
    ) -> Reply {
        let container = match self.lookup(id) {
            Ok(container) => container,
            Err(reply) => return reply,
        };
        let options = SpawnOptions { wait, user, env };
        match container.spawn(command, &args, &options) {
            Ok(result) => {
                if let Some(status) = result.exit_status {
                    let _ = self.events.send(Event::SpawnExited {
                        id: id.to_string(),
                        pid: result.pid,
                        status,
                    });
                }
                Reply::Spawned {
                    pid: result.pid,
                    exit_status: result.exit_status,
                }
            }
            Err(err) => Reply::Error {
                kind: errmap::container_kind(&err),
                message: err.to_string(),
            },
        }
    }

    fn info(&self, id: &str) -> Reply {
        let container = match self.lookup(id) {
            Ok(container) => container,
            Err(reply) => return reply,
        };
        Reply::Info {
            id: container.id().to_string(),
            cgroup_id: container.cgroup_id(),
            init_pid: container.init_pid(),
            rootfs: container.rootfs_path(),
            capabilities: container.capabilities().bits(),
            children: container.child_pids(),
        }
    }

    fn kill(&self, id: &str, pid: i32) -> Reply {
        let container = match self.lookup(id) {
            Ok(container) => container,
            Err(reply) => return reply,
        };
        match container.kill(pid) {
            Ok(()) => Reply::Ok,
            Err(err) => Reply::Error {
                kind: errmap::container_kind(&err),
                message: err.to_string(),
            },
        }
    }

    fn upload(&self, id: &str, src: PathBuf, dst: PathBuf) -> Reply {
        let container = match self.lookup(id) {
            Ok(container) => container,
            Err(reply) => return reply,
        };
        match container.upload(&[src], &[dst]) {
            Ok(()) => Reply::Ok,
            Err(err) => Reply::Error {
                kind: errmap::container_kind(&err),
                message: err.to_string(),
            },
        }
    }

    fn download(&self, id: &str, src: PathBuf, dst: PathBuf) -> Reply {
        let container = match self.lookup(id) {
            Ok(container) => container,
            Err(reply) => return reply,
        };
        match container.download(&[src], &[dst]) {
            Ok(()) => Reply::Ok,
            Err(err) => Reply::Error {
                kind: errmap::container_kind(&err),
                message: err.to_string(),
            },
        }
    }

    /// Policy entries go first so no window exists where the container
    /// is gone but its map entries linger past the call.
    fn destroy(&self, id: &str) -> Reply {
        let container = match self.containers.lock().unwrap().remove(id) {
            Some(container) => container,
            // Destroy is idempotent: a container that is already gone
            // is a success no-op.
            None => {
                debug!(%id, "destroy of unknown container");
                return Reply::Ok;
            }
        };
        match self.bpf.cleanup_policy(id) {
            Ok(()) | Err(bpf_manager::BpfError::NotSupported) => {}
            Err(err) => warn!(%id, %err, "policy cleanup failed"),
        }
        let result = container.destroy();
        let _ = self.events.send(Event::ContainerDestroyed { id: id.to_string() });
        match result {
            Ok(()) => Reply::Ok,
            Err(err) => Reply::Error {
                kind: errmap::container_kind(&err),
                message: err.to_string(),
            },
        }
    }
}
