//! Subcommand dispatch: build requests, talk to the daemon, map errors
//! onto exit codes.

use std::path::{Path, PathBuf};

use tracing::info;

use containerv::LayerSpec;
use cvd_protocol::{Endpoint, Reply, Request};
use protecc::{
    compile, CompileConfig, CompileFlags, CompileMode, MountProfile, NetworkProfile, Ruleset,
};

use crate::args::{parse_bind, parse_env, Cli, Command};
use crate::client;
use crate::errmap;

const EXIT_USER_ERROR: i32 = 1;
const EXIT_SYSTEM_ERROR: i32 = 2;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let endpoint: Endpoint = match cli.socket.parse() {
        Ok(endpoint) => endpoint,
        Err(err) => {
            eprintln!("error [invalid-argument]: {err}");
            return Ok(EXIT_USER_ERROR);
        }
    };
    let deadline = std::time::Duration::from_secs(cli.timeout);

    match cli.command {
        Command::Serve {
            work_root,
            bpf_object,
            pin_dir,
            map_capacity,
        } => serve(endpoint, work_root, bpf_object, pin_dir, map_capacity).await,

        Command::Create {
            id,
            rootfs,
            packs,
            overlay,
            binds,
            policy,
            hostname,
        } => {
            let request = match build_create(id, rootfs, packs, overlay, &binds, policy, hostname) {
                Ok(request) => request,
                Err(code) => return Ok(code),
            };
            round_trip(&endpoint, request, deadline).await
        }

        Command::Spawn {
            id,
            command,
            args,
            wait,
            user,
            env,
        } => {
            let mut parsed_env = Vec::with_capacity(env.len());
            for raw in &env {
                match parse_env(raw) {
                    Some(pair) => parsed_env.push(pair),
                    None => {
                        eprintln!("error [invalid-argument]: bad --env '{raw}'");
                        return Ok(EXIT_USER_ERROR);
                    }
                }
            }
            round_trip(
                &endpoint,
                Request::Spawn {
                    id,
                    command,
                    args,
                    env: parsed_env,
                    user,
                    wait,
                },
                deadline,
            )
            .await
        }

        Command::Kill { id, pid } => round_trip(&endpoint, Request::Kill { id, pid }, deadline).await,

        Command::Upload { id, src, dst, user } => {
            round_trip(&endpoint, Request::Upload { id, src, dst, user }, deadline).await
        }

        Command::Download { id, src, dst } => {
            round_trip(&endpoint, Request::Download { id, src, dst }, deadline).await
        }

        Command::Destroy { id } => round_trip(&endpoint, Request::Destroy { id }, deadline).await,

        Command::Info { id } => round_trip(&endpoint, Request::Info { id }, deadline).await,

        Command::Join { id, command } => join(&endpoint, id, command, deadline).await,

        Command::Metrics => round_trip(&endpoint, Request::Metrics, deadline).await,

        Command::Compile {
            rules,
            out,
            dfa,
            case_insensitive,
        } => Ok(compile_offline(&rules, &out, dfa, case_insensitive)),
    }
}

async fn round_trip(
    endpoint: &Endpoint,
    request: Request,
    deadline: std::time::Duration,
) -> anyhow::Result<i32> {
    // The deadline aborts the wait, not the server: the daemon stays
    // free to finish the operation and clean up after itself.
    match tokio::time::timeout(deadline, client::request(endpoint, request)).await {
        Ok(Ok(reply)) => Ok(client::report(&reply)),
        Ok(Err(err)) => {
            eprintln!("error [io]: {err:#}");
            Ok(EXIT_SYSTEM_ERROR)
        }
        Err(_) => {
            eprintln!("error [transient]: no reply within {}s", deadline.as_secs());
            Ok(EXIT_SYSTEM_ERROR)
        }
    }
}

fn build_create(
    id: Option<String>,
    rootfs: Option<PathBuf>,
    packs: Vec<PathBuf>,
    overlay: bool,
    binds: &[String],
    policy: Option<PathBuf>,
    hostname: Option<String>,
) -> Result<Request, i32> {
    let mut layers = Vec::new();
    if let Some(path) = rootfs {
        layers.push(LayerSpec::BaseRootfs { path });
    }
    for path in packs {
        layers.push(LayerSpec::Package {
            path,
            readonly: true,
        });
    }
    if overlay {
        layers.push(LayerSpec::Overlay { upper: None });
    }
    for raw in binds {
        match parse_bind(raw) {
            Some((source, target, readonly)) => layers.push(LayerSpec::HostDir {
                source,
                target,
                readonly,
            }),
            None => {
                eprintln!("error [invalid-argument]: bad --bind '{raw}'");
                return Err(EXIT_USER_ERROR);
            }
        }
    }

    let policy = match policy {
        None => None,
        Some(path) => match load_policy(&path) {
            Ok(spec) => Some(spec),
            Err(code) => return Err(code),
        },
    };

    Ok(Request::Create {
        id,
        layers,
        mounts: Vec::new(),
        policy,
        hostname,
    })
}

fn load_policy(path: &Path) -> Result<bpf_manager::PolicySpec, i32> {
    let ruleset = match Ruleset::load(path) {
        Ok(ruleset) => ruleset,
        Err(err) => {
            let kind = errmap::protecc_kind(&err);
            eprintln!("error [{kind}]: {} ({err})", path.display());
            return Err(kind.exit_code());
        }
    };
    Ok(bpf_manager::PolicySpec {
        allow: ruleset.path_rules().into_iter().map(Into::into).collect(),
        deny: ruleset
            .deny_path_rules()
            .into_iter()
            .map(Into::into)
            .collect(),
    })
}

fn compile_offline(rules: &Path, out: &Path, dfa: bool, case_insensitive: bool) -> i32 {
    let ruleset = match Ruleset::load(rules) {
        Ok(ruleset) => ruleset,
        Err(err) => {
            let kind = errmap::protecc_kind(&err);
            eprintln!("error [{kind}]: {} ({err})", rules.display());
            return kind.exit_code();
        }
    };

    let flags = CompileFlags {
        case_insensitive,
        deny_precedence: !ruleset.deny_paths.is_empty(),
    };
    let mode = if dfa {
        CompileMode::Dfa
    } else {
        CompileMode::Trie
    };
    let profile = match compile(
        &ruleset.path_rules(),
        flags,
        mode,
        &CompileConfig::default(),
    ) {
        Ok(profile) => profile,
        Err(err) => {
            let kind = errmap::protecc_kind(&err);
            eprintln!("error [{kind}]: {err}");
            return kind.exit_code();
        }
    };

    let bytes = profile.to_bytes();
    if let Err(err) = std::fs::write(out, &bytes) {
        eprintln!("error [io]: {} ({err})", out.display());
        return EXIT_SYSTEM_ERROR;
    }
    info!(out = %out.display(), bytes = bytes.len(), "path profile written");
    println!(
        "{}: {} rules, {} bytes ({})",
        out.display(),
        ruleset.paths.len(),
        bytes.len(),
        if dfa { "dfa" } else { "trie" }
    );

    // Network and mount rules get sibling profiles.
    if !ruleset.network.is_empty() {
        match NetworkProfile::new(ruleset.network_rules(), 0) {
            Ok(profile) => {
                let path = out.with_extension("net");
                if let Err(err) = std::fs::write(&path, profile.to_bytes()) {
                    eprintln!("error [io]: {} ({err})", path.display());
                    return EXIT_SYSTEM_ERROR;
                }
                println!("{}: {} network rules", path.display(), profile.rules().len());
            }
            Err(err) => {
                let kind = errmap::protecc_kind(&err);
                eprintln!("error [{kind}]: {err}");
                return kind.exit_code();
            }
        }
    }
    if !ruleset.mounts.is_empty() {
        match MountProfile::new(ruleset.mount_rules(), 0) {
            Ok(profile) => {
                let path = out.with_extension("mnt");
                if let Err(err) = std::fs::write(&path, profile.to_bytes()) {
                    eprintln!("error [io]: {} ({err})", path.display());
                    return EXIT_SYSTEM_ERROR;
                }
                println!("{}: {} mount rules", path.display(), profile.rules().len());
            }
            Err(err) => {
                let kind = errmap::protecc_kind(&err);
                eprintln!("error [{kind}]: {err}");
                return kind.exit_code();
            }
        }
    }
    0
}

#[cfg(target_os = "linux")]
async fn join(
    endpoint: &Endpoint,
    id: String,
    command: Vec<String>,
    deadline: std::time::Duration,
) -> anyhow::Result<i32> {
    let reply = match tokio::time::timeout(
        deadline,
        client::request(endpoint, Request::Info { id }),
    )
    .await
    {
        Ok(Ok(reply)) => reply,
        Ok(Err(err)) => {
            eprintln!("error [io]: {err:#}");
            return Ok(EXIT_SYSTEM_ERROR);
        }
        Err(_) => {
            eprintln!("error [transient]: no reply within {}s", deadline.as_secs());
            return Ok(EXIT_SYSTEM_ERROR);
        }
    };
    let (init_pid, capabilities) = match reply {
        Reply::Info {
            init_pid,
            capabilities,
            ..
        } => (init_pid, capabilities),
        other => return Ok(client::report(&other)),
    };

    // setns must happen on a plain thread: joined namespaces stay with
    // the thread, and the pid namespace only applies to its children.
    let code = tokio::task::spawn_blocking(move || {
        if let Err(err) =
            containerv::join_namespaces(init_pid, containerv::Capabilities::from_bits(capabilities))
        {
            eprintln!("error [{}]: {err}", errmap::container_kind(&err));
            return errmap::container_kind(&err).exit_code();
        }
        let (program, args) = match command.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => ("/bin/sh".to_string(), Vec::new()),
        };
        match std::process::Command::new(program).args(args).status() {
            Ok(status) => status.code().unwrap_or(EXIT_SYSTEM_ERROR),
            Err(err) => {
                eprintln!("error [io]: {err}");
                EXIT_SYSTEM_ERROR
            }
        }
    })
    .await?;
    Ok(code)
}

#[cfg(not(target_os = "linux"))]
async fn join(
    _endpoint: &Endpoint,
    _id: String,
    _command: Vec<String>,
    _deadline: std::time::Duration,
) -> anyhow::Result<i32> {
    eprintln!("error [not-supported]: join only works on Linux");
    Ok(3)
}

#[cfg(target_os = "linux")]
async fn serve(
    endpoint: Endpoint,
    work_root: PathBuf,
    bpf_object: Option<PathBuf>,
    pin_dir: PathBuf,
    map_capacity: u32,
) -> anyhow::Result<i32> {
    use crate::daemon::{Daemon, DaemonConfig};

    let mut bpf = bpf_manager::BpfConfig {
        pin_dir,
        map_capacity,
        ..Default::default()
    };
    if let Some(object_path) = bpf_object {
        bpf.object_path = object_path;
    }
    let daemon = Daemon::new(DaemonConfig { work_root, bpf })?;
    daemon.serve(endpoint).await?;
    Ok(0)
}

#[cfg(not(target_os = "linux"))]
async fn serve(
    _endpoint: Endpoint,
    _work_root: PathBuf,
    _bpf_object: Option<PathBuf>,
    _pin_dir: PathBuf,
    _map_capacity: u32,
) -> anyhow::Result<i32> {
    eprintln!("error [not-supported]: the daemon only runs on Linux");
    Ok(3)
}
