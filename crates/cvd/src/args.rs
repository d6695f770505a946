use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "cvd", about = "chef container daemon and control client", version)]
pub struct Cli {
    /// Control endpoint: a socket path, an abstract name (@cvd), or an
    /// inet4 host:port.
    #[arg(long, global = true, env = cvd_protocol::SOCKET_ENV,
          default_value = cvd_protocol::DEFAULT_SOCKET)]
    pub socket: String,

    /// Deadline in seconds for one request/reply exchange.
    #[arg(long, global = true, default_value_t = 30)]
    pub timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon.
    Serve {
        /// Per-container work directories live here.
        #[arg(long, default_value = "/var/chef/mnt")]
        work_root: PathBuf,

        /// Compiled LSM object; enforcement is disabled when absent.
        #[arg(long)]
        bpf_object: Option<PathBuf>,

        #[arg(long, default_value = bpf_manager::DEFAULT_PIN_DIR)]
        pin_dir: PathBuf,

        #[arg(long, default_value_t = 16384)]
        map_capacity: u32,
    },

    /// Create a container from layers.
    Create {
        #[arg(long)]
        id: Option<String>,

        /// Base rootfs directory.
        #[arg(long)]
        rootfs: Option<PathBuf>,

        /// Read-only package layer; repeatable, stacked in order.
        #[arg(long = "pack")]
        packs: Vec<PathBuf>,

        /// Put a writable overlay on top of the stack.
        #[arg(long)]
        overlay: bool,

        /// Host bind `SRC:DST[:ro]`; repeatable.
        #[arg(long = "bind")]
        binds: Vec<String>,

        /// Ruleset YAML compiled into the container's policy.
        #[arg(long)]
        policy: Option<PathBuf>,

        #[arg(long)]
        hostname: Option<String>,
    },

    /// Run a command inside a container.
    Spawn {
        id: String,
        command: String,
        args: Vec<String>,

        /// Block until the command exits and propagate its status.
        #[arg(long)]
        wait: bool,

        #[arg(long)]
        user: Option<u32>,

        /// `KEY=VALUE`; repeatable.
        #[arg(long = "env")]
        env: Vec<String>,
    },

    /// Terminate a spawned process.
    Kill { id: String, pid: i32 },

    /// Copy a host file into a container.
    Upload {
        id: String,
        src: PathBuf,
        dst: PathBuf,
        #[arg(long)]
        user: Option<u32>,
    },

    /// Copy a container file out to the host.
    Download { id: String, src: PathBuf, dst: PathBuf },

    /// Tear a container down.
    Destroy { id: String },

    /// Describe a running container.
    Info { id: String },

    /// Enter a container's namespaces and run a command there
    /// (diagnostic; requires privileges over the init process).
    Join {
        id: String,
        /// Command to run inside; defaults to /bin/sh.
        command: Vec<String>,
    },

    /// Print enforcement metrics.
    Metrics,

    /// Compile a ruleset into binary profiles, offline.
    Compile {
        /// Ruleset YAML.
        rules: PathBuf,

        /// Output path for the path profile.
        #[arg(long, short)]
        out: PathBuf,

        /// Determinize to the DFA form.
        #[arg(long)]
        dfa: bool,

        #[arg(long)]
        case_insensitive: bool,
    },
}

/// Parse `SRC:DST[:ro]`.
pub fn parse_bind(raw: &str) -> Option<(PathBuf, PathBuf, bool)> {
    let mut parts = raw.split(':');
    let src = parts.next()?;
    let dst = parts.next()?;
    let readonly = match parts.next() {
        None => false,
        Some("ro") => true,
        Some(_) => return None,
    };
    if parts.next().is_some() || src.is_empty() || dst.is_empty() {
        return None;
    }
    Some((PathBuf::from(src), PathBuf::from(dst), readonly))
}

/// Parse `KEY=VALUE`.
pub fn parse_env(raw: &str) -> Option<(String, String)> {
    let (k, v) = raw.split_once('=')?;
    if k.is_empty() {
        return None;
    }
    Some((k.to_string(), v.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_forms() {
        assert_eq!(
            parse_bind("/a:/b"),
            Some((PathBuf::from("/a"), PathBuf::from("/b"), false))
        );
        assert_eq!(
            parse_bind("/a:/b:ro"),
            Some((PathBuf::from("/a"), PathBuf::from("/b"), true))
        );
        assert!(parse_bind("/a").is_none());
        assert!(parse_bind("/a:/b:rw:x").is_none());
        assert!(parse_bind(":/b").is_none());
    }

    #[test]
    fn env_forms() {
        assert_eq!(
            parse_env("PATH=/usr/bin"),
            Some(("PATH".into(), "/usr/bin".into()))
        );
        assert_eq!(parse_env("EMPTY="), Some(("EMPTY".into(), String::new())));
        assert!(parse_env("NOVALUE").is_none());
        assert!(parse_env("=x").is_none());
    }
}
