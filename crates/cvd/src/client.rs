//! One-shot request client used by the CLI subcommands.

use anyhow::Context;
use cvd_protocol::{read_message, write_message, Endpoint, Message, Reply, Request};

/// Send one request and wait for its reply, skipping interleaved event
/// broadcasts.
pub async fn request(endpoint: &Endpoint, body: Request) -> anyhow::Result<Reply> {
    let mut conn = endpoint
        .connect()
        .await
        .with_context(|| format!("connecting to {endpoint}"))?;
    let seq = 1u64;
    write_message(&mut conn, &Message::Request { seq, body }).await?;
    loop {
        match read_message::<_, Message>(&mut conn).await? {
            Message::Reply { seq: got, body } if got == seq => return Ok(body),
            Message::Event { .. } | Message::Reply { .. } => continue,
            Message::Request { .. } => {
                anyhow::bail!("peer sent a request on a client connection")
            }
        }
    }
}

/// Print a reply and derive the process exit code.
pub fn report(reply: &Reply) -> i32 {
    match reply {
        Reply::Created { id, cgroup_id } => {
            println!("{id} cgroup={cgroup_id}");
            0
        }
        Reply::Spawned { pid, exit_status } => {
            match exit_status {
                Some(status) => println!("pid {pid} exited with {status}"),
                None => println!("{pid}"),
            }
            0
        }
        Reply::Ok => 0,
        Reply::Info {
            id,
            cgroup_id,
            init_pid,
            rootfs,
            capabilities,
            children,
        } => {
            println!("id: {id}");
            println!("cgroup: {cgroup_id}");
            println!("init: {init_pid}");
            println!("rootfs: {}", rootfs.display());
            println!("capabilities: {capabilities:#x}");
            println!("children: {children:?}");
            0
        }
        Reply::Metrics { bpf, containers } => {
            println!("containers: {containers}");
            println!("policy entries: {}", bpf.policy_entry_count);
            println!(
                "populate ops: {} ({} failed, {}us)",
                bpf.populate_ops, bpf.failed_populate_ops, bpf.populate_time_us
            );
            println!(
                "cleanup ops: {} ({}us)",
                bpf.cleanup_ops, bpf.cleanup_time_us
            );
            0
        }
        Reply::Error { kind, message } => {
            eprintln!("error [{kind}]: {message}");
            kind.exit_code()
        }
    }
}
