use clap::Parser;

mod args;
mod client;
mod commands;
#[cfg(target_os = "linux")]
mod daemon;
mod errmap;

use args::Cli;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let cli = Cli::parse();
    let code = match commands::dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("fatal: {err:?}");
            2
        }
    };
    std::process::exit(code);
}
