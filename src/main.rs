use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fuser::MountOption;
use tracing::info;

use netfs::client::{RemoteClient, WriteBackCache};
use netfs::config::{ClientConfig, CliArgs, Command, ConfigFile, ServerConfig};
use netfs::fuse_fs::NetFs;
use netfs::net::TcpChannel;
use netfs::server::{Dispatcher, Server};

fn main() -> Result<()> {
    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let file = ConfigFile::load(args.config.as_deref())?;

    match &args.command {
        Command::Serve(serve) => run_server(ServerConfig::resolve(serve, &file)?),
        Command::Mount(mount) => run_mount(ClientConfig::resolve(mount, &file)?),
    }
}

fn run_server(config: ServerConfig) -> Result<()> {
    config.validate()?;
    let base = config
        .base_path
        .to_str()
        .context("Base path must be valid UTF-8")?
        .to_string();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let server = Server::bind(config.listen, Dispatcher::new(base))
            .await
            .with_context(|| format!("binding {}", config.listen))?;
        info!(addr = %server.local_addr()?, "Starting netfs server");

        tokio::select! {
            _ = server.run() => {}
            _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        }
        Ok(())
    })
}

fn run_mount(config: ClientConfig) -> Result<()> {
    config.ensure_mount_point()?;

    // Drives the connection; FUSE callbacks block on it from the session thread.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    let channel = TcpChannel::new(config.server, config.request_timeout, runtime.handle().clone());
    let client = Arc::new(RemoteClient::new(channel));

    // Fail before mounting if the server is unreachable or the export is broken.
    let root = client
        .get_attributes("/", None)
        .with_context(|| format!("reaching server at {}", config.server))?;
    if !root.is_dir() {
        anyhow::bail!("Server export root is not a directory");
    }

    let cache = Arc::new(WriteBackCache::new(client, config.write_buffer_size));
    let fs = NetFs::new(cache);

    let mut options = vec![
        MountOption::FSName("netfs".to_string()),
        MountOption::AutoUnmount,
    ];
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }

    info!(
        server = %config.server,
        mount = ?config.mount_point,
        write_buffer_size = config.write_buffer_size,
        "Mounting"
    );

    // Blocks until unmounted
    fuser::mount2(fs, &config.mount_point, &options)?;

    info!("Unmounted. Goodbye.");
    Ok(())
}
