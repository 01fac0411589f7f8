use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use crate::client::{DEFAULT_WRITE_BUFFER_SIZE, MAX_WRITE_CHUNK};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:7420";
pub const DEFAULT_SERVER: &str = "127.0.0.1:7420";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Config file (TOML). All fields optional; CLI args take precedence.
/// Default location: `{config_dir}/netfs/config.toml`
/// (Linux: `~/.config/netfs/config.toml`)
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub listen: Option<String>,
    pub base_path: Option<PathBuf>,
    pub server: Option<String>,
    pub mount: Option<PathBuf>,
    pub allow_other: Option<bool>,
    pub write_buffer_size: Option<usize>,
    /// Seconds.
    pub request_timeout: Option<u64>,
}

impl ConfigFile {
    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Load `explicit`, or the default location if none was given. A missing
    /// default file is an empty config; a missing explicit one is an error.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config file {path:?}"))?;
        Self::parse(&contents).with_context(|| format!("parsing config file {path:?}"))
    }
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "netfs").map(|p| p.config_dir().join("config.toml"))
}

/// netfs: export a directory over TCP and mount it elsewhere through FUSE.
#[derive(Parser, Debug)]
#[command(name = "netfs", about = "Network filesystem over TCP and FUSE")]
pub struct CliArgs {
    /// Path to config file (default: {config_dir}/netfs/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Export a local directory.
    Serve(ServeArgs),
    /// Mount a remote export.
    Mount(MountArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on (default 0.0.0.0:7420).
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Directory to export.
    #[arg(short, long)]
    pub base_path: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct MountArgs {
    /// Server address as host:port (default 127.0.0.1:7420).
    #[arg(short, long)]
    pub server: Option<String>,

    /// Mount point.
    #[arg(short, long)]
    pub mount: Option<PathBuf>,

    /// Allow other users to access the mount.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub allow_other: Option<bool>,

    /// Bytes buffered per open file before a coalesced write is sent.
    #[arg(long)]
    pub write_buffer_size: Option<usize>,

    /// Seconds to wait for each server response.
    #[arg(long)]
    pub request_timeout: Option<u64>,
}

/// Resolved `serve` configuration.
#[derive(Debug)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub base_path: PathBuf,
}

impl ServerConfig {
    pub fn resolve(args: &ServeArgs, cfg: &ConfigFile) -> anyhow::Result<Self> {
        let listen = args
            .listen
            .clone()
            .or_else(|| cfg.listen.clone())
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());

        let base_path = args
            .base_path
            .clone()
            .or_else(|| cfg.base_path.clone())
            .ok_or_else(|| anyhow::anyhow!(
                "Base path is required. Pass --base-path <dir> or set `base_path` in config file."
            ))?;

        Ok(Self {
            listen: resolve_addr(&listen)?,
            base_path,
        })
    }

    /// The export root must be an existing directory.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.base_path.is_dir() {
            anyhow::bail!("Base path {:?} is not a directory", self.base_path);
        }
        Ok(())
    }
}

/// Resolved `mount` configuration.
#[derive(Debug)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub mount_point: PathBuf,
    pub allow_other: bool,
    pub write_buffer_size: usize,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn resolve(args: &MountArgs, cfg: &ConfigFile) -> anyhow::Result<Self> {
        let server = args
            .server
            .clone()
            .or_else(|| cfg.server.clone())
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());

        let mount_point = args
            .mount
            .clone()
            .or_else(|| cfg.mount.clone())
            .ok_or_else(|| anyhow::anyhow!(
                "Mount point is required. Pass --mount <path> or set `mount` in config file."
            ))?;

        let write_buffer_size = args
            .write_buffer_size
            .or(cfg.write_buffer_size)
            .unwrap_or(DEFAULT_WRITE_BUFFER_SIZE);
        if write_buffer_size > MAX_WRITE_CHUNK {
            anyhow::bail!(
                "write_buffer_size {write_buffer_size} exceeds the largest write request \
                 ({MAX_WRITE_CHUNK} bytes)"
            );
        }

        Ok(Self {
            server: resolve_addr(&server)?,
            mount_point,
            allow_other: args.allow_other.or(cfg.allow_other).unwrap_or(false),
            write_buffer_size,
            request_timeout: Duration::from_secs(
                args.request_timeout
                    .or(cfg.request_timeout)
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
        })
    }

    pub fn ensure_mount_point(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.mount_point)
            .with_context(|| format!("creating mount point {:?}", self.mount_point))?;
        Ok(())
    }
}

/// First address `addr` resolves to. Accepts `host:port` as well as literals.
fn resolve_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    addr.to_socket_addrs()
        .with_context(|| format!("resolving {addr}"))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("{addr} resolved to no addresses"))
}
