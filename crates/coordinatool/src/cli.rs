use std::path::PathBuf;

use clap::Parser;

use coordinator_protocol::CoordinatorConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "coordinatool", version, about = "HSM request coordinator between a copytool uplink and remote worker agents")]
pub struct Cli {
    /// Increase log verbosity (repeatable: -v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Decrease log verbosity (repeatable).
    #[arg(short = 'q', long = "quiet", action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// Restrict dispatch to this archive id (repeatable).
    #[arg(short = 'A', long = "archive", value_name = "ID")]
    pub archive: Vec<u32>,

    /// Listen address.
    #[arg(short = 'H', long = "host", env = "COORDINATOOL_HOST")]
    pub host: Option<String>,

    /// Listen port.
    #[arg(short = 'p', long = "port", env = "COORDINATOOL_PORT")]
    pub port: Option<u16>,

    /// Persistence Mirror (KV store) host.
    #[arg(long = "redis-host", env = "COORDINATOOL_KV_STORE_HOST")]
    pub redis_host: Option<String>,

    /// Persistence Mirror (KV store) port.
    #[arg(long = "redis-port", env = "COORDINATOOL_KV_STORE_PORT")]
    pub redis_port: Option<u16>,

    /// Mount point of the filesystem this coordinator serves.
    pub mount: PathBuf,
}

impl Cli {
    /// Net verbosity delta: positive raises the log level, negative lowers it.
    pub fn verbosity(&self) -> i32 {
        self.verbose as i32 - self.quiet as i32
    }

    /// Layer CLI flags over a loaded config, CLI taking precedence since it
    /// is the most specific source a user can reach for at invocation time.
    pub fn apply_overrides(&self, config: &mut CoordinatorConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = &self.redis_host {
            config.kv_store_host = host.clone();
        }
        if let Some(port) = self.redis_port {
            config.kv_store_port = port;
        }
        if !self.archive.is_empty() {
            config.archive_ids = self.archive.clone();
        }
        config.verbosity += self.verbosity();
    }
}
