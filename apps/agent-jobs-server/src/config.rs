//! Command-line and environment configuration.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "agent-jobs-server")]
#[command(author, version, about = "Serve agent execution jobs over HTTP", long_about = None)]
pub struct Config {
    /// Address to bind.
    #[arg(long, env = "AGENT_JOBS_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(short, long, env = "AGENT_JOBS_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Directory that `configPath` values are resolved against.
    #[arg(long, env = "AGENT_JOBS_AGENTS_DIR", default_value = ".")]
    pub agents_dir: PathBuf,

    /// Record time-to-live in seconds when a request sets none.
    #[arg(long, env = "AGENT_JOBS_DEFAULT_TTL", default_value_t = 3600)]
    pub default_ttl: u64,

    /// Seconds between sweeps of expired execution records.
    #[arg(long, env = "AGENT_JOBS_SWEEP_INTERVAL", default_value_t = 60)]
    pub sweep_interval: u64,

    /// Seconds to wait for in-flight executions on shutdown.
    #[arg(long, env = "AGENT_JOBS_SHUTDOWN_GRACE", default_value_t = 10)]
    pub shutdown_grace: u64,
}

impl Config {
    /// Socket address to listen on.
    ///
    /// # Errors
    /// Returns error if `host` is not an IP address.
    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        let ip = self
            .host
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid host {:?}: {e}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub const fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(if self.sweep_interval == 0 { 1 } else { self.sweep_interval })
    }

    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}
