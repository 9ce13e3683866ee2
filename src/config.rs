use std::{path::Path, time::Duration};

use serde::Deserialize;
use tokio::net::lookup_host;

use crate::roster::Roster;

/// Deployment configuration, shared verbatim by every process. The position
/// of an entry in `processes` is its id; entry 0 is the Commander.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Max traitors the run should mask; the protocol plays
    /// `num_faulty + 1` rounds.
    pub num_faulty: usize,
    /// `host:port` per process.
    pub processes: Vec<String>,
    #[serde(default = "default_send_attempts")]
    pub send_attempts: usize,
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
}

fn default_send_attempts() -> usize {
    5
}

fn default_recv_timeout_ms() -> u64 {
    500
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let config: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        if config.processes.len() < 2 {
            crate::bail!("need a Commander and at least one Lieutenant");
        }
        if config.num_faulty + 1 >= config.processes.len() {
            crate::bail!(
                "num_faulty {} leaves no one to relay among {} processes",
                config.num_faulty,
                config.processes.len()
            );
        }
        Ok(config)
    }

    pub async fn resolve(&self) -> crate::Result<Roster> {
        let mut addrs = Vec::with_capacity(self.processes.len());
        for process in &self.processes {
            let addr = lookup_host(process.as_str())
                .await?
                .next()
                .ok_or_else(|| crate::err!("{process} resolves to no address"))?;
            addrs.push(addr);
        }
        Ok(Roster::new(addrs))
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}
