use std::net::SocketAddr;

use crate::codec::ProcessId;

/// Addresses of every process in the deployment, indexed by id. Id 0 is the
/// Commander; the rest are Lieutenants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster(Vec<SocketAddr>);

impl Roster {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self(addrs)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn addr(&self, id: ProcessId) -> SocketAddr {
        self.0[id as usize]
    }

    pub fn contains(&self, id: ProcessId) -> bool {
        (id as usize) < self.0.len()
    }

    pub fn lieutenants(&self) -> impl Iterator<Item = ProcessId> + '_ {
        1..self.0.len() as ProcessId
    }

    /// Whether `from` is on the same host as process `id`. Source ports are
    /// ephemeral, so only the host half participates; two processes on one
    /// host are indistinguishable to this check.
    pub fn same_host(&self, id: ProcessId, from: SocketAddr) -> bool {
        self.0[id as usize].ip() == from.ip()
    }
}
