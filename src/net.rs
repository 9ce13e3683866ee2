use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    ops::ControlFlow,
    sync::Arc,
    time::Duration,
};

use tokio::{
    net::UdpSocket,
    sync::mpsc::UnboundedSender,
    time::{timeout_at, Instant},
};
use tracing::warn;

use crate::codec::{Ack, Message};

const MAX_DATAGRAM: usize = 65536;

/// Reliable-unicast endpoint for one remote process. Owns a dedicated
/// socket so that acks for its sends come back to it and nowhere else.
#[derive(Debug)]
pub struct Client {
    socket: UdpSocket,
    remote: SocketAddr,
    recv_timeout: Duration,
}

impl Client {
    pub async fn connect(remote: SocketAddr, recv_timeout: Duration) -> crate::Result<Self> {
        let unspecified: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(unspecified).await?;
        socket.connect(remote).await?;
        Ok(Self {
            socket,
            remote,
            recv_timeout,
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Send `buf`, then wait for a reply that `accept` breaks on. Every
    /// reply received before the per-attempt deadline is offered to
    /// `accept`; a deadline that elapses first triggers a resend, up to
    /// `attempts` sends in total. Returns whether a reply matched.
    pub async fn send_with_ack(
        &self,
        buf: &[u8],
        attempts: usize,
        accept: impl Fn(&[u8]) -> ControlFlow<()>,
    ) -> crate::Result<bool> {
        let mut reply = vec![0; MAX_DATAGRAM];
        for _ in 0..attempts {
            self.socket.send(buf).await?;
            let deadline = Instant::now() + self.recv_timeout;
            loop {
                let len = match timeout_at(deadline, self.socket.recv(&mut reply)).await {
                    Ok(len) => len?,
                    Err(_) => break,
                };
                if accept(&reply[..len]).is_break() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// The process's bound roster socket. A listen task pumps every received
/// datagram, with its source address, to the single role task.
#[derive(Debug, Clone)]
pub struct Listener(Arc<UdpSocket>);

impl Listener {
    pub async fn bind(addr: SocketAddr) -> crate::Result<Self> {
        Ok(Self(Arc::new(UdpSocket::bind(addr).await?)))
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.0.local_addr()?)
    }

    pub async fn listen_loop(
        self,
        event: UnboundedSender<(SocketAddr, Vec<u8>)>,
    ) -> crate::Result<()> {
        let mut buf = vec![0; MAX_DATAGRAM];
        loop {
            let (len, remote) = self.0.recv_from(&mut buf).await?;
            if event.send((remote, buf[..len].to_vec())).is_err() {
                // The role task decided and dropped its receiver.
                return Ok(());
            }
        }
    }

    /// Fire-and-forget reply on the listening socket, used for acks.
    pub fn reply(&self, to: SocketAddr, buf: Vec<u8>) {
        let socket = self.0.clone();
        tokio::spawn(async move {
            if let Err(err) = socket.send_to(&buf, to).await {
                warn!(%to, "reply send failed: {err}");
            }
        });
    }
}

/// Push one protocol message through the reliable unicast client, retrying
/// until an ack for the message's round arrives or attempts run out. Give-up
/// is logged, never propagated; the receiver's round timeout covers the
/// loss.
pub async fn send_message(client: &Client, message: &Message, attempts: usize) {
    let round = message.round;
    let accept = move |reply: &[u8]| match Ack::decode(reply) {
        Some(ack) if ack.round == round => ControlFlow::Break(()),
        _ => ControlFlow::Continue(()),
    };
    match client.send_with_ack(&message.encode(), attempts, accept).await {
        Ok(true) => {}
        Ok(false) => warn!(to = %client.remote_addr(), "no ack for {message}"),
        Err(err) => warn!(to = %client.remote_addr(), "send of {message} failed: {err}"),
    }
}
