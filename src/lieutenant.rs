use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    ops::ControlFlow,
    sync::Arc,
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinSet, time::timeout};
use tracing::{info, warn};

use crate::{
    codec::{expected_chains, frame_tag, Ack, Message, Order, ProcessId, BYZANTINE, COMMANDER},
    net::{send_message, Client, Listener},
    roster::Roster,
};

/// A process with id >= 1. Collects messages round by round, relays them,
/// and decides once round `num_faulty` is done.
#[derive(Debug)]
pub struct Lieutenant {
    id: ProcessId,
    num_faulty: usize,
    roster: Roster,
    listener: Listener,
    clients: HashMap<ProcessId, Arc<Client>>,
    send_attempts: usize,
    recv_timeout: Duration,

    round: u32,
    orders_seen: HashSet<Order>,
    msgs_this_round: HashSet<Message>,
    ids_this_round: HashSet<Vec<ProcessId>>,
    relay_tasks: JoinSet<()>,
}

impl Lieutenant {
    pub async fn new(
        listener: Listener,
        roster: Roster,
        id: ProcessId,
        num_faulty: usize,
        send_attempts: usize,
        recv_timeout: Duration,
    ) -> crate::Result<Self> {
        if id == COMMANDER || !roster.contains(id) {
            crate::bail!("id {id} is not a Lieutenant of {} processes", roster.len());
        }
        if num_faulty + 1 >= roster.len() {
            crate::bail!(
                "num_faulty {num_faulty} leaves no one to relay among {} processes",
                roster.len()
            );
        }
        let mut clients = HashMap::new();
        for peer in roster.lieutenants() {
            if peer == id {
                continue;
            }
            let client = Client::connect(roster.addr(peer), recv_timeout).await?;
            clients.insert(peer, Arc::new(client));
        }
        Ok(Self {
            id,
            num_faulty,
            roster,
            listener,
            clients,
            send_attempts,
            recv_timeout,
            round: 0,
            orders_seen: HashSet::new(),
            msgs_this_round: HashSet::new(),
            ids_this_round: HashSet::new(),
            relay_tasks: JoinSet::new(),
        })
    }

    /// Run the round engine to completion. All per-round state is mutated
    /// here, on this one task; the listen task only moves bytes. The error
    /// arm is reserved for broken internal invariants and socket failures,
    /// never for anything a traitor can trigger.
    pub async fn decide(mut self) -> crate::Result<Order> {
        let (event, mut source) = mpsc::unbounded_channel();
        let listen_task = tokio::spawn(self.listener.clone().listen_loop(event));

        loop {
            let verdict = match timeout(self.recv_timeout, source.recv()).await {
                Ok(Some((from, buf))) => self.on_datagram(from, &buf).await?,
                Ok(None) => crate::bail!("unexpected listener exit"),
                Err(_) => self.on_recv_timeout().await?,
            };
            if verdict.is_break() {
                break;
            }
        }

        listen_task.abort();
        self.join_relays().await;
        Ok(self.decide_order())
    }

    async fn on_datagram(
        &mut self,
        from: SocketAddr,
        buf: &[u8],
    ) -> crate::Result<ControlFlow<()>> {
        if frame_tag(buf) != Some(BYZANTINE) {
            return Ok(ControlFlow::Continue(()));
        }
        let Some(message) = Message::decode(buf) else {
            return Ok(ControlFlow::Continue(()));
        };
        if !self.valid_message(&message, from) {
            return Ok(ControlFlow::Continue(()));
        }

        let sender = message.ids[message.ids.len() - 1];
        info!(from = sender, "received {message}");
        // Ack even when the chain turns out to be a duplicate; the sender
        // keeps retrying until it hears one.
        self.ack(from);

        let round_done = if self.round == 0 {
            self.orders_seen.is_empty() && {
                self.orders_seen.insert(message.order);
                self.msgs_this_round.insert(message);
                true
            }
        } else if self.ids_this_round.contains(&message.ids) {
            false
        } else {
            self.ids_this_round.insert(message.ids.clone());
            self.orders_seen.insert(message.order);
            self.msgs_this_round.insert(message);
            self.round_complete()
        };

        if round_done {
            self.advance_round().await
        } else {
            Ok(ControlFlow::Continue(()))
        }
    }

    async fn on_recv_timeout(&mut self) -> crate::Result<ControlFlow<()>> {
        if self.round == 0 {
            // Nothing bounds the Commander; keep waiting.
            return Ok(ControlFlow::Continue(()));
        }
        warn!(round = self.round, "receive timeout, forcing round over");
        self.advance_round().await
    }

    fn valid_message(&self, message: &Message, from: SocketAddr) -> bool {
        if message.round != self.round {
            return false;
        }
        if message.ids.len() != message.round as usize + 1 {
            return false;
        }
        if message.ids.first() != Some(&COMMANDER) {
            return false;
        }
        let mut seen = HashSet::new();
        for &id in &message.ids {
            if !self.roster.contains(id) || id == self.id || !seen.insert(id) {
                return false;
            }
        }
        // Impersonation guard: the chain's last entry must live on the host
        // the datagram came from. Ports are ephemeral and not compared, so
        // this cannot tell apart processes sharing a host.
        self.roster.same_host(message.ids[message.ids.len() - 1], from)
    }

    fn ack(&self, to: SocketAddr) {
        self.listener.reply(to, Ack { round: self.round }.encode());
    }

    fn round_complete(&self) -> bool {
        self.ids_this_round.len() == expected_chains(self.roster.len(), self.round)
    }

    /// Close out the current round: join last round's relay workers, step
    /// the counter, turn every admitted message into relays for the peers
    /// not yet in its chain, one serial sender task per peer.
    async fn advance_round(&mut self) -> crate::Result<ControlFlow<()>> {
        if self.round as usize == self.num_faulty {
            return Ok(ControlFlow::Break(()));
        }
        self.join_relays().await;
        self.round += 1;

        let mut batches = HashMap::<ProcessId, Vec<Message>>::new();
        for message in &self.msgs_this_round {
            if message.round != self.round - 1 {
                crate::bail!(
                    "round {} message kept into round {}",
                    message.round,
                    self.round
                );
            }
            let mut relay = message.clone();
            relay.round = self.round;
            relay.ids.push(self.id);
            for pid in 0..self.roster.len() as ProcessId {
                if !relay.ids.contains(&pid) {
                    info!(to = pid, "sending {relay}");
                    batches.entry(pid).or_default().push(relay.clone());
                }
            }
        }
        for (pid, batch) in batches {
            let client = self.clients[&pid].clone();
            let attempts = self.send_attempts;
            self.relay_tasks.spawn(async move {
                // Serial per peer; a slow receiver gets no retry pile-up.
                for message in batch {
                    send_message(&client, &message, attempts).await;
                }
            });
        }

        self.ids_this_round.clear();
        self.msgs_this_round.clear();
        Ok(ControlFlow::Continue(()))
    }

    async fn join_relays(&mut self) {
        while let Some(result) = self.relay_tasks.join_next().await {
            if let Err(err) = result {
                warn!("relay sender task failed: {err}");
            }
        }
    }

    fn decide_order(&self) -> Order {
        if self.orders_seen.len() == 1 && self.orders_seen.contains(&Order::Attack) {
            Order::Attack
        } else {
            Order::Retreat
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::UdpSocket;

    use super::*;

    async fn lieutenant(id: ProcessId, addrs: &[&str], num_faulty: usize) -> Lieutenant {
        let roster = Roster::new(addrs.iter().map(|addr| addr.parse().unwrap()).collect());
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        Lieutenant::new(
            listener,
            roster,
            id,
            num_faulty,
            1,
            Duration::from_millis(50),
        )
        .await
        .unwrap()
    }

    const MULTI_HOST: &[&str] = &[
        "10.1.0.10:9000",
        "10.1.0.11:9000",
        "10.1.0.12:9000",
        "10.1.0.13:9000",
    ];

    const LOOPBACK: &[&str] = &[
        "127.0.0.1:7040",
        "127.0.0.1:7041",
        "127.0.0.1:7042",
        "127.0.0.1:7043",
    ];

    fn from(host: &str) -> SocketAddr {
        format!("{host}:55555").parse().unwrap()
    }

    #[tokio::test]
    async fn validity_checks() {
        let mut l = lieutenant(1, MULTI_HOST, 2).await;

        let round0 = Message {
            round: 0,
            order: Order::Attack,
            ids: vec![0],
        };
        assert!(l.valid_message(&round0, from("10.1.0.10")));
        // Forged chain: claims to be the Commander but comes from p2's host.
        assert!(!l.valid_message(&round0, from("10.1.0.12")));

        let stale = Message {
            round: 1,
            order: Order::Attack,
            ids: vec![0, 2],
        };
        assert!(!l.valid_message(&stale, from("10.1.0.12")));

        l.round = 2;
        let check = |ids: Vec<ProcessId>, host: &str| {
            l.valid_message(
                &Message {
                    round: 2,
                    order: Order::Retreat,
                    ids,
                },
                from(host),
            )
        };
        assert!(check(vec![0, 2, 3], "10.1.0.13"));
        assert!(!check(vec![0, 3, 1], "10.1.0.11"), "own id in chain");
        assert!(!check(vec![0, 3, 3], "10.1.0.13"), "duplicate id");
        assert!(!check(vec![0, 3, 7], "10.1.0.13"), "id out of range");
        assert!(!check(vec![0, 3], "10.1.0.13"), "chain too short");
        assert!(!check(vec![2, 0, 3], "10.1.0.13"), "chain not rooted at 0");
    }

    #[tokio::test]
    async fn non_byzantine_frames_are_dropped() {
        let mut l = lieutenant(1, LOOPBACK, 1).await;
        let verdict = l
            .on_datagram(from("127.0.0.1"), &Ack { round: 0 }.encode())
            .await
            .unwrap();
        assert!(verdict.is_continue());
        assert!(l.orders_seen.is_empty());
    }

    #[tokio::test]
    async fn first_round_admits_one_message_and_advances() {
        let mut l = lieutenant(1, LOOPBACK, 1).await;
        let message = Message {
            round: 0,
            order: Order::Attack,
            ids: vec![0],
        };
        let verdict = l
            .on_datagram(from("127.0.0.1"), &message.encode())
            .await
            .unwrap();
        assert!(verdict.is_continue());
        assert_eq!(l.round, 1);
        assert!(l.orders_seen.contains(&Order::Attack));
        assert!(l.ids_this_round.is_empty());
        assert!(l.msgs_this_round.is_empty());
    }

    #[tokio::test]
    async fn replay_is_acked_every_time_but_admitted_once() {
        let mut l = lieutenant(1, LOOPBACK, 1).await;
        l.round = 1;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let from = sender.local_addr().unwrap();
        let buf = Message {
            round: 1,
            order: Order::Attack,
            ids: vec![0, 2],
        }
        .encode();

        for _ in 0..2 {
            let verdict = l.on_datagram(from, &buf).await.unwrap();
            assert!(verdict.is_continue());
        }
        assert_eq!(l.ids_this_round.len(), 1);
        assert_eq!(l.msgs_this_round.len(), 1);

        let mut reply = [0; 64];
        for _ in 0..2 {
            let (len, _) = timeout(Duration::from_secs(1), sender.recv_from(&mut reply))
                .await
                .expect("an ack per delivery")
                .unwrap();
            assert_eq!(Ack::decode(&reply[..len]), Some(Ack { round: 1 }));
        }
    }

    #[tokio::test]
    async fn last_round_completes_by_chain_count() {
        let mut l = lieutenant(1, LOOPBACK, 1).await;
        l.round = 1;
        let first = Message {
            round: 1,
            order: Order::Attack,
            ids: vec![0, 2],
        };
        let second = Message {
            round: 1,
            order: Order::Retreat,
            ids: vec![0, 3],
        };
        let verdict = l
            .on_datagram(from("127.0.0.1"), &first.encode())
            .await
            .unwrap();
        assert!(verdict.is_continue(), "one of two expected chains");
        let verdict = l
            .on_datagram(from("127.0.0.1"), &second.encode())
            .await
            .unwrap();
        assert!(verdict.is_break(), "E(4, 1) = 2 chains end round 1 of m = 1");
        assert_eq!(l.decide_order(), Order::Retreat);
    }

    #[tokio::test]
    async fn decision_is_unanimity_to_attack() {
        let mut l = lieutenant(1, LOOPBACK, 1).await;
        assert_eq!(l.decide_order(), Order::Retreat);
        l.orders_seen.insert(Order::Attack);
        assert_eq!(l.decide_order(), Order::Attack);
        l.orders_seen.insert(Order::Retreat);
        assert_eq!(l.decide_order(), Order::Retreat);
        l.orders_seen.remove(&Order::Attack);
        assert_eq!(l.decide_order(), Order::Retreat);
    }

    #[tokio::test]
    async fn timeout_waits_in_first_round_and_forces_later_rounds() {
        let mut l = lieutenant(1, LOOPBACK, 1).await;
        assert!(l.on_recv_timeout().await.unwrap().is_continue());
        assert_eq!(l.round, 0);
        l.round = 1;
        assert!(l.on_recv_timeout().await.unwrap().is_break());
    }
}
