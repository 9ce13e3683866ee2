use std::{sync::Arc, time::Duration};

use tokio::task::JoinSet;
use tracing::info;

use crate::{
    codec::{Message, Order, ProcessId, COMMANDER},
    net::{send_message, Client},
    roster::Roster,
};

/// The process with id 0. Issues the initial order to every Lieutenant and
/// trivially decides on it.
#[derive(Debug)]
pub struct Commander {
    order: Order,
    send_attempts: usize,
    clients: Vec<(ProcessId, Arc<Client>)>,
}

impl Commander {
    pub async fn new(
        roster: &Roster,
        order: Order,
        send_attempts: usize,
        recv_timeout: Duration,
    ) -> crate::Result<Self> {
        let mut clients = Vec::new();
        for id in roster.lieutenants() {
            let client = Client::connect(roster.addr(id), recv_timeout).await?;
            clients.push((id, Arc::new(client)));
        }
        Ok(Self {
            order,
            send_attempts,
            clients,
        })
    }

    /// Fan the order out in parallel, one sender task per Lieutenant, so a
    /// slow peer cannot delay round-0 delivery to the others.
    pub async fn decide(self) -> crate::Result<Order> {
        let message = Message {
            round: 0,
            order: self.order,
            ids: vec![COMMANDER],
        };
        let mut senders = JoinSet::new();
        for (id, client) in self.clients {
            info!(to = id, "sending {message}");
            let message = message.clone();
            let attempts = self.send_attempts;
            senders.spawn(async move { send_message(&client, &message, attempts).await });
        }
        while senders.join_next().await.is_some() {}
        Ok(self.order)
    }
}
