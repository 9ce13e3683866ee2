use std::path::PathBuf;

use byzcast::{net::Listener, Commander, Config, Lieutenant, Order};
use clap::{Parser, ValueEnum};
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OrderArg {
    Attack,
    Retreat,
}

impl From<OrderArg> for Order {
    fn from(arg: OrderArg) -> Self {
        match arg {
            OrderArg::Attack => Order::Attack,
            OrderArg::Retreat => Order::Retreat,
        }
    }
}

#[derive(Parser)]
struct Cli {
    /// Deployment config shared by every process.
    #[clap(long)]
    config: PathBuf,
    /// Own position in the config's process list; 0 is the Commander.
    #[clap(long)]
    id: u32,
    /// Initial order, Commander only.
    #[clap(long, value_enum)]
    order: Option<OrderArg>,
}

#[tokio::main]
async fn main() -> byzcast::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let roster = config.resolve().await?;
    if !roster.contains(cli.id) {
        byzcast::bail!("id {} not in the {}-process roster", cli.id, roster.len());
    }

    let decision = match (cli.id, cli.order) {
        (0, Some(order)) => {
            Commander::new(
                &roster,
                order.into(),
                config.send_attempts,
                config.recv_timeout(),
            )
            .await?
            .decide()
            .await?
        }
        (0, None) => byzcast::bail!("the Commander needs --order"),
        (_, Some(_)) => byzcast::bail!("only the Commander takes --order"),
        (id, None) => {
            let listener = Listener::bind(roster.addr(id)).await?;
            Lieutenant::new(
                listener,
                roster,
                id,
                config.num_faulty,
                config.send_attempts,
                config.recv_timeout(),
            )
            .await?
            .decide()
            .await?
        }
    };
    info!("decided {decision}");
    println!("{decision}");
    Ok(())
}
