use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use wirehub_backplane::{Backplane, BackplaneConfig, ClientConnection};
use wirehub_bus::MemoryBusHub;
use wirehub_core::ids::{ConnectionId, GroupName, UserId};

/// Run an in-process demo cluster: several simulated server processes share
/// one memory bus, and every send variant is exercised across them.
#[derive(Parser, Debug)]
#[command(name = "wirehub")]
struct Args {
    /// Simulated server processes.
    #[arg(long, default_value_t = 2)]
    nodes: usize,

    /// Connections attached to each node.
    #[arg(long, default_value_t = 3)]
    connections: usize,

    /// Broadcast rounds to send.
    #[arg(long, default_value_t = 5)]
    rounds: u32,
}

struct DemoConnection {
    node: usize,
    conn: Arc<ClientConnection>,
    delivered: Arc<AtomicUsize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.nodes >= 1, "need at least one node");
    anyhow::ensure!(args.connections >= 1, "need at least one connection per node");

    let hub = MemoryBusHub::new();
    let config = BackplaneConfig {
        ack_timeout: Duration::from_millis(500),
        ..Default::default()
    };

    let mut nodes = Vec::new();
    for _ in 0..args.nodes {
        nodes.push(Backplane::start("demo", hub.client(), config.clone()).await?);
    }
    tracing::info!(nodes = args.nodes, "cluster up");

    // Attach connections. The first connection on every node shares a user,
    // so user sends fan out across processes.
    let mut attached = Vec::new();
    for (n, node) in nodes.iter().enumerate() {
        for c in 0..args.connections {
            let id = ConnectionId::new(format!("n{n}-c{c}"));
            let user = (c == 0).then(|| UserId::new("user-0"));
            let (conn, mut rx) = ClientConnection::new(id, user, config.delivery_queue);
            node.on_connected(&conn).await?;

            let delivered = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&delivered);
            tokio::spawn(async move {
                while let Some(call) = rx.recv().await {
                    counter.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(method = %call.method, "delivered");
                }
            });
            attached.push(DemoConnection {
                node: n,
                conn,
                delivered,
            });
        }
    }

    // Group membership: local joins on node 0, plus a cross-node join issued
    // by a process that does not own the connection.
    let ops = GroupName::new("ops");
    nodes[0].add_to_group(&ConnectionId::new("n0-c0"), &ops).await?;
    if args.nodes > 1 {
        nodes[0].add_to_group(&ConnectionId::new("n1-c0"), &ops).await?;
    }

    let payload = |round: u32| -> anyhow::Result<Vec<Vec<u8>>> {
        Ok(vec![serde_json::to_vec(&serde_json::json!({ "round": round }))?])
    };

    for round in 0..args.rounds {
        let sender = &nodes[round as usize % nodes.len()];
        sender.send_all("tick", payload(round)?).await?;
        sender.send_group(&ops, "ops-tick", payload(round)?).await?;
        sender.send_user(&UserId::new("user-0"), "nudge", payload(round)?).await?;
    }

    // Targeted, multi-target, and exclusion variants.
    nodes[0]
        .send_connection(&ConnectionId::new("n0-c0"), "direct", payload(0)?)
        .await?;
    nodes[0]
        .send_connections(
            &[ConnectionId::new("n0-c0"), ConnectionId::new("n0-c1")],
            "direct-pair",
            payload(0)?,
        )
        .await?;
    nodes[0]
        .send_groups(&[ops.clone()], "ops-roundup", payload(0)?)
        .await?;
    nodes[0]
        .send_group_except(&ops, "ops-others", payload(0)?, &[ConnectionId::new("n0-c0")])
        .await?;
    nodes[0]
        .send_users(&[UserId::new("user-0")], "nudge-all", payload(0)?)
        .await?;
    nodes[0]
        .send_all_except("tick-except", payload(0)?, &[ConnectionId::new("n0-c0")])
        .await?;

    tokio::time::sleep(Duration::from_millis(200)).await;

    for node in &nodes {
        tracing::info!(
            server = %node.server_name(),
            connections = node.connection_count(),
            user_0_connections = node.connections_for_user(&UserId::new("user-0")),
            "node state"
        );
    }
    for DemoConnection {
        node,
        conn,
        delivered,
    } in &attached
    {
        tracing::info!(
            node = *node,
            connection = %conn.id(),
            groups = ?conn.groups().iter().map(|g| g.as_str().to_owned()).collect::<Vec<_>>(),
            delivered = delivered.load(Ordering::Relaxed),
            "connection state"
        );
    }

    for demo in &attached {
        nodes[demo.node].on_disconnected(&demo.conn).await;
    }
    for node in nodes {
        node.shutdown().await;
    }
    tracing::info!("cluster down");
    Ok(())
}
