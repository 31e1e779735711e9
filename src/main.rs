use callwave::calls::media::webrtc::{WebRtcNegotiatorConfig, WebRtcNegotiatorFactory};
use callwave::calls::{CallManager, NoMediaSource, RemoteEndPolicy};
use callwave::socket::WebSocketRelayFactory;
use callwave::types::events::EventBus;
use callwave::{Client, ClientConfig};
use chrono::Local;
use clap::Parser;
use log::{error, info};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

// Terminal front end for a single call.
//
// Usage:
//   cargo run -- --name Alice                       # relay from $CALLWAVE_RELAY_URL or localhost:5000
//   cargo run -- -s https://relay.example.com -n Bob
//   cargo run -- --ice-server stun:stun.example.com:3478

#[derive(Parser, Debug)]
#[command(name = "callwave", about = "One-to-one call client")]
struct Args {
    /// Signaling server base url
    #[arg(short, long)]
    server: Option<String>,

    /// Display name shown to the callee
    #[arg(short, long)]
    name: Option<String>,

    /// Reconnect to the relay (new id) when the peer ends the call
    #[arg(long)]
    reconnect_on_remote_end: bool,

    /// STUN/TURN server url; may be repeated
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,
}

const HELP: &str = "commands: name <name> | call <id> | answer | hangup | status | id | quit";

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async {
        if let Err(e) = run(args).await {
            error!("{e:#}");
        }
    });
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let mut config = ClientConfig::from_env();
    if let Some(server) = args.server {
        config.relay.url = server;
    }
    if let Some(name) = args.name {
        config.display_name = Some(name);
    }
    if args.reconnect_on_remote_end {
        config.calls.remote_end_policy = RemoteEndPolicy::Reconnect;
    }
    if !args.ice_servers.is_empty() {
        config.ice_servers = args.ice_servers;
    }

    let negotiators = Arc::new(WebRtcNegotiatorFactory::new(WebRtcNegotiatorConfig {
        ice_servers: config.ice_servers.clone(),
        ..Default::default()
    }));
    let relays = WebSocketRelayFactory::new(config.relay.clone());

    let (client, events) =
        Client::connect(config, &relays, negotiators, Arc::new(NoMediaSource)).await?;
    client.acquire_local_media().await;
    spawn_event_printer(client.event_bus());

    let runner = tokio::spawn({
        let client = client.clone();
        async move { client.run(events).await }
    });

    println!("{HELP}");
    read_commands(client.calls()).await;

    client.disconnect().await;
    let _ = runner.await;
    info!("Bye.");
    Ok(())
}

async fn read_commands(calls: &CallManager) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let (command, arg) = match line.split_once(' ') {
            Some((command, arg)) => (command, arg.trim()),
            None => (line, ""),
        };

        let result = match command {
            "" => continue,
            "quit" | "exit" => break,
            "name" => calls.set_display_name(arg).await,
            "call" => calls.initiate_call(arg).await,
            "answer" => calls.answer_incoming_call().await,
            "hangup" => calls.hang_up().await,
            "id" => calls.shareable_id().await.map(|id| println!("your id: {id}")),
            "status" => {
                let snapshot = calls.snapshot().await;
                println!(
                    "id={} name={:?} state={} peer={} ({})",
                    snapshot.local_id.as_deref().unwrap_or("-"),
                    snapshot.display_name,
                    snapshot.state.kind(),
                    snapshot.peer_id.as_deref().unwrap_or("-"),
                    snapshot.peer_display_name.as_deref().unwrap_or("-"),
                );
                Ok(())
            }
            _ => {
                println!("{HELP}");
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("error: {e}");
        }
    }
}

fn spawn_event_printer(bus: &Arc<EventBus>) {
    let mut states = bus.state_changed.subscribe();
    let mut incoming = bus.incoming_call.subscribe();
    let mut errors = bus.call_error.subscribe();
    let mut ids = bus.local_id.subscribe();
    let mut streams = bus.remote_stream.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = states.recv() => match changed {
                    Ok(changed) => println!(
                        "state: {} {}",
                        changed.state.kind(),
                        changed.peer_display_name.as_deref().unwrap_or("")
                    ),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                call = incoming.recv() => if let Ok(call) = call {
                    println!("{} is calling; type `answer` to pick up", call.name);
                },
                raised = errors.recv() => if let Ok(raised) = raised {
                    println!("error: {}", raised.error);
                },
                assigned = ids.recv() => if let Ok(assigned) = assigned {
                    println!("your id: {}", assigned.id);
                },
                ready = streams.recv() => if let Ok(ready) = ready {
                    println!("remote media: {} track(s)", ready.stream.tracks().len());
                },
            }
        }
    });
}
