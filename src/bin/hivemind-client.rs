//! A thin CLI front-end exercising the public client API end to end:
//! inject utterances interactively, or fire a single message at the hive.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hivemind_bus_client::config::ClientConfig;
use hivemind_bus_client::envelope::{BusMessage, Envelope, HiveMessageType, Payload};
use hivemind_bus_client::identity::NodeIdentity;
use hivemind_bus_client::{HiveClient, HiveError};

#[derive(Parser)]
#[command(name = "hivemind-client", version, about = "HiveMind bus client CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ConnectArgs {
    /// HiveMind access key
    #[arg(long)]
    key: String,
    /// HiveMind host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// HiveMind port number
    #[arg(long, default_value_t = 5678)]
    port: u16,
}

#[derive(clap::Args)]
struct SendArgs {
    #[command(flatten)]
    connect: ConnectArgs,
    /// message bus type to inject
    #[arg(long)]
    msg: String,
    /// message json payload
    #[arg(long, default_value = "{}")]
    payload: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive terminal: inject utterances and print speech.
    Terminal(ConnectArgs),
    /// Send a single bus message.
    SendMycroft(SendArgs),
    /// Escalate a single message upstream.
    Escalate(SendArgs),
    /// Propagate a single message across the hive.
    Propagate(SendArgs),
}

fn build_config(args: &ConnectArgs) -> ClientConfig {
    let mut config = ClientConfig::new(args.key.clone());
    config.transport.host = args.host.clone();
    config.transport.port = args.port;
    config
}

fn parse_payload(payload: &str) -> Result<BTreeMap<String, Value>, ExitCode> {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(_) => {
            error!("--payload must be a JSON object");
            Err(ExitCode::from(1))
        }
        Err(e) => {
            error!(error = %e, "--payload is not valid JSON");
            Err(ExitCode::from(1))
        }
    }
}

async fn connect(config: &ClientConfig) -> Result<Arc<HiveClient>, ExitCode> {
    let identity = NodeIdentity::load().unwrap_or_else(|e| {
        error!(error = %e, "failed to load identity, continuing unauthenticated");
        NodeIdentity::load_from(&std::env::temp_dir().join("hivemind-cli-identity.json"))
            .expect("temp identity path is always writable")
    });

    let client = Arc::new(HiveClient::new(config, &identity, None));
    match client.connect(config.protocol.handshake_deadline).await {
        Ok(()) => {
            println!("== connected to HiveMind");
            Ok(client)
        }
        Err(e @ HiveError::HandshakeTimeout(_)) => {
            error!(error = %e, "handshake timed out");
            Err(ExitCode::from(2))
        }
        Err(e) => {
            error!(error = %e, "failed to connect");
            Err(ExitCode::from(2))
        }
    }
}

async fn run_terminal(args: ConnectArgs) -> ExitCode {
    let config = build_config(&args);
    let client = match connect(&config).await {
        Ok(c) => c,
        Err(code) => return code,
    };

    client.on("message", |envelope: &Envelope| {
        if let Some(bus) = envelope.payload.as_bus() {
            if let Some(Value::String(utt)) = bus.data.get("utterance") {
                println!("> {utt}");
            }
        }
    });

    let stdin = io::stdin();
    loop {
        print!("Utterance: ");
        if io::stdout().flush().is_err() {
            break;
        }
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(_) => break,
        }
        let utt = line.trim();
        if utt.is_empty() {
            continue;
        }
        let mut data = BTreeMap::new();
        data.insert("utterance".to_string(), Value::String(utt.to_string()));
        let msg = BusMessage::new("recognizer_loop:utterance").with_data(data);
        if let Err(e) = client.emit_bus(msg).await {
            error!(error = %e, "failed to send utterance");
        }
    }

    client.close().await;
    ExitCode::SUCCESS
}

async fn run_send(args: SendArgs, msg_type: HiveMessageType) -> ExitCode {
    let config = build_config(&args.connect);
    let data = match parse_payload(&args.payload) {
        Ok(d) => d,
        Err(code) => return code,
    };

    let client = match connect(&config).await {
        Ok(c) => c,
        Err(code) => return code,
    };

    let bus_msg = BusMessage::new(args.msg.clone()).with_data(data);
    let envelope = Envelope::new(msg_type, Payload::Bus(bus_msg));
    let result = client.emit(envelope).await;
    client.close().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "failed to send message");
            ExitCode::from(2)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    info!("hivemind-client starting");

    match cli.command {
        Commands::Terminal(args) => run_terminal(args).await,
        Commands::SendMycroft(args) => run_send(args, HiveMessageType::Bus).await,
        Commands::Escalate(args) => run_send(args, HiveMessageType::Escalate).await,
        Commands::Propagate(args) => run_send(args, HiveMessageType::Propagate).await,
    }
}
