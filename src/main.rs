//! eve-forwarder - forwards a local event log stream to IoT Hub
//!
//! Listens on a Unix stream socket and sends what writers push into it as
//! device-to-cloud messages, either one message per line or one
//! `{"eve_log":[...]}` batch per connection close or read timeout.

use clap::{Parser, Subcommand};
use iothub_mqtt::config::{DeviceConfig, DeviceIdentity, ForwarderSection, SessionOptions};
use iothub_mqtt::observability::init_default_logging;
use iothub_mqtt::transport::mqtt::{MqttTransport, RumqttWire, TRUSTED_CERTS_OPTION};
use iothub_mqtt::transport::Transport;
use iothub_mqtt::{DeviceClient, Message, SendResult};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::{signal, time};
use tracing::{debug, error, info, warn};

/// Outbound payloads buffered between socket readers and the session
const PAYLOAD_CHANNEL_CAPACITY: usize = 1024;

/// Property attached to every forwarded message
const SEQUENCE_PROPERTY: &str = "PropName";

/// Forward a local event log to Azure IoT Hub
#[derive(Parser)]
#[command(name = "eve-forwarder")]
#[command(about = "Forward a local event log stream to Azure IoT Hub over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "EVE_FORWARDER_CONFIG")]
    config: Option<PathBuf>,

    /// Device connection string; replaces the [device] and [hub] sections
    #[arg(long, env = "IOTHUB_DEVICE_CONNECTION_STRING", hide_env_values = true)]
    connection_string: Option<String>,

    /// Unix socket to listen on
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Send one JSON batch per connection instead of one message per line
    #[arg(short, long)]
    batch: bool,

    /// Subscribe to cloud-to-device messages
    #[arg(short, long)]
    receive: bool,

    /// PEM file with the hub's trusted root certificates
    #[arg(long, value_name = "FILE")]
    trusted_certs: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward events until interrupted (default)
    Run,
    /// Validate configuration
    Config {
        /// Show the resolved configuration
        #[arg(long)]
        show: bool,
    },
}

/// Everything the forwarder needs once flags and files are merged
struct Settings {
    identity: DeviceIdentity,
    session: SessionOptions,
    forwarder: ForwarderSection,
    trusted_certs: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting eve-forwarder v{}", env!("CARGO_PKG_VERSION"));

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_forwarder(settings).await,
        Commands::Config { show } => {
            handle_config_command(&settings, show);
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Forwarder shutdown complete");
}

fn load_settings(cli: &Cli) -> Result<Settings, Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Some(DeviceConfig::load_from_file(path)?)
        }
        None => find_default_config()?,
    };

    let identity = match (&cli.connection_string, &config) {
        (Some(connection_string), _) => DeviceIdentity::from_connection_string(connection_string)?,
        (None, Some(config)) => config.identity()?,
        (None, None) => {
            return Err(
                "no configuration file found; pass --config or --connection-string".into(),
            )
        }
    };

    let mut session = config
        .as_ref()
        .map(DeviceConfig::session_options)
        .unwrap_or_default();
    session.receive_messages |= cli.receive;

    let mut forwarder = config.map(|c| c.forwarder).unwrap_or_default();
    if let Some(socket) = &cli.socket {
        forwarder.socket_path = socket.clone();
    }
    forwarder.batch |= cli.batch;

    Ok(Settings {
        identity,
        session,
        forwarder,
        trusted_certs: cli.trusted_certs.clone(),
    })
}

fn find_default_config() -> Result<Option<DeviceConfig>, Box<dyn std::error::Error>> {
    for path_str in ["eve-forwarder.toml", "config/eve-forwarder.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(Some(DeviceConfig::load_from_file(&path)?));
        }
    }
    Ok(None)
}

fn handle_config_command(settings: &Settings, show: bool) {
    if show {
        println!("device:    {}", settings.identity.device_id);
        println!("host:      {}:{}", settings.identity.host_name(), settings.identity.port);
        println!("keepalive: {}s", settings.session.keepalive_secs);
        println!(
            "resend:    {}s, {} retries",
            settings.session.resend_timeout.as_secs(),
            settings.session.max_send_retries
        );
        println!("receive:   {}", settings.session.receive_messages);
        println!("socket:    {}", settings.forwarder.socket_path.display());
        println!("batch:     {}", settings.forwarder.batch);
    }
    info!("Configuration is valid");
}

async fn run_forwarder(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let Settings {
        identity,
        session,
        forwarder,
        trusted_certs,
    } = settings;

    let device_id = identity.device_id.clone();
    let device_key = identity.device_key.clone();
    let receive = session.receive_messages;

    let wire = RumqttWire::new(Handle::current());
    let mut transport: Box<dyn Transport> =
        Box::new(MqttTransport::new(identity, session, wire)?);
    transport.register(&device_id, &device_key)?;
    if let Some(path) = trusted_certs {
        let pem = std::fs::read_to_string(&path)?;
        transport.set_option(TRUSTED_CERTS_OPTION, pem.into())?;
    }
    if receive {
        transport.subscribe()?;
    }

    let listener = bind_socket(&forwarder.socket_path)?;
    info!(
        socket = %forwarder.socket_path.display(),
        batch = forwarder.batch,
        "Forwarder is listening"
    );

    let (payload_tx, mut payload_rx) = mpsc::channel::<String>(PAYLOAD_CHANNEL_CAPACITY);
    let read_timeout = Duration::from_secs(forwarder.read_timeout_secs);
    let mut poll = time::interval(Duration::from_millis(forwarder.poll_interval_ms.max(1)));
    let mut client = DeviceClient::new();
    let mut sequence: u64 = 0;
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(forward_connection(
                        stream,
                        payload_tx.clone(),
                        forwarder.batch,
                        read_timeout,
                    ));
                }
                Err(e) => warn!(error = %e, "Failed to accept socket connection"),
            },
            Some(payload) = payload_rx.recv() => {
                sequence += 1;
                let tracking_id = client.send_event(sequenced_message(payload, sequence));
                debug!(tracking_id, sequence, "Queued event");
            }
            _ = poll.tick() => {
                transport.do_work(&mut client);
                report(&mut client);
            }
        }
    }

    transport.destroy(&mut client);
    report(&mut client);
    if let Err(e) = std::fs::remove_file(&forwarder.socket_path) {
        debug!(error = %e, "Socket already removed");
    }
    Ok(())
}

fn bind_socket(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        debug!(socket = %path.display(), "Removing stale socket");
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}

/// Read one writer's stream and hand its payloads to the session loop
async fn forward_connection(
    stream: UnixStream,
    payloads: mpsc::Sender<String>,
    batch: bool,
    read_timeout: Duration,
) {
    let mut lines = BufReader::new(stream).lines();
    let mut pending: Vec<String> = Vec::new();

    loop {
        match time::timeout(read_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if line.trim().is_empty() {
                    continue;
                }
                if batch {
                    pending.push(line);
                } else if payloads.send(line).await.is_err() {
                    return;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                warn!(error = %e, "Socket read failed");
                break;
            }
            Err(_) => {
                if !pending.is_empty() && payloads.send(batch_payload(&pending)).await.is_err() {
                    return;
                }
                pending.clear();
            }
        }
    }

    if !pending.is_empty() {
        // the session loop may already be shutting down
        let _ = payloads.send(batch_payload(&pending)).await;
    }
}

/// `{"eve_log":[...]}` with each line kept as JSON when it parses
fn batch_payload(lines: &[String]) -> String {
    let entries: Vec<Value> = lines
        .iter()
        .map(|line| serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.clone())))
        .collect();
    json!({ "eve_log": entries }).to_string()
}

fn sequenced_message(payload: String, sequence: u64) -> Message {
    Message::from_text(payload).with_property(SEQUENCE_PROPERTY, format!("PropMsg_{sequence}"))
}

fn report(client: &mut DeviceClient) {
    for (tracking_id, result) in client.take_confirmations() {
        match result {
            SendResult::Success => info!(tracking_id, "Event confirmed"),
            SendResult::Failed(reason) => warn!(tracking_id, ?reason, "Event failed"),
        }
    }
    for message in client.take_received() {
        info!(
            bytes = message.payload().len(),
            properties = message.properties().len(),
            "Cloud-to-device message received"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_payload_keeps_json_lines() {
        let lines = vec![
            r#"{"event_type":"alert"}"#.to_string(),
            "not json".to_string(),
        ];
        let payload: Value = serde_json::from_str(&batch_payload(&lines)).unwrap();

        assert_eq!(payload["eve_log"][0]["event_type"], "alert");
        assert_eq!(payload["eve_log"][1], "not json");
    }

    #[test]
    fn test_sequenced_message_property() {
        let message = sequenced_message("line".to_string(), 3);
        assert_eq!(message.properties().get("PropName"), Some("PropMsg_3"));
        assert_eq!(message.payload(), b"line");
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from([
            "eve-forwarder",
            "--connection-string",
            "HostName=myhub.azure-devices.net;DeviceId=dev1;SharedAccessKey=a2V5MQ==",
            "--socket",
            "/tmp/eve.sock",
            "--batch",
        ]);
        let settings = load_settings(&cli).unwrap();

        assert_eq!(settings.identity.device_id, "dev1");
        assert_eq!(settings.forwarder.socket_path, PathBuf::from("/tmp/eve.sock"));
        assert!(settings.forwarder.batch);
        assert!(!settings.session.receive_messages);
    }
}
