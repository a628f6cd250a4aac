use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use wsmqtt::mqtt::WebSocketTransport;
use wsmqtt::{ClientSettings, ConnectRequest, MqttHandle, QoS, TomlConfigStore};

const SETTINGS_FILE: &str = ".config/wsmqtt/settings.toml";

/// `wsmqtt [host port [topic...]]`
///
/// Without arguments the last successfully used broker is reconnected.
#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let settings = ClientSettings::load(&settings_path())?;
    let client = MqttHandle::spawn(
        settings,
        Arc::new(WebSocketTransport),
        Arc::new(TomlConfigStore::default_location()),
    );

    client.set_error_listener(|message, title| error!("{}: {}", title, message));
    let mut messages = client.message_channel(100);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let topics = match args.as_slice() {
        [] => {
            info!("No broker given, reconnecting to the saved one");
            client.reconnect().await?;
            Vec::new()
        }
        [host, port, topics @ ..] => {
            let port: u16 = port
                .parse()
                .map_err(|e| eyre!("Invalid port {}: {}", port, e))?;
            client.connect(ConnectRequest::new(host.as_str(), port)).await?;
            topics.to_vec()
        }
        [_] => return Err(eyre!("Usage: wsmqtt [host port [topic...]]")),
    };

    for topic in &topics {
        client.subscribe(topic.as_str(), QoS::AtMostOnce).await?;
    }

    match client.test_connection().await {
        Ok(payload) => info!("Sent test message {}", payload),
        Err(e) => warn!("Test message failed: {}", e),
    }

    info!("Listening, press Ctrl-C to quit");
    loop {
        tokio::select! {
            Some(msg) = messages.recv() => info!("{}", msg),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect().await?;
    info!("Bye");
    Ok(())
}

fn settings_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(SETTINGS_FILE);
    path
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
