use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use zeroconf_chat::shutdown::stop_signal;
use zeroconf_chat::{MdnsDiscovery, PresenceStatus, ProviderConfig, ProviderEvent, ZeroconfProvider};

/// Zeroconf chat: link-local presence and messaging over Bonjour.
///
/// Reads commands from stdin and prints every event as one JSON line.
#[derive(Parser, Debug)]
#[command(name = "zeroconf-chat", version, about)]
struct Cli {
    /// JSON config file. Missing is fine; command-line flags win over it.
    #[arg(long, default_value = "zeroconf-chat.json", env = "ZEROCONF_CHAT_CONFIG")]
    config: PathBuf,

    /// Announced identifier, e.g. `mulder@laptop`.
    #[arg(long, env = "ZEROCONF_CHAT_ID")]
    id: Option<String>,

    #[arg(long, env = "ZEROCONF_CHAT_FIRST_NAME")]
    first_name: Option<String>,

    #[arg(long, env = "ZEROCONF_CHAT_LAST_NAME")]
    last_name: Option<String>,

    #[arg(long, env = "ZEROCONF_CHAT_EMAIL")]
    email: Option<String>,

    #[arg(long, env = "ZEROCONF_CHAT_MESSAGE")]
    status_message: Option<String>,

    /// Preferred chat port.
    #[arg(long, env = "ZEROCONF_CHAT_PORT")]
    port: Option<u16>,

    /// Status to start in: avail, dnd, invisible or offline.
    #[arg(long, env = "ZEROCONF_CHAT_STATUS")]
    status: Option<PresenceStatus>,

    /// Also write logs to a daily rolling file in this directory.
    #[arg(long, env = "ZEROCONF_CHAT_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

impl Cli {
    fn provider_config(&self) -> Result<ProviderConfig> {
        let mut config = ProviderConfig::load(&self.config)
            .with_context(|| format!("failed to load {}", self.config.display()))?;
        let overrides = [
            (&self.id, &mut config.account_id),
            (&self.first_name, &mut config.first_name),
            (&self.last_name, &mut config.last_name),
            (&self.email, &mut config.email),
            (&self.status_message, &mut config.status_message),
        ];
        for (flag, field) in overrides {
            if let Some(value) = flag {
                *field = value.clone();
            }
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(status) = self.status {
            config.initial_status = status;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli);

    let config = cli.provider_config()?;
    let discovery = Arc::new(MdnsDiscovery::new().context("failed to start mDNS")?);
    let provider = ZeroconfProvider::new(&config, discovery.clone());
    tracing::info!(id = provider.id(), addr = %discovery.local_address(), "starting");

    tokio::spawn(print_events(provider.subscribe()));
    provider.start().await.context("failed to go online")?;

    tokio::select! {
        signal = stop_signal() => {
            let signal = signal?;
            tracing::info!(%signal, "stopping");
        }
        result = command_loop(&provider) => result?,
    }

    provider.shutdown().await?;
    discovery.shutdown().await;
    Ok(())
}

fn init_tracing(cli: &Cli) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, guard) = match &cli.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "zeroconf-chat.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

async fn print_events(mut events: broadcast::Receiver<ProviderEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "couldn't encode event"),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "event printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

const HELP: &str = "commands: /msg <id> <text> | /typing <id> | /status <avail|dnd|invisible|offline> | /note <text> | /peers | /forget <id> | /quit";

/// Returns when stdin closes or on `/quit`.
async fn command_loop(provider: &ZeroconfProvider) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let outcome = match command {
            "/quit" => break,
            "/msg" => match rest.split_once(' ') {
                Some((id, text)) => provider.send_message(id, text).map(|_| ()),
                None => {
                    eprintln!("usage: /msg <id> <text>");
                    Ok(())
                }
            },
            "/typing" => provider.send_typing(rest),
            "/status" => match rest.parse::<PresenceStatus>() {
                Ok(status) => provider.change_status(status).await,
                Err(e) => {
                    eprintln!("{e}");
                    Ok(())
                }
            },
            "/note" => provider.set_status_message(rest),
            "/peers" => {
                for peer in provider.peers() {
                    println!("{}", serde_json::to_string(&peer)?);
                }
                Ok(())
            }
            "/forget" => provider.unsubscribe(rest).map(|_| ()),
            _ => {
                eprintln!("{HELP}");
                Ok(())
            }
        };
        if let Err(e) = outcome {
            tracing::warn!(command, error = %e, "command failed");
        }
    }
    Ok(())
}
