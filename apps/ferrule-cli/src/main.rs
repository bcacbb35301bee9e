use std::{path::PathBuf, sync::Arc};

use {
    anyhow::{Context, Result},
    clap::{Parser, Subcommand},
    tokio::sync::mpsc,
    tracing::{info, warn},
};

use {
    ferrule_config::ClientConfig,
    ferrule_gateway::Session,
    ferrule_protocol::Event,
    ferrule_rest::{CreateMessage, Dispatcher},
};

/// Talk to the chat API from the command line.
///
/// The bot token comes from the config file or the `FERRULE_TOKEN`
/// environment variable.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Path to a TOML client config.
    #[arg(long, env = "FERRULE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the gateway and log every dispatched event until Ctrl-C.
    Gateway {
        /// Override the configured intents bitfield.
        #[arg(long)]
        intents: Option<u64>,

        /// Print event payloads, not just their names.
        #[arg(long)]
        payloads: bool,
    },
    /// Show the bot user behind the token.
    Whoami,
    /// Post a message to a channel.
    Send {
        #[arg(long)]
        channel: String,
        content: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => {
            let mut config = ClientConfig::default();
            config.apply_env();
            config.validate().context("invalid config")?;
            Ok(config)
        },
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let mut config = load_config(args.config.as_ref())?;
    match args.command {
        Command::Gateway { intents, payloads } => {
            if let Some(intents) = intents {
                config.gateway.intents = intents;
            }
            run_gateway(config, payloads).await
        },
        Command::Whoami => {
            let rest = Dispatcher::new(&config).context("failed to build HTTP client")?;
            let user = rest.get_current_user().await.context("GET /users/@me")?;
            println!("{} ({}){}", user.username, user.id, if user.bot { " [bot]" } else { "" });
            Ok(())
        },
        Command::Send { channel, content } => {
            let rest = Dispatcher::new(&config).context("failed to build HTTP client")?;
            let message = rest
                .create_message(&channel, &CreateMessage::new(content))
                .await
                .context("failed to send message")?;
            info!(id = %message.id, channel = %message.channel_id, "message sent");
            Ok(())
        },
    }
}

async fn run_gateway(config: ClientConfig, payloads: bool) -> Result<()> {
    let rest = Arc::new(Dispatcher::new(&config).context("failed to build HTTP client")?);
    let (tx, mut events) = mpsc::unbounded_channel::<Event>();
    let session = Session::new(config, rest, tx);

    session.connect().await.context("gateway connect failed")?;
    info!(session_id = ?session.session_id(), "connected; press Ctrl-C to disconnect");

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if payloads {
                info!(event = %event.name, seq = ?event.sequence, data = %event.data, "dispatch");
            } else {
                info!(event = %event.name, seq = ?event.sequence, "dispatch");
            }
        }
    });

    let wait = session.wait();
    tokio::pin!(wait);
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("disconnecting");
            session.disconnect().await.context("disconnect failed")?;
            (&mut wait).await
        },
        outcome = &mut wait => outcome,
    };

    printer.abort();
    if let Err(err) = &outcome {
        warn!(error = %err, close_code = ?err.close_code(), "gateway session ended with an error");
    }
    outcome.context("gateway session failed")
}
