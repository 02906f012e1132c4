mod input;
mod render;

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use parley_api::{ApiError, HttpChatApi};
use parley_core::config::{self, Config};
use parley_core::event::{BroadcastEventBus, EventBus};
use parley_core::session::{FileSessionStore, SessionError, SessionStore};
use parley_core::{ParleyError, Session};
use parley_sync::{Command, SyncEngine, SyncError};

use crate::input::{HELP, Input, parse_line};

const EMAIL_ENV_VAR: &str = "PARLEY_EMAIL";
const PASSWORD_ENV_VAR: &str = "PARLEY_PASSWORD";

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("api error: {0}")]
    Api(#[from] ApiError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("event bus error: {0}")]
    EventBus(#[from] ParleyError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    let config = match config::load_config() {
        Ok(config) => config,
        Err(error) => {
            init_tracing("info");
            error!(%error, "failed to load configuration");
            std::process::exit(2);
        }
    };
    init_tracing(&config.logging.level);

    if let Err(error) = run(config).await {
        error!(%error, "parley exited with an error");
        std::process::exit(1);
    }
}

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config: Config) -> Result<(), CliError> {
    let store: Arc<dyn SessionStore> = Arc::new(match &config.storage.session_path {
        Some(path) => FileSessionStore::new(path),
        None => FileSessionStore::in_data_dir()?,
    });
    let api = HttpChatApi::from_config(&config.server)?;
    let mut stdin = BufReader::new(tokio::io::stdin());

    let session = match store.load()? {
        Some(session) => {
            info!(user_id = %session.user_id, "restored saved session");
            session
        }
        None => {
            let session = login(&api, &mut stdin).await?;
            store.save(&session)?;
            session
        }
    };
    let self_id = session.user_id.clone();

    let event_bus: Arc<dyn EventBus> =
        Arc::new(BroadcastEventBus::new(config.event_bus.channel_capacity));
    let mut events = event_bus
        .subscribe("{sync,system,ui}.**")
        .map_err(ParleyError::from)?;

    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(line) = render::render(&event, &self_id) {
                        let _ = stdout.write_all(format!("{line}\n").as_bytes()).await;
                        let _ = stdout.flush().await;
                    }
                }
                Err(parley_core::error::EventBusError::Lagged(count)) => {
                    warn!(count, "terminal output lagged, some events dropped");
                }
                Err(_) => break,
            }
        }
    });

    let (commands, receiver) = mpsc::unbounded_channel();
    let _ = commands.send(Command::Connect);
    eprintln!("{HELP}");
    tokio::spawn(read_commands(stdin, commands));

    let mut engine: SyncEngine<HttpChatApi> =
        SyncEngine::new(session, &config, api, event_bus).with_session_store(store);
    engine.run(receiver).await?;

    info!("goodbye");
    Ok(())
}

/// Forwards parsed input lines to the engine until EOF, `/quit` or `/logout`.
async fn read_commands<R>(input: R, commands: mpsc::UnboundedSender<Command>)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "failed to read input");
                break;
            }
        };

        match parse_line(&line) {
            Input::Command(command) => {
                let stop = command == Command::Logout;
                if commands.send(command).is_err() || stop {
                    break;
                }
            }
            Input::Help => eprintln!("{HELP}"),
            Input::Quit => break,
            Input::Ignored => {}
        }
    }
}

/// Logs in with `PARLEY_EMAIL`/`PARLEY_PASSWORD`, prompting for whichever
/// is missing.
async fn login<R>(api: &HttpChatApi, input: &mut R) -> Result<Session, CliError>
where
    R: AsyncBufRead + Unpin,
{
    let email = match std::env::var(EMAIL_ENV_VAR) {
        Ok(email) => email,
        Err(_) => prompt(input, "email: ").await?,
    };
    let password = match std::env::var(PASSWORD_ENV_VAR) {
        Ok(password) => password,
        Err(_) => prompt(input, "password: ").await?,
    };

    let session = api.login(email.trim(), &password).await?;
    info!(user_id = %session.user_id, "logged in as {}", session.user_name);
    Ok(session)
}

async fn prompt<R>(input: &mut R, label: &str) -> Result<String, CliError>
where
    R: AsyncBufRead + Unpin,
{
    let mut stderr = tokio::io::stderr();
    stderr.write_all(label.as_bytes()).await?;
    stderr.flush().await?;

    let mut line = String::new();
    input.read_line(&mut line).await?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
