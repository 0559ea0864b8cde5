use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use projects_sdk::api::{ChatApi, MeasurementApi, default_policy};
use projects_sdk::{Request, SdkConfig, SdkError, SessionManager};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing stream url; pass --stream-url or set PROJECTS_SDK_STREAM_URL")]
    MissingStreamUrl,
    #[error("missing http url; pass --http-url or set PROJECTS_SDK_HTTP_URL")]
    MissingHttpUrl,
    #[error(transparent)]
    Sdk(#[from] SdkError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("failed to read {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
}

#[derive(Parser, Debug)]
#[command(name = "projects-cli", about = "Projects SDK streaming and HTTP CLI")]
struct Cli {
    #[arg(long, env = "PROJECTS_SDK_STREAM_URL")]
    stream_url: Option<String>,

    #[arg(long, env = "PROJECTS_SDK_HTTP_URL")]
    http_url: Option<String>,

    #[arg(long, env = "PROJECTS_SDK_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect the streaming channel and report the session.
    Ping,
    /// Issue one request by route name.
    Call {
        route: String,
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Open a request-stream and print items as JSON lines.
    Subscribe {
        route: String,
        #[arg(long, default_value = "{}")]
        data: String,
        #[arg(long, help = "Stop after this many items")]
        max_items: Option<usize>,
    },
    Chats(ChatsCommand),
    /// Upload a window photo for measurement.
    Measure { image: PathBuf },
}

#[derive(Args, Debug)]
struct ChatsCommand {
    #[command(subcommand)]
    command: ChatsSubcommand,
}

#[derive(Subcommand, Debug)]
enum ChatsSubcommand {
    List {
        user_id: String,
        #[arg(long, default_value_t = 0)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        size: u32,
    },
    Messages {
        chat_id: String,
        #[arg(long, default_value_t = 0)]
        page: u32,
        #[arg(long, default_value_t = 50)]
        size: u32,
    },
    Open {
        user1_id: String,
        user2_id: String,
    },
    Unread {
        chat_id: String,
        user_id: String,
    },
    HasChats {
        user_id: String,
    },
    Watch {
        chat_id: String,
        #[arg(long, help = "Stop after this many messages")]
        max_items: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = build_config(&cli)?;
    let manager = SessionManager::new(config.clone(), default_policy())?;
    let result = run(&cli, &config, &manager).await;
    manager.close().await;
    result
}

fn build_config(cli: &Cli) -> Result<SdkConfig, CliError> {
    let mut config = SdkConfig::from_env()?;
    if let Some(url) = &cli.stream_url {
        config = config.with_stream_url(url.clone());
    }
    if let Some(url) = &cli.http_url {
        config = config.with_http_base_url(url.clone());
    }
    if let Some(token) = &cli.token {
        config = config.with_auth_token(token.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: &Cli, config: &SdkConfig, manager: &SessionManager) -> Result<(), CliError> {
    match &cli.command {
        Command::Ping => {
            connect(config, manager).await?;
            let session = manager.session();
            println!("ok {} ({:?})", session.endpoint.unwrap_or_default(), session.state);
            Ok(())
        }
        Command::Call { route, data } => {
            // Streaming is optional here: HTTP-routed calls work without it.
            if config.stream_url.is_some() {
                connect(config, manager).await?;
            }
            let request = Request::new(route.clone(), parse_data(data)?);
            let response = manager.call(request).await?;
            print_json(&response.into_value())
        }
        Command::Subscribe { route, data, max_items } => {
            connect(config, manager).await?;
            let request = Request::new(route.clone(), parse_data(data)?);
            let mut subscription = manager.subscribe(request).await?;
            let mut seen = 0usize;
            while let Some(item) = subscription.next().await {
                println!("{}", serde_json::to_string(&item?)?);
                seen += 1;
                if max_items.is_some_and(|max| seen >= max) {
                    subscription.cancel();
                    break;
                }
            }
            eprintln!("received {seen} items");
            Ok(())
        }
        Command::Chats(chats) => {
            connect(config, manager).await?;
            run_chats(ChatApi::new(manager.clone()), &chats.command).await
        }
        Command::Measure { image } => {
            if config.http_base_url.is_none() {
                return Err(CliError::MissingHttpUrl);
            }
            let bytes = tokio::fs::read(image)
                .await
                .map_err(|source| CliError::ReadFile { path: image.clone(), source })?;
            let file_name = image.file_name().and_then(|n| n.to_str()).unwrap_or("window.jpg");
            let measured = MeasurementApi::new(manager.clone()).measure_window(file_name, bytes).await?;
            print_serialized(&measured)
        }
    }
}

async fn run_chats(api: ChatApi, command: &ChatsSubcommand) -> Result<(), CliError> {
    match command {
        ChatsSubcommand::List { user_id, page, size } => print_serialized(&api.user_chats(user_id, *page, *size).await?),
        ChatsSubcommand::Messages { chat_id, page, size } => {
            print_serialized(&api.chat_messages(chat_id, *page, *size).await?)
        }
        ChatsSubcommand::Open { user1_id, user2_id } => {
            print_serialized(&api.get_or_create_chat(user1_id, user2_id).await?)
        }
        ChatsSubcommand::Unread { chat_id, user_id } => {
            println!("{}", api.unread_count(chat_id, user_id).await?);
            Ok(())
        }
        ChatsSubcommand::HasChats { user_id } => {
            println!("{}", api.has_chats(user_id).await?);
            Ok(())
        }
        ChatsSubcommand::Watch { chat_id, max_items } => {
            let mut stream = api.stream_messages(chat_id).await?;
            let mut seen = 0usize;
            while let Some(message) = stream.next().await {
                println!("{}", serde_json::to_string(&message?)?);
                seen += 1;
                if max_items.is_some_and(|max| seen >= max) {
                    stream.cancel();
                    break;
                }
            }
            Ok(())
        }
    }
}

async fn connect(config: &SdkConfig, manager: &SessionManager) -> Result<(), CliError> {
    if config.stream_url.is_none() {
        return Err(CliError::MissingStreamUrl);
    }
    manager.connect_configured().await?;
    if !manager.wait_for_state(projects_sdk::SessionState::Connected, Duration::from_secs(1)).await {
        tracing::warn!(state = ?manager.state(), "session not connected after handshake");
    }
    Ok(())
}

fn parse_data(raw: &str) -> Result<Value, CliError> {
    Ok(serde_json::from_str::<Value>(raw)?)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

fn print_serialized<T: Serialize>(value: &T) -> Result<(), CliError> {
    print_json(&serde_json::to_value(value)?)
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
