use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use duet::chat::{ChatMessage, MessageBody, ReadReceipt, RoomId, UserId};
use duet::session::{FileTokenStore, SessionTokens, StoreError, TokenKey, TokenStore};
use duet::{ApiRequest, ChatChannel, ChatError, ChatHandler, ClientConfig, SessionClient, SessionError};
use serde_json::Value;
use tokio::sync::mpsc;

/// How long a one-shot publish keeps the socket open after `Connected`.
const PUBLISH_LINGER: Duration = Duration::from_millis(500);
/// Extra time beyond the fallback deadline allowed for reaching `Connected`.
const CONNECT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("token store failed: {0}")]
    Store(#[from] StoreError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("server returned HTTP {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("chat did not connect within {0:?}")]
    ConnectTimeout(Duration),
    #[error("failed to wait for ctrl-c: {0}")]
    Signal(std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "duet-cli", about = "Session API and realtime chat CLI")]
struct Cli {
    #[arg(long, env = "DUET_API_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "DUET_WS_URL")]
    ws_url: Option<String>,

    #[arg(long, env = "DUET_TOKEN_FILE", default_value = ".duet/tokens.json")]
    token_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authenticated API call with transparent token refresh.
    Api(ApiArgs),
    Token(TokenCommand),
    Chat(ChatCommand),
}

#[derive(Args, Debug)]
struct ApiArgs {
    method: String,
    path: String,
    #[arg(long, help = "JSON request body")]
    data: Option<String>,
}

#[derive(Args, Debug)]
struct TokenCommand {
    #[command(subcommand)]
    command: TokenSubcommand,
}

#[derive(Subcommand, Debug)]
enum TokenSubcommand {
    Show,
    Set {
        #[arg(long)]
        access: String,
        #[arg(long)]
        refresh: Option<String>,
    },
    Clear,
}

#[derive(Args, Debug)]
struct ChatCommand {
    #[arg(long)]
    room: RoomId,

    #[command(subcommand)]
    command: ChatSubcommand,
}

#[derive(Subcommand, Debug)]
enum ChatSubcommand {
    /// Print incoming messages and read receipts as JSON lines until ctrl-c.
    Listen,
    Send {
        #[arg(long)]
        sender: UserId,
        #[arg(required_unless_present = "image")]
        text: Option<String>,
        #[arg(long)]
        image: Option<String>,
    },
    Read {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        up_to: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env();
    if let Some(base_url) = cli.base_url {
        config.api_base_url = base_url.trim_end_matches('/').to_owned();
        config.chat.ws_url = format!("{}/ws", config.api_base_url);
    }
    if let Some(ws_url) = cli.ws_url {
        config.chat.ws_url = ws_url.trim_end_matches('/').to_owned();
    }
    let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(cli.token_file));

    match cli.command {
        Command::Api(args) => run_api(&config, store, args).await,
        Command::Token(token) => run_token(&config, store, token).await,
        Command::Chat(chat) => run_chat(&config, store, chat).await,
    }
}

async fn run_api(config: &ClientConfig, store: Arc<dyn TokenStore>, args: ApiArgs) -> Result<(), CliError> {
    let method = reqwest::Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| CliError::InvalidMethod(args.method.clone()))?;
    let client = session_client(config, store)?;

    let mut request = ApiRequest::new(method, args.path);
    if let Some(data) = args.data {
        request = request.with_json(serde_json::from_str::<Value>(&data)?);
    }

    let response = client.authenticated_request(request).await?;
    let body = response.json_or_text();
    if !response.is_success() {
        return Err(CliError::ServerError {
            status: response.status.as_u16(),
            body: body.to_string(),
        });
    }
    print_json(&body)
}

fn session_client(config: &ClientConfig, store: Arc<dyn TokenStore>) -> Result<SessionClient, CliError> {
    let client = SessionClient::with_reqwest(
        &config.api_base_url,
        store,
        Arc::new(|| eprintln!("signed out; run `token set` with fresh tokens")),
    )?;
    Ok(client)
}

async fn run_token(config: &ClientConfig, store: Arc<dyn TokenStore>, token: TokenCommand) -> Result<(), CliError> {
    match token.command {
        TokenSubcommand::Show => {
            let access = store.get(TokenKey::Access).await?;
            let refresh = store.get(TokenKey::Refresh).await?;
            print_json(&serde_json::json!({
                "token": access.as_deref().map(redact),
                "refreshToken": refresh.as_deref().map(redact),
            }))
        }
        TokenSubcommand::Set { access, refresh } => {
            let tokens = SessionTokens {
                access_token: access,
                refresh_token: refresh,
            };
            session_client(config, store)?.store_session(&tokens).await?;
            eprintln!("tokens stored");
            Ok(())
        }
        TokenSubcommand::Clear => {
            session_client(config, store)?.sign_out().await?;
            Ok(())
        }
    }
}

// =============================================================================
// CHAT
// =============================================================================

#[derive(Debug)]
enum ChatEvent {
    Connected,
    Disconnected,
    Message(ChatMessage),
    Read(ReadReceipt),
    Error(String),
}

/// Forwards channel callbacks to the command loop.
struct Forwarder {
    events: mpsc::UnboundedSender<ChatEvent>,
}

impl ChatHandler for Forwarder {
    fn on_connected(&self) {
        let _ = self.events.send(ChatEvent::Connected);
    }

    fn on_disconnected(&self) {
        let _ = self.events.send(ChatEvent::Disconnected);
    }

    fn on_message(&self, message: ChatMessage) {
        let _ = self.events.send(ChatEvent::Message(message));
    }

    fn on_read_update(&self, receipt: ReadReceipt) {
        let _ = self.events.send(ChatEvent::Read(receipt));
    }

    fn on_error(&self, error: &ChatError) {
        let _ = self.events.send(ChatEvent::Error(error.to_string()));
    }
}

async fn run_chat(config: &ClientConfig, store: Arc<dyn TokenStore>, chat: ChatCommand) -> Result<(), CliError> {
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut channel = ChatChannel::new(
        chat.room,
        config.chat.clone(),
        store,
        Arc::new(Forwarder { events: tx }),
    );

    match chat.command {
        ChatSubcommand::Listen => {
            channel.activate();
            let result = listen(&mut events).await;
            channel.deactivate();
            result
        }
        ChatSubcommand::Send { sender, text, image } => {
            let body = match (text, image) {
                (Some(text), image) => MessageBody {
                    image_url: image,
                    ..MessageBody::text(text)
                },
                (None, Some(image)) => MessageBody::image(image),
                (None, None) => MessageBody::default(),
            };
            channel.send_message(chat.room, sender, body);
            publish_once(&mut channel, &mut events, config.chat.fallback_timeout).await
        }
        ChatSubcommand::Read { user, up_to } => {
            channel.mark_as_read(chat.room, user, up_to);
            publish_once(&mut channel, &mut events, config.chat.fallback_timeout).await
        }
    }
}

async fn listen(events: &mut mpsc::UnboundedReceiver<ChatEvent>) -> Result<(), CliError> {
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                return signal.map_err(CliError::Signal);
            }
            event = events.recv() => match event {
                Some(ChatEvent::Message(message)) => println!("{}", serde_json::to_string(&message)?),
                Some(ChatEvent::Read(receipt)) => println!("{}", serde_json::to_string(&receipt)?),
                Some(ChatEvent::Connected) => eprintln!("connected"),
                Some(ChatEvent::Disconnected) => eprintln!("disconnected; reconnecting"),
                Some(ChatEvent::Error(message)) => eprintln!("error: {message}"),
                None => return Ok(()),
            },
        }
    }
}

/// Connect, let the queued publish flush, then disconnect.
async fn publish_once(
    channel: &mut ChatChannel,
    events: &mut mpsc::UnboundedReceiver<ChatEvent>,
    fallback_timeout: Duration,
) -> Result<(), CliError> {
    let limit = fallback_timeout + CONNECT_GRACE;
    channel.activate();
    let connected = tokio::time::timeout(limit, async {
        while let Some(event) = events.recv().await {
            match event {
                ChatEvent::Connected => return true,
                ChatEvent::Error(message) => eprintln!("error: {message}"),
                _ => {}
            }
        }
        false
    })
    .await;

    if !matches!(connected, Ok(true)) {
        channel.deactivate();
        return Err(CliError::ConnectTimeout(limit));
    }
    tokio::time::sleep(PUBLISH_LINGER).await;
    channel.deactivate();
    eprintln!("published");
    Ok(())
}

fn redact(token: &str) -> String {
    let visible = token.chars().take(6).collect::<String>();
    format!("{visible}…")
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
