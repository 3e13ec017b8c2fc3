use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::error;

use wirechat_client::api::HttpChatApi;
use wirechat_client::config::{ClientConfig, Credentials, CredentialStore, FileCredentialStore};
use wirechat_client::notify::NullNotifier;
use wirechat_client::session::{ChatSession, SessionEvent, SessionHandle, ToastLevel};
use wirechat_client::transport::WsTransport;

#[derive(Parser, Debug)]
#[command(name = "wirechat")]
struct ClientArgs {
    #[arg(long, default_value = "ws://127.0.0.1:9528/ws")]
    server_url: String,
    #[arg(long, default_value = "http://127.0.0.1:9528/api")]
    api_url: String,
    /// Login identity. All three must be given together; once given they
    /// are persisted and later runs can omit them.
    #[arg(long, requires_all = ["username", "token"])]
    user_id: Option<u64>,
    #[arg(long, requires = "user_id")]
    username: Option<String>,
    #[arg(long, requires = "user_id")]
    token: Option<String>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = ClientArgs::parse();
    let data_dir = args
        .data_dir
        .unwrap_or_else(|| PathBuf::from(".wirechat"));

    let config = ClientConfig::new(args.server_url, args.api_url.clone(), data_dir.clone());
    if let Err(err) = config.validate() {
        error!("invalid configuration: {}", err);
        std::process::exit(2);
    }

    let credentials = FileCredentialStore::new(&data_dir);
    if let (Some(user_id), Some(username), Some(token)) =
        (args.user_id, args.username, args.token)
    {
        let login = Credentials {
            user_id,
            username,
            token,
        };
        if let Err(err) = credentials.save(&login) {
            error!("could not save credentials: {}", err);
            std::process::exit(2);
        }
    }
    let Some(login) = credentials.load() else {
        error!("no saved credentials; pass --user-id, --username and --token to log in");
        std::process::exit(2);
    };
    let credentials = Arc::new(credentials);

    let api = HttpChatApi::new(args.api_url, login.token);

    let (handle, mut events) = ChatSession::spawn(
        config,
        credentials.clone(),
        Arc::new(api),
        Arc::new(NullNotifier),
        Arc::new(WsTransport),
    );

    if handle.connect().is_err() {
        error!("session ended before connecting");
        std::process::exit(1);
    }

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(event);
        }
    });

    println!(
        "commands: /open <user>, /send <text>, /older, /recall <id>, /notices, /logout, /quit"
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if line == "/logout" {
            credentials.clear();
            let _ = handle.disconnect();
            println!("logged out");
            continue;
        }
        if let Err(err) = run_command(&handle, line).await {
            println!("! {err}");
        }
    }

    let _ = handle.disconnect();
}

async fn run_command(
    handle: &SessionHandle,
    line: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(key) = line.strip_prefix("/open ") {
        handle.select_chat(key.trim()).await?;
        let snapshot = handle.snapshot().await?;
        if let Some(conversation) = snapshot
            .conversations
            .iter()
            .find(|conversation| conversation.peer.username == key.trim())
        {
            for message in &conversation.messages {
                println!(
                    "  [{}] {}: {}",
                    message.id, message.sender_id, message.content
                );
            }
        }
        return Ok(());
    }

    if let Some(text) = line.strip_prefix("/send ") {
        let snapshot = handle.snapshot().await?;
        let Some(active) = snapshot.active.as_deref() else {
            println!("! open a conversation first");
            return Ok(());
        };
        let Some(conversation) = snapshot
            .conversations
            .iter()
            .find(|conversation| conversation.peer.username == active)
        else {
            println!("! active conversation vanished");
            return Ok(());
        };
        let sent = handle.send_text(conversation.peer.id, text).await?;
        println!("{}", if sent { "sent" } else { "send failed" });
        return Ok(());
    }

    if line == "/older" {
        let fetched = handle.load_older().await?;
        println!("{}", if fetched { "older messages loaded" } else { "no older messages" });
        return Ok(());
    }

    if let Some(raw_id) = line.strip_prefix("/recall ") {
        let message_id: u64 = raw_id.trim().parse()?;
        let recalled = handle.recall(message_id).await?;
        println!("{}", if recalled { "recalled" } else { "recall failed" });
        return Ok(());
    }

    if line == "/notices" {
        let snapshot = handle.snapshot().await?;
        println!("{} unread", snapshot.notice_count);
        for notice in &snapshot.notices {
            println!(
                "  [{}] {:?} from {}{}",
                notice.id,
                notice.kind,
                notice.from_username,
                if notice.read { "" } else { " (unread)" }
            );
        }
        return Ok(());
    }

    println!("! unknown command");
    Ok(())
}

fn print_event(event: SessionEvent) {
    match event {
        SessionEvent::Status(status) => println!("* connection: {status:?}"),
        SessionEvent::AuthFailed { code, msg } => println!("* auth failed ({code}): {msg}"),
        SessionEvent::Toast { level, text } => {
            let tag = match level {
                ToastLevel::Info => "info",
                ToastLevel::Success => "ok",
                ToastLevel::Error => "error",
            };
            println!("* {tag}: {text}");
        }
        SessionEvent::ChatListUpdated => println!("* chat list updated"),
        SessionEvent::ConversationUpdated { key } => println!("* conversation updated: {key}"),
        SessionEvent::NoticeAdded { id } => println!("* new notice #{id}"),
        SessionEvent::NoticeCount { unread } => println!("* unread notices: {unread}"),
    }
}
