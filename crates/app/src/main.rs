use anyhow::Result;
use assistant::{Assistant, HostCommand, Tone};
use clap::Parser;
use shared::{ConversationId, ProviderPreference, UiEvent};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod config;
mod render;

use render::Renderer;

#[derive(Debug, Parser)]
#[command(name = "sidekick", version, about = "Chat with a local model from the terminal")]
struct Cli {
    /// `auto`, `ollama`, `local-server` or `bundled`
    #[arg(long)]
    provider: Option<ProviderPreference>,

    /// Where conversations and downloaded models live
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep conversations in memory only
    #[arg(long)]
    memory: bool,

    /// Log filter, e.g. `info` or `providers=debug`. Overrides `RUST_LOG`.
    #[arg(long)]
    log_level: Option<String>,
}

const HELP: &str = "\
commands:
  /new [title]             start a new conversation
  /list                    list conversations
  /open <id-prefix>        switch to a conversation
  /rename <title>          rename the current conversation
  /delete <id-prefix>      delete a conversation
  /search <query>          search titles and messages
  /providers               show inference backends
  /provider <name>         prefer a backend (auto, ollama, local-server, bundled)
  /rewrite <tone> <text>   rewrite text in a tone
  /summarize <file>        summarize a text file
  /host <json>             run a host command given as JSON
  /help                    show this help
  /quit                    exit
anything else is sent as a chat message";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Chat(String),
    New(Option<String>),
    List,
    Open(String),
    Rename(String),
    Delete(String),
    Search(String),
    Providers,
    Provider(ProviderPreference),
    Host(HostCommand),
    Summarize(PathBuf),
    Help,
    Quit,
}

fn parse_line(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Chat(line.to_string())));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let required = |what: &str| {
        if arg.is_empty() {
            Err(format!("/{} needs {}", name, what))
        } else {
            Ok(arg.to_string())
        }
    };

    let command = match name {
        "new" => Command::New((!arg.is_empty()).then(|| arg.to_string())),
        "list" | "ls" => Command::List,
        "open" => Command::Open(required("a conversation id")?),
        "rename" => Command::Rename(required("a title")?),
        "delete" | "rm" => Command::Delete(required("a conversation id")?),
        "search" => Command::Search(required("a query")?),
        "providers" => Command::Providers,
        "provider" => Command::Provider(required("a provider name")?.parse()?),
        "rewrite" => {
            let (tone, text) = arg
                .split_once(char::is_whitespace)
                .ok_or_else(|| "usage: /rewrite <tone> <text>".to_string())?;
            Command::Host(HostCommand::RewriteSelection {
                text: text.trim().to_string(),
                tone: tone.parse::<Tone>()?,
            })
        }
        "summarize" => Command::Summarize(PathBuf::from(required("a file")?)),
        "host" => Command::Host(HostCommand::from_json(&required("a JSON command")?).map_err(|e| e.to_string())?),
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("unknown command /{} (try /help)", other)),
    };
    Ok(Some(command))
}

/// Find the one conversation whose id starts with `prefix`
async fn resolve(assistant: &Assistant, prefix: &str) -> Result<ConversationId, String> {
    let list = assistant.list().await.map_err(|e| e.user_message())?;
    let mut matches = list.into_iter().filter(|c| c.id.as_str().starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(found), None) => Ok(found.id),
        (None, _) => Err(format!("no conversation matches `{}`", prefix)),
        (Some(_), Some(_)) => Err(format!("`{}` matches more than one conversation", prefix)),
    }
}

fn short(id: &ConversationId) -> &str {
    id.as_str().get(..8).unwrap_or(id.as_str())
}

/// Run one command. Returns false when the session should end.
async fn dispatch(assistant: &Assistant, command: Command) -> Result<bool, String> {
    match command {
        Command::Chat(text) => {
            let _ = assistant.send(&text).await;
            println!();
        }
        Command::Host(host) => {
            let _ = assistant.run(&host).await;
            println!();
        }
        Command::Summarize(path) => {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| format!("could not read {}: {}", path.display(), e))?;
            let title = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            let host = HostCommand::SummarizePage {
                title,
                url: format!("file://{}", path.display()),
                content,
            };
            let _ = assistant.run(&host).await;
            println!();
        }
        Command::New(title) => {
            let id = assistant
                .new_conversation(title.as_deref())
                .await
                .map_err(|e| e.user_message())?;
            println!("started {}", short(&id));
        }
        Command::List => {
            let list = assistant.list().await.map_err(|e| e.user_message())?;
            if list.is_empty() {
                println!("no conversations yet");
            }
            let selected = assistant.selected();
            for c in list {
                let marker = if Some(&c.id) == selected.as_ref() { '*' } else { ' ' };
                println!(
                    "{} {}  {:<40} {:>3} msgs  {}",
                    marker,
                    short(&c.id),
                    c.title,
                    c.message_count,
                    c.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Command::Open(prefix) => {
            let id = resolve(assistant, &prefix).await?;
            assistant
                .open_conversation(&id)
                .await
                .map_err(|e| e.user_message())?;
            render::print_history(&assistant.messages());
        }
        Command::Rename(title) => {
            let id = assistant
                .selected()
                .ok_or_else(|| "no conversation selected".to_string())?;
            assistant.rename(&id, &title).await.map_err(|e| e.user_message())?;
        }
        Command::Delete(prefix) => {
            let id = resolve(assistant, &prefix).await?;
            assistant.delete(&id).await.map_err(|e| e.user_message())?;
            println!("deleted {}", short(&id));
        }
        Command::Search(query) => {
            let hits = assistant.search(&query, 20).await.map_err(|e| e.user_message())?;
            if hits.is_empty() {
                println!("nothing found");
            }
            for hit in hits {
                println!("{}  {}: {}", short(&hit.conversation_id), hit.title, hit.snippet);
            }
        }
        Command::Providers => {
            let active = assistant.transport().active_provider();
            println!("preference: {}", assistant.transport().preference());
            for info in assistant.providers().await {
                println!(
                    "{} {:<14} {}{}",
                    if Some(info.kind) == active { '*' } else { ' ' },
                    info.kind.as_str(),
                    if info.available { "available" } else { "unavailable" },
                    if info.needs_initialization { ", needs download" } else { "" },
                );
            }
        }
        Command::Provider(preference) => {
            assistant.set_provider(preference).await;
            println!("preference: {}", preference);
        }
        Command::Help => println!("{}", HELP),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let (mut settings, defaulted) = config::load_settings_or_default();
    if defaulted {
        debug!("running with default settings");
    }
    if let Some(preference) = cli.provider {
        settings.providers.preference = preference;
    }
    let data_dir = config::resolve_data_dir(cli.data_dir, &settings);
    info!(data_dir = %data_dir.display(), "starting");

    let assistant = Assistant::open(settings, &data_dir, cli.memory).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<UiEvent>();
    let renderer = tokio::spawn(async move {
        let mut renderer = Renderer::new();
        while let Some(event) = rx.recv().await {
            if let Some(text) = renderer.render(&event) {
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
        }
    });
    let flushed = assistant.mark_ready(tx);
    debug!(flushed, "renderer attached");

    println!("sidekick, /help for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                eprintln!("{}", message);
                continue;
            }
        };
        match dispatch(&assistant, command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(message) => eprintln!("{}", message),
        }
        // let the renderer catch up before the next prompt
        tokio::task::yield_now().await;
    }

    if let Err(e) = assistant.flush().await {
        eprintln!("warning: {}", e.user_message());
    }
    drop(assistant);
    renderer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ProviderKind;

    #[test]
    fn test_plain_text_is_chat() {
        assert_eq!(
            parse_line("  hello there "),
            Ok(Some(Command::Chat("hello there".into())))
        );
        assert_eq!(parse_line("   "), Ok(None));
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_line("/new"), Ok(Some(Command::New(None))));
        assert_eq!(
            parse_line("/new Trip ideas"),
            Ok(Some(Command::New(Some("Trip ideas".into()))))
        );
        assert_eq!(
            parse_line("/provider bundled"),
            Ok(Some(Command::Provider(ProviderPreference::Fixed(ProviderKind::Bundled))))
        );
        assert_eq!(
            parse_line("/rewrite casual Dear sir, I regret to inform you"),
            Ok(Some(Command::Host(HostCommand::RewriteSelection {
                text: "Dear sir, I regret to inform you".into(),
                tone: Tone::Casual,
            })))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_line("/open").is_err());
        assert!(parse_line("/rewrite angry hi").is_err());
        assert!(parse_line("/frobnicate").is_err());
        assert!(parse_line("/provider cloud").is_err());
    }
}
