mod config;
mod models;
mod providers;
mod services;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use config::{AppConfig, APP_NAME};
use models::Role;
use providers::{CompletionProvider, GoogleSearch, GroqProvider, SearchProvider};
use services::markdown::{format_message, render_plain, render_streaming};
use services::storage::Storage;
use services::{lock_store, ConversationStore, Database, DispatchEvent, Dispatcher, SettingsService};

const HELP: &str = "\
Commands:
  /new               start a new conversation
  /list              list saved conversations
  /open N            switch to conversation N
  /rename N NAME     rename conversation N
  /remove N          delete conversation N
  /history           show the messages of the current conversation
  /delete I          delete message I and everything after it
  /edit I TEXT       replace message I and ask again
  /models            list available models
  /quit              exit
Anything else is sent as a message.";

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Send(&'a str),
    New,
    List,
    Open(usize),
    Rename(usize, &'a str),
    Remove(usize),
    History,
    Delete(usize),
    Edit(usize, &'a str),
    Models,
    Help,
    Quit,
}

impl<'a> Command<'a> {
    /// Parse one input line. Positions are 1-based as shown to the user.
    fn parse(line: &'a str) -> Result<Self, String> {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Command::Send(line));
        };

        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };

        let position = |args: &str| -> Result<usize, String> {
            let n: usize = args
                .parse()
                .map_err(|_| format!("Expected a number, got '{}'", args))?;
            n.checked_sub(1).ok_or_else(|| "Numbers start at 1".to_string())
        };
        let position_and_text = |args: &'a str| -> Result<(usize, &'a str), String> {
            let (n, text) = args
                .split_once(char::is_whitespace)
                .ok_or_else(|| format!("Usage: /{} N TEXT", name))?;
            Ok((position(n)?, text.trim()))
        };

        match name {
            "new" => Ok(Command::New),
            "list" => Ok(Command::List),
            "open" => Ok(Command::Open(position(args)?)),
            "rename" => position_and_text(args).map(|(n, text)| Command::Rename(n, text)),
            "remove" => Ok(Command::Remove(position(args)?)),
            "history" => Ok(Command::History),
            "delete" => Ok(Command::Delete(position(args)?)),
            "edit" => position_and_text(args).map(|(n, text)| Command::Edit(n, text)),
            "models" => Ok(Command::Models),
            "help" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(format!("Unknown command /{}. Try /help", other)),
        }
    }
}

struct Repl {
    dispatcher: Dispatcher,
    provider: Arc<dyn CompletionProvider>,
    streaming: bool,
}

impl Repl {
    /// Returns `false` once the user asked to quit.
    async fn handle(&self, command: Command<'_>) -> Result<bool> {
        let store = self.dispatcher.store();
        match command {
            Command::Send(text) => {
                if let Some(handle) = self.dispatcher.send(text) {
                    self.print_reply(handle.wait().await);
                }
            }
            Command::New => {
                lock_store(&store).new_conversation()?;
                println!("Started a new conversation.");
            }
            Command::List => {
                let store = lock_store(&store);
                for (i, conversation) in store.conversations().iter().enumerate() {
                    let marker = if conversation.id == store.active_id() { "*" } else { " " };
                    println!(
                        "{} {:>2}. {} ({} messages)",
                        marker,
                        i + 1,
                        conversation.label(i),
                        conversation.messages.len()
                    );
                }
            }
            Command::Open(position) => match conversation_id(&store, position) {
                Some(id) => {
                    lock_store(&store).select(&id)?;
                    self.print_history();
                }
                None => println!("No conversation {}", position + 1),
            },
            Command::Rename(position, name) => match conversation_id(&store, position) {
                Some(id) => lock_store(&store).rename(&id, name)?,
                None => println!("No conversation {}", position + 1),
            },
            Command::Remove(position) => match conversation_id(&store, position) {
                Some(id) => lock_store(&store).delete_conversation(&id)?,
                None => println!("No conversation {}", position + 1),
            },
            Command::History => self.print_history(),
            Command::Delete(index) => match self.dispatcher.delete(index) {
                Ok(()) => println!("Deleted."),
                Err(e) => println!("{}", e),
            },
            Command::Edit(index, text) => match self.dispatcher.edit(index, text) {
                Ok(Some(handle)) => self.print_reply(handle.wait().await),
                Ok(None) => println!("Nothing to send."),
                Err(e) => println!("{}", e),
            },
            Command::Models => match self.provider.list_models().await {
                Ok(models) => {
                    for model in models {
                        println!(
                            "  {} ({})",
                            model.id,
                            model.owned_by.as_deref().unwrap_or("unknown")
                        );
                    }
                }
                Err(e) => println!("Failed to list models: {}", e),
            },
            Command::Help => println!("{}", HELP),
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }

    fn print_reply(&self, result: Result<String, services::dispatcher::DispatchError>) {
        match result {
            // Tokens were already printed as they arrived.
            Ok(_) if self.streaming => println!(),
            Ok(reply) => println!("{}\n", render_plain(&format_message(&reply))),
            Err(e) => {
                tracing::debug!("Reply failed: {}", e);
                println!("{}\n", services::dispatcher::FALLBACK_REPLY);
            }
        }
    }

    fn print_history(&self) {
        let store = self.dispatcher.store();
        let store = lock_store(&store);
        for (i, message) in store.active().messages.iter().enumerate() {
            match message.role {
                Role::User => println!("[{}] you: {}", i + 1, message.content),
                Role::Assistant => {
                    println!("[{}] {}:\n{}", i + 1, APP_NAME, render_plain(&format_message(&message.content)))
                }
                Role::System => {}
            }
        }
    }
}

fn conversation_id(store: &services::store::SharedStore, position: usize) -> Option<String> {
    lock_store(store)
        .conversations()
        .get(position)
        .map(|c| c.id.clone())
}

/// Print streamed tokens as they arrive.
async fn print_tokens(mut events: broadcast::Receiver<DispatchEvent>) {
    let mut printed = String::new();
    loop {
        match events.recv().await {
            Ok(DispatchEvent::Token { accumulated, .. }) => {
                let display = render_streaming(&accumulated);
                match display.strip_prefix(printed.as_str()) {
                    Some(new) => print!("{}", new),
                    // The layout changed (a retry, or a tag finished arriving).
                    None => print!("\n{}", display),
                }
                let _ = std::io::stdout().flush();
                printed = display;
            }
            Ok(DispatchEvent::Phase { .. }) | Ok(DispatchEvent::Renamed { .. }) => {
                printed.clear();
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Skipped {} dispatcher events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::from_env()?;

    let database = Database::open(&config.database_path).with_context(|| {
        format!("Failed to open database at {}", config.database_path.display())
    })?;
    let storage: Arc<dyn Storage> = Arc::new(database);

    let mut settings = SettingsService::load(storage.as_ref());
    if let Some(model) = &config.model {
        settings.model = model.clone();
    }
    let streaming = settings.stream_responses;

    let store = ConversationStore::open(storage).context("Failed to load conversations")?;

    let provider: Arc<dyn CompletionProvider> =
        Arc::new(GroqProvider::new(&config.api_key, config.base_url.as_deref()));

    // Without configured fallbacks, fall back through the listed models in priority order.
    if settings.fallback_models.is_empty() {
        match provider.list_models().await {
            Ok(models) => {
                settings.fallback_models = models
                    .into_iter()
                    .map(|m| m.id)
                    .filter(|id| *id != settings.model)
                    .collect();
            }
            Err(e) => tracing::warn!("Failed to list models, using {} only: {}", settings.model, e),
        }
    }
    let search = config.search.as_ref().map(|search| {
        Arc::new(GoogleSearch::new(&search.api_key, &search.engine_id)) as Arc<dyn SearchProvider>
    });

    tracing::info!(model = %settings.model, search = search.is_some(), "Starting {}", APP_NAME);

    let dispatcher = Dispatcher::spawn(store.into_shared(), provider.clone(), search, settings);
    if streaming {
        tokio::spawn(print_tokens(dispatcher.subscribe()));
    }

    let repl = Repl {
        dispatcher,
        provider,
        streaming,
    };

    println!("{}: type a message, or /help for commands.", APP_NAME);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match Command::parse(&line) {
            Ok(command) => {
                if !repl.handle(command).await? {
                    break;
                }
            }
            Err(message) => println!("{}", message),
        }
    }

    Ok(())
}
