// Line-oriented front-end. Owns no chat logic: it dispatches commands to
// the session and prints whatever state comes back.

use crate::api::ChatApiProvider;
use crate::config::{self, BackendConfig};
use crate::models::{Message, Role};
use crate::render::{render_message_content, Segment};
use crate::session::{ChatSession, STREAM_ERROR_TEXT};
use crate::storage::ConversationStore;
use anyhow::Result;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP_TEXT: &str = "Commands: /new  /list  /open <id>  /help  /quit — anything else is sent as a prompt";

pub async fn run_loop(
    mut session: ChatSession,
    provider: &dyn ChatApiProvider,
    backend: &BackendConfig,
    store: &ConversationStore,
) -> Result<()> {
    println!("{}", HELP_TEXT);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break; // stdin closed
        };
        let line = line.trim_end().to_string();

        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            let (command, argument) = match command.split_once(' ') {
                Some((c, a)) => (c, a.trim()),
                None => (command, ""),
            };
            match command {
                "quit" | "exit" => break,
                "help" => println!("{}", HELP_TEXT),
                "new" => {
                    session.new_chat();
                    println!("Started a new chat.");
                }
                "list" => print_conversation_list(&session),
                "open" => {
                    if session.select_conversation(argument) {
                        print_transcript(session.messages());
                    } else {
                        println!("No conversation with id '{}'.", argument);
                    }
                }
                other => println!("Unknown command: /{}", other),
            }
            continue;
        }

        // A prompt. The key is resolved per turn so a freshly exported
        // variable is picked up without a restart.
        let api_key = match config::get_api_key(backend) {
            Ok(key) => key,
            Err(e) => {
                println!("No API key available: {}", e);
                continue;
            }
        };

        let ran = session
            .submit(provider, backend, &api_key, store, &line, |fragment| {
                print!("{}", fragment);
                let _ = std::io::stdout().flush();
            })
            .await?;
        println!();

        if ran {
            if let Some(last) = session.messages().last() {
                if last.role == Role::Model && last.content == STREAM_ERROR_TEXT {
                    println!("{}", STREAM_ERROR_TEXT);
                }
            }
        }
    }

    Ok(())
}

// Most recent first, like the sidebar.
fn print_conversation_list(session: &ChatSession) {
    if session.conversations().is_empty() {
        println!("No saved conversations yet.");
        return;
    }
    let conversations: Vec<_> = session.conversations().iter().collect();
    for conversation in conversations.iter().rev() {
        let marker = if session.current_conversation_id() == Some(conversation.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!("{} {}  {}", marker, conversation.id, conversation.title);
    }
}

fn print_transcript(messages: &[Message]) {
    for message in messages {
        let who = match message.role {
            Role::User => "you",
            Role::Model => "model",
        };
        println!("[{}]", who);
        for segment in render_message_content(&message.content) {
            match segment {
                Segment::Text { paragraphs } => {
                    for paragraph in paragraphs {
                        println!("{}", paragraph);
                    }
                }
                Segment::Code { language, body } => {
                    let label = if language.is_empty() { "code" } else { language.as_str() };
                    println!("--- {} (select to copy) ---", label);
                    println!("{}", body);
                    println!("---");
                }
            }
        }
    }
}
