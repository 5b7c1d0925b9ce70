//! Terminal chat client for the Gemini API.
//!
//! Plain input dispatches a chat turn; `/`-prefixed commands manage the
//! session. Ctrl-C during a pending turn aborts it and keeps the session.

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};

use session::{ChatExport, ChatSession};
use shared::chat::Message;
use shared::error::ChatError;
use shared::settings::{ChatSettings, CredentialStatus};

enum Flow {
    Continue,
    Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let mut session = ChatSession::new(ChatSettings::default());
    match std::env::var("GEMINI_API_KEY") {
        Ok(key) if !key.trim().is_empty() => {
            session.set_api_key(key.trim().to_string());
            report_verification(&mut session).await;
        }
        _ => println!("No GEMINI_API_KEY in the environment. Set a key with /key <key>."),
    }

    println!(
        "gemchat ({}) - type a message, or /help for commands.",
        session.settings().model_name
    );

    loop {
        print!("you> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.starts_with('/') {
            match handle_command(&mut session, input).await? {
                Flow::Quit => break,
                Flow::Continue => {}
            }
            continue;
        }
        send_turn(&session, input).await;
    }
    Ok(())
}

/// Dispatches one turn; Ctrl-C while it is pending aborts the request.
async fn send_turn(session: &ChatSession, text: &str) {
    let mut handle = match session.spawn_dispatch(text) {
        Ok(handle) => handle,
        Err(err) => {
            report_error(&err);
            return;
        }
    };
    let aborter = handle.abort_handle();
    let outcome = tokio::select! {
        outcome = handle.join() => outcome,
        _ = tokio::signal::ctrl_c() => {
            aborter.abort();
            Err(ChatError::Aborted)
        }
    };
    match outcome {
        Ok(reply) => print_reply(&reply),
        Err(err) => report_error(&err),
    }
}

fn print_reply(reply: &Message) {
    println!("{}", reply.content);
    let latency_ms = reply.latency.map(|d| d.as_millis()).unwrap_or_default();
    println!(
        "  [{} | {} ms | {} words | ~{} tokens]",
        reply.model_name.as_deref().unwrap_or("model"),
        latency_ms,
        reply.word_count,
        reply.token_count
    );
}

fn report_error(err: &ChatError) {
    match err {
        ChatError::NotAuthorized => {
            println!("! no verified API key - use /key <key> first")
        }
        ChatError::Timeout => {
            println!("! request timed out - your message is kept, /regenerate retries it")
        }
        ChatError::Aborted => {
            println!("! turn aborted - your message is kept, /regenerate retries it")
        }
        other => println!("! {other}"),
    }
}

async fn report_verification(session: &mut ChatSession) {
    match session.verify_key().await {
        CredentialStatus::Valid => {
            let models = session.available_models();
            println!("API key verified ({} models available).", models.len());
        }
        _ => println!(
            "! API key rejected: {}",
            session
                .last_verify_error()
                .unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}

async fn handle_command(session: &mut ChatSession, input: &str) -> Result<Flow> {
    let (command, rest) = match input.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (input, ""),
    };
    match command {
        "/exit" | "/quit" => return Ok(Flow::Quit),
        "/help" => print_help(),
        "/key" => {
            if rest.is_empty() {
                println!("usage: /key <api-key>");
            } else {
                session.set_api_key(rest.to_string());
                report_verification(session).await;
            }
        }
        "/verify" => report_verification(session).await,
        "/models" => {
            let models = session.available_models();
            if models.is_empty() {
                println!("no models cached - verify a key first (/key <key>)");
            } else {
                for name in models {
                    println!("  {name}");
                }
            }
        }
        "/model" => {
            if rest.is_empty() {
                println!("current model: {}", session.settings().model_name);
            } else {
                session.set_model(rest.to_string());
                println!("model set to {rest}");
            }
        }
        "/system" => {
            if rest.is_empty() {
                println!("system prompt: {}", session.settings().system_prompt);
            } else {
                session.set_system_prompt(rest.to_string());
                println!("system prompt updated");
            }
        }
        "/title" => {
            if rest.is_empty() {
                println!("title: {}", session.settings().chat_title);
            } else {
                session.set_title(rest.to_string());
                println!("title updated");
            }
        }
        "/list" => {
            for (i, msg) in session.messages().iter().enumerate() {
                println!("{:>3}. [{}] {}", i + 1, msg.role.as_str(), msg.content);
            }
        }
        "/edit" => match rest.split_once(' ') {
            Some((index, new_content)) if !new_content.trim().is_empty() => {
                match resolve_index(session, index) {
                    Some(id) => {
                        session.edit_message(id, new_content.trim())?;
                        println!("message {index} updated");
                    }
                    None => println!("no message {index} - see /list"),
                }
            }
            _ => println!("usage: /edit <n> <new text>"),
        },
        "/delete" => {
            let mut ids = HashSet::new();
            for index in rest.split_whitespace() {
                match resolve_index(session, index) {
                    Some(id) => {
                        ids.insert(id);
                    }
                    None => println!("no message {index} - see /list"),
                }
            }
            if ids.is_empty() {
                println!("usage: /delete <n> [<n> ...]");
            } else {
                let removed = session.delete_messages(&ids);
                println!("removed {removed} message(s)");
            }
        }
        "/regenerate" => match session.regenerate().await {
            Ok(reply) => print_reply(&reply),
            Err(err) => report_error(&err),
        },
        "/export" => {
            if rest.is_empty() {
                println!("usage: /export <path>");
            } else {
                write_export(Path::new(rest), &session.export())?;
                println!("conversation exported to {rest}");
            }
        }
        _ => println!("unknown command {command} - /help lists commands"),
    }
    Ok(Flow::Continue)
}

/// Maps a 1-based `/list` position to the message id at that position.
fn resolve_index(session: &ChatSession, index: &str) -> Option<uuid::Uuid> {
    let n: usize = index.parse().ok()?;
    let messages = session.messages();
    messages.get(n.checked_sub(1)?).map(|m| m.id)
}

fn write_export(path: &Path, export: &ChatExport) -> Result<()> {
    let json = serde_json::to_string_pretty(export).context("serializing conversation")?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn print_help() {
    println!("/key <key>          set the API key and verify it");
    println!("/verify             re-run key verification");
    println!("/models             list models available to the verified key");
    println!("/model [name]       show or switch the active model");
    println!("/system [prompt]    show or replace the system prompt");
    println!("/title [text]       show or rename the chat title");
    println!("/list               show the transcript with message numbers");
    println!("/edit <n> <text>    replace the content of message n");
    println!("/delete <n> [...]   delete messages by number");
    println!("/regenerate         resend the last user message");
    println!("/export <path>      write the conversation as JSON");
    println!("/exit               quit");
}
