//! The interactive chat loop.
//!
//! Line-oriented: read a submission from stdin, post it to the session, spawn
//! the response stream, and print fragments as they arrive. All session
//! mutation happens here, one channel event at a time; ctrl-c during a reply
//! cancels the in-flight stream without tearing down the session.

use std::error::Error;
use std::io::Write as _;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::core::chat_stream::{ChatStreamService, StreamMessage, StreamParams};
use crate::core::config::Config;
use crate::core::session::{ChatSession, FALLBACK_BOT_REPLY};

const USER_PROMPT: &str = "you> ";
const BOT_PROMPT: &str = "bot> ";

fn print_inline(text: &str) {
    print!("{text}");
    let _ = std::io::stdout().flush();
}

fn print_help() {
    println!("Commands:");
    println!("  /system <text>   Set the system prompt for this session");
    println!("  /system          Show the current system prompt");
    println!("  /help            Show this help");
    println!("  /quit            Leave the chat");
}

/// Handle a local slash command. Returns false when the loop should exit.
fn handle_command(session: &mut ChatSession, line: &str) -> bool {
    match line.split_once(' ') {
        Some(("/system", rest)) => {
            session.set_system_prompt(rest.trim());
            println!("System prompt updated.");
        }
        None if line == "/system" => {
            let prompt = session.system_prompt();
            if prompt.is_empty() {
                println!("No system prompt set.");
            } else {
                println!("System prompt: {prompt}");
            }
        }
        None if line == "/quit" || line == "/exit" => return false,
        _ => print_help(),
    }
    true
}

pub async fn run_chat(config: &Config, token: Option<String>) -> Result<(), Box<dyn Error>> {
    let client = reqwest::Client::new();
    let (service, mut rx) = ChatStreamService::new();
    let mut session = ChatSession::new(config.system_prompt());

    println!("charla — type a message, /help for commands, /quit to leave.");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print_inline(USER_PROMPT);
        let Some(line) = stdin.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();

        if line.starts_with('/') {
            if !handle_command(&mut session, &line) {
                break;
            }
            continue;
        }

        // Validation failures are reported locally; nothing is sent.
        let user_query = match session.submit(&line) {
            Ok(text) => text,
            Err(e) => {
                println!("({e})");
                continue;
            }
        };

        let (stream_id, cancel_token) = session.begin_stream();
        service.spawn_stream(StreamParams {
            client: client.clone(),
            base_url: config.base_url().to_string(),
            token: token.clone(),
            system_prompt: session.system_prompt().to_string(),
            user_query,
            cancel_token,
            stream_id,
        });

        print_inline(BOT_PROMPT);
        let mut printed_any = false;

        while session.is_loading() {
            tokio::select! {
                received = rx.recv() => {
                    let Some((message, id)) = received else {
                        session.cancel();
                        break;
                    };
                    if id != stream_id {
                        // A superseded stream draining out; the session
                        // drops it too.
                        session.apply(message, id);
                        continue;
                    }
                    match &message {
                        StreamMessage::Chunk(fragment) => {
                            print_inline(fragment);
                            printed_any = true;
                        }
                        StreamMessage::Error(detail) => {
                            tracing::error!(%detail, "exchange failed");
                            if !printed_any {
                                print_inline(FALLBACK_BOT_REPLY);
                                printed_any = true;
                            }
                        }
                        StreamMessage::Started | StreamMessage::End => {}
                    }
                    session.apply(message, stream_id);
                }
                _ = tokio::signal::ctrl_c() => {
                    session.cancel();
                    println!();
                    println!("(interrupted)");
                }
            }
        }

        if printed_any {
            println!();
        }
    }

    Ok(())
}
