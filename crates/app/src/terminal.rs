//! Line-based terminal client
//!
//! Reads lines from stdin and sends each one; prints every relayed message.
//! `h` prints help, `q` closes the connection and exits.

use std::io::Write;

use anyhow::{Context, Result};
use tcpchat_net::{Client, ClientConfig, Envelope, ServerEvent};
use tokio::io::{AsyncBufReadExt, BufReader};

const PROMPT: &str = ">> ";

const HELP: &str = "Help:
  <message>  send message
  h          print this help
  q          quit client";

/// One line of user input
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Help,
    Quit,
    Line(String),
}

fn parse_input(line: &str) -> Input {
    match line.trim() {
        "h" => Input::Help,
        "q" => Input::Quit,
        _ => Input::Line(line.to_string()),
    }
}

/// Format a received message for display
fn render(msg: &Envelope, json: bool) -> Result<String> {
    if json {
        return serde_json::to_string(msg).context("Failed to serialize message");
    }
    Ok(format!("[{}] {}", msg.from_address, msg.body()))
}

fn prompt() {
    print!("{}", PROMPT);
    let _ = std::io::stdout().flush();
}

/// Run the interactive client until the user quits or the server goes away
pub async fn run(config: &ClientConfig, json: bool) -> Result<()> {
    let mut client = Client::connect(&config.server, config.max_frame_size)
        .await
        .context("Client failed to connect")?;
    tracing::info!(server = %client.peer_addr(), local = %client.local_addr(), "Connected");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = line.context("Failed to read stdin")?;
                let Some(line) = line else {
                    client.disconnect().await;
                    break;
                };
                match parse_input(&line) {
                    Input::Help => println!("{}", HELP),
                    Input::Quit => {
                        println!("Exiting client");
                        client.disconnect().await;
                        break;
                    }
                    Input::Line(text) => {
                        if let Err(e) = client.send_text(&text).await {
                            tracing::warn!(error = %e, "Failed to send message");
                        }
                    }
                }
                prompt();
            }
            event = client.next_event() => {
                match event {
                    Some(ServerEvent::Message(msg)) => {
                        println!("\r{}", render(&msg, json)?);
                        prompt();
                    }
                    Some(ServerEvent::Disconnected) | None => {
                        println!("\rDisconnected from server");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_commands() {
        assert_eq!(parse_input("h\n"), Input::Help);
        assert_eq!(parse_input("  q "), Input::Quit);
        assert_eq!(parse_input("hello"), Input::Line("hello".to_string()));
        assert_eq!(parse_input(""), Input::Line(String::new()));
    }

    #[test]
    fn render_plain_and_json() {
        let msg = Envelope {
            text: "hi\r".to_string(),
            from_address: "127.0.0.1:5000".to_string(),
            utc_timestamp_seconds: 42,
        };

        assert_eq!(render(&msg, false).unwrap(), "[127.0.0.1:5000] hi");

        let value: serde_json::Value = serde_json::from_str(&render(&msg, true).unwrap()).unwrap();
        assert_eq!(value["from_address"], "127.0.0.1:5000");
        assert_eq!(value["utc_timestamp_seconds"], 42);
    }
}
