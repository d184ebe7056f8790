//! `tern agent`: talk to the agent directly, one-shot or REPL.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use tern_core::bus::MessageBus;

use crate::commands::build_agent_loop;
use crate::config::load_config;

/// Run a direct agent session.
pub async fn run(message: Option<String>) -> Result<()> {
    let config = load_config()?;
    let bus = Arc::new(MessageBus::new());
    let agent = build_agent_loop(&config, bus, None)?;

    if let Some(message) = message {
        let reply = agent.process_direct(&message, "cli", "direct").await?;
        println!("{reply}");
        return Ok(());
    }

    // Interactive REPL until EOF or /quit.
    let mut stdout = tokio::io::stdout();
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let content = line.trim();
        if content.is_empty() {
            continue;
        }
        if content == "/quit" || content == "/exit" {
            break;
        }
        let reply = agent.process_direct(content, "cli", "direct").await?;
        println!("{reply}");
    }
    Ok(())
}
