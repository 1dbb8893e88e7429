//! `docqa ask` and `docqa chat`.
//!
//! `chat` keeps one conversation alive for the whole session, so
//! follow-up questions are embedded with their recent context. Lines
//! starting with `/` are session commands:
//!
//! | Command | Effect |
//! |---------|--------|
//! | `/clear` | forget the conversation so far |
//! | `/quit` | leave |

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::error;

use docqa_core::index::MetadataFilter;
use docqa_core::models::{Answer, AnswerStatus};

use crate::query::QueryEngine;

/// Render an answer and its sources for the terminal.
pub fn format_answer(answer: &Answer) -> String {
    let mut out = answer.answer.clone();
    if answer.status == AnswerStatus::Grounded && !answer.sources.is_empty() {
        out.push_str("\n\nSources:");
        for (i, source) in answer.sources.iter().enumerate() {
            out.push_str(&format!("\n  [{}] {}", i + 1, source.document_id));
            if let Some(section) = &source.section {
                out.push_str(&format!(" ({section})"));
            }
            out.push_str(&format!("  score {:.3}", source.score));
        }
    }
    out
}

pub async fn run_ask(
    engine: &QueryEngine,
    conversation_id: &str,
    question: &str,
    filter: Option<&MetadataFilter>,
) -> Result<()> {
    match engine.answer_filtered(conversation_id, question, filter).await {
        Ok(answer) => {
            println!("{}", format_answer(&answer));
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e.user_message());
            Err(e.into())
        }
    }
}

pub async fn run_chat(
    engine: &QueryEngine,
    conversation_id: &str,
    filter: Option<&MetadataFilter>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    stdout
        .write_all(b"Ask a question (/clear to start over, /quit to leave).\n")
        .await?;
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                engine.conversations().clear(conversation_id);
                stdout.write_all(b"Conversation cleared.\n").await?;
                continue;
            }
            _ => {}
        }

        let reply = match engine.answer_filtered(conversation_id, line, filter).await {
            Ok(answer) => format_answer(&answer),
            Err(e) => {
                error!(error = %e, failed_in = %e.failed_in(), "question failed");
                e.user_message().to_string()
            }
        };
        stdout.write_all(reply.as_bytes()).await?;
        stdout.write_all(b"\n\n").await?;
    }
    Ok(())
}
