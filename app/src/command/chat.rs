//! Interactive chat against one conversation.
//!
//! Streamed replies are printed from the conversation's status stream as the
//! deltas arrive; Ctrl+C cancels the reply in flight.

use colloquy_conversation::{
    ConversationEngine, EngineError, GenerationOutcome, GenerationStatus, HistoryStats,
    StatusStream,
};
use futures::{FutureExt, StreamExt};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Runtime, init_runtime};

#[derive(Debug, Clone)]
pub struct ChatInput {
    /// Conversation to use (a fresh id if not provided)
    pub conversation_id: Option<String>,
    /// Single message to send (non-interactive mode)
    pub message: Option<String>,
    pub stream: bool,
    /// Overrides the configured system prompt
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChatStrategy;

impl super::CommandStrategy for ChatStrategy {
    type Input = ChatInput;

    async fn execute(&self, input: Self::Input) -> anyhow::Result<()> {
        let runtime = init_runtime()?;
        let _sweeper = runtime.engine.spawn_expiry_sweeper();

        let session = ChatSession {
            conversation_id: input
                .conversation_id
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
            system_prompt: input
                .system_prompt
                .or_else(|| runtime.config.conversation.system_prompt.clone()),
            stream: input.stream,
        };
        session.reset(&runtime.engine);
        info!("Starting conversation {}", session.conversation_id);

        if let Some(message) = input.message {
            session.send(&runtime.engine, &message).await?;
            return Ok(());
        }

        session.run_interactive(&runtime).await
    }
}

struct ChatSession {
    conversation_id: String,
    system_prompt: Option<String>,
    stream: bool,
}

impl ChatSession {
    fn reset(&self, engine: &ConversationEngine) {
        engine.create_context(&self.conversation_id, self.system_prompt.as_deref());
    }

    async fn run_interactive(&self, runtime: &Runtime) -> anyhow::Result<()> {
        println!("=== Conversation: {} ===", self.conversation_id);
        println!("Commands: /history, /stats, /tokens, /clear");
        println!("Type 'exit', 'quit', or 'q' to end the session.\n");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("> ");
            std::io::stdout().flush()?;

            let Some(line) = lines.next_line().await? else {
                break;
            };
            let line = line.trim();

            match line {
                "" => {}
                "exit" | "quit" | "q" => break,
                "/history" => self.print_history(&runtime.engine),
                "/stats" => self.print_stats(runtime),
                "/tokens" => match runtime
                    .engine
                    .count_context_tokens(&self.conversation_id)
                    .await
                {
                    Ok(tokens) => println!("Context tokens: {tokens}\n"),
                    Err(e) => eprintln!("Error: {e}\n"),
                },
                "/clear" => {
                    runtime.engine.clear_context(&self.conversation_id);
                    self.reset(&runtime.engine);
                    println!("Conversation cleared.\n");
                }
                text => {
                    if let Err(e) = self.send(&runtime.engine, text).await {
                        eprintln!("Error: {e}\n");
                    }
                }
            }
        }

        let turns = runtime
            .engine
            .get_context(&self.conversation_id)
            .map_or(0, |ctx| HistoryStats::of(&ctx.messages).user_messages);
        println!("\nSession ended. Turns in context: {turns}");
        Ok(())
    }

    /// Send one message and print the reply.
    async fn send(&self, engine: &ConversationEngine, text: &str) -> Result<(), EngineError> {
        let mut statuses = engine.watch(&self.conversation_id);
        let mut printer = DeltaPrinter::default();

        let generation = engine.send_message(&self.conversation_id, text, self.stream);
        tokio::pin!(generation);
        let result = loop {
            tokio::select! {
                biased;
                Some(status) = statuses.next() => printer.show(&status),
                result = &mut generation => break result,
                _ = tokio::signal::ctrl_c() => {
                    engine.cancel_generation(&self.conversation_id);
                }
            }
        };
        drain(&mut statuses, &mut printer);

        match result?.outcome {
            GenerationOutcome::Completed(reply) => {
                if printer.printed_any() {
                    println!("\n");
                } else {
                    println!("\n{reply}\n");
                }
            }
            GenerationOutcome::Failed(message) => {
                eprintln!("\nError: {message}");
                eprintln!("The message was kept; send it again to retry.\n");
            }
        }
        Ok(())
    }

    fn print_history(&self, engine: &ConversationEngine) {
        let Some(context) = engine.get_context(&self.conversation_id) else {
            println!("(no context)\n");
            return;
        };
        for message in &context.messages {
            println!("[{}] {}", message.role.as_str(), message.content);
        }
        println!();
    }

    fn print_stats(&self, runtime: &Runtime) {
        let messages = runtime
            .engine
            .get_context(&self.conversation_id)
            .map(|ctx| ctx.messages)
            .unwrap_or_default();
        let history = HistoryStats::of(&messages);
        let transport = runtime.transport.stats();

        println!(
            "Messages: {} (system {}, user {}, assistant {})",
            history.total_messages,
            history.system_messages,
            history.user_messages,
            history.assistant_messages
        );
        println!(
            "Characters: {} (~{} tokens)",
            history.total_characters, history.estimated_tokens
        );
        println!(
            "Requests: {}, retries: {}, dropped chunks: {}\n",
            transport.requests, transport.retries, transport.dropped_chunks
        );
    }
}

fn drain(statuses: &mut StatusStream, printer: &mut DeltaPrinter) {
    while let Some(Some(status)) = statuses.next().now_or_never() {
        printer.show(&status);
    }
}

/// Prints only the part of the accumulated text not yet shown.
#[derive(Debug, Default)]
struct DeltaPrinter {
    message_id: Option<String>,
    printed: usize,
}

impl DeltaPrinter {
    fn show(&mut self, status: &GenerationStatus) {
        let Some(progress) = status.current_progress.as_ref() else {
            return;
        };
        if self.message_id.as_deref() != Some(progress.message_id.as_str()) {
            debug!("Streaming reply {}", progress.message_id);
            self.message_id = Some(progress.message_id.clone());
            self.printed = 0;
        }
        if let Some(delta) = progress.accumulated_text.get(self.printed..) {
            if !delta.is_empty() {
                print!("{delta}");
                let _ = std::io::stdout().flush();
            }
            self.printed = progress.accumulated_text.len();
        }
    }

    const fn printed_any(&self) -> bool {
        self.printed > 0
    }
}
