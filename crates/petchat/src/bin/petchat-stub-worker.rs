//! Reference worker speaking the petchat line protocol.
//!
//! Answers without any language model, which makes it useful for local
//! development and for exercising the bridge against misbehaving workers.

use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use petchat_protocol::{
    CommandKind, FrameBody, HistoryEntry, StreamFrame, WorkerCommand, WorkerReply,
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Behavior {
    /// Answer every command properly
    Echo,
    /// Read commands, never answer
    Silent,
    /// Complain on stderr instead of answering
    Stderr,
    /// Exit with status 3 on the first command
    Crash,
    /// Print non-JSON noise around every answer
    Garbage,
    /// Never echo request ids and pretty-print answers over several lines
    Legacy,
    /// Report a failure for chat commands
    Fail,
}

#[derive(Debug, Parser)]
#[command(version, about = "Stub chatbot worker for petchat.")]
struct Cli {
    #[arg(long, value_enum, default_value_t = Behavior::Echo)]
    behavior: Behavior,
    /// Fixed answer for chat commands (default: echo the message)
    #[arg(long)]
    reply: Option<String>,
    /// Wait this long before answering each command
    #[arg(long = "delay-ms", default_value_t = 0)]
    delay_ms: u64,
    /// Never finish the first command: print a non-JSON line for a buffered
    /// command, or one chunk without `done` for a stream
    #[arg(long = "stall-first")]
    stall_first: bool,
}

struct Stub {
    cli: Cli,
    history: Vec<HistoryEntry>,
    stalled: bool,
    out: io::Stdout,
}

impl Stub {
    fn emit<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let mut out = self.out.lock();
        if self.cli.behavior == Behavior::Legacy {
            serde_json::to_writer_pretty(&mut out, value)?;
        } else {
            serde_json::to_writer(&mut out, value)?;
        }
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }

    fn noise(&mut self, text: &str) -> Result<()> {
        let mut out = self.out.lock();
        writeln!(out, "{}", text)?;
        out.flush()?;
        Ok(())
    }

    fn reply_id(&self, command: &WorkerCommand) -> Option<String> {
        match self.cli.behavior {
            Behavior::Legacy => None,
            _ => command.id.clone(),
        }
    }

    fn answer_for(&self, message: &str) -> String {
        self.cli
            .reply
            .clone()
            .unwrap_or_else(|| format!("echo: {}", message))
    }

    fn reply(&mut self, command: &WorkerCommand, mut reply: WorkerReply) -> Result<()> {
        reply.id = self.reply_id(command);
        self.emit(&reply)
    }

    fn frame(&mut self, command: &WorkerCommand, body: FrameBody) -> Result<()> {
        let frame = StreamFrame {
            id: self.reply_id(command),
            body,
        };
        self.emit(&frame)
    }

    fn stall(&mut self, command: &WorkerCommand) -> Result<()> {
        match command.command {
            CommandKind::StreamChat => {
                let message = command.message.clone().unwrap_or_default();
                let answer = self.answer_for(&message);
                let first = answer.split_whitespace().next().unwrap_or_default();
                self.frame(
                    command,
                    FrameBody::Chunk {
                        text: first.to_string(),
                    },
                )
            }
            _ => self.noise("oops not json"),
        }
    }

    fn handle(&mut self, command: WorkerCommand) -> Result<()> {
        match self.cli.behavior {
            Behavior::Silent => return Ok(()),
            Behavior::Stderr => {
                eprintln!("simulated worker failure while handling {}", command.command);
                return Ok(());
            }
            Behavior::Crash => std::process::exit(3),
            _ => {}
        }

        if self.cli.stall_first && !self.stalled {
            self.stalled = true;
            return self.stall(&command);
        }

        if self.cli.delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.cli.delay_ms));
        }
        if self.cli.behavior == Behavior::Garbage {
            self.noise("[stub] thinking...")?;
        }

        let message = command.message.clone().unwrap_or_default();
        match command.command {
            CommandKind::Chat => {
                if self.cli.behavior == Behavior::Fail {
                    return self.reply(&command, WorkerReply::failure("simulated worker failure"));
                }
                let answer = self.answer_for(&message);
                self.history.push(HistoryEntry::new("user", message));
                self.history
                    .push(HistoryEntry::new("assistant", answer.clone()));
                self.reply(&command, WorkerReply::with_response(answer))?;
            }
            CommandKind::StreamChat => {
                if self.cli.behavior == Behavior::Fail {
                    return self.frame(
                        &command,
                        FrameBody::Error {
                            error: Some("simulated worker failure".to_string()),
                        },
                    );
                }
                let answer = self.answer_for(&message);
                for word in answer.split_whitespace() {
                    self.frame(
                        &command,
                        FrameBody::Chunk {
                            text: word.to_string(),
                        },
                    )?;
                    if self.cli.behavior == Behavior::Garbage {
                        self.noise("progress: 50%")?;
                    }
                }
                self.frame(&command, FrameBody::Done)?;
                self.history.push(HistoryEntry::new("user", message));
                self.history.push(HistoryEntry::new("assistant", answer));
            }
            CommandKind::Reset => {
                self.history.clear();
                self.reply(&command, WorkerReply::ok())?;
            }
            CommandKind::History => {
                let history = self.history.clone();
                self.reply(&command, WorkerReply::with_history(history))?;
            }
        }

        if self.cli.behavior == Behavior::Garbage {
            self.noise("done.")?;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let garbage = cli.behavior == Behavior::Garbage;
    let mut stub = Stub {
        cli,
        history: Vec::new(),
        stalled: false,
        out: io::stdout(),
    };
    if garbage {
        stub.noise("Loading model, please wait")?;
    }

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading command")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WorkerCommand>(&line) {
            Ok(command) => stub.handle(command)?,
            Err(e) => stub.emit(&WorkerReply::failure(format!("invalid command: {}", e)))?,
        }
    }
    Ok(())
}
