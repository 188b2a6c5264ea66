use std::io::{self, BufRead};

use daide::{Registration, SchedulerHandle};

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Quit,
    Status,
    Help,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        let word = line.split_whitespace().next()?;
        Some(match word.to_ascii_lowercase().as_str() {
            "quit" | "exit" => Command::Quit,
            "status" => Command::Status,
            "help" | "?" => Command::Help,
            _ => Command::Unknown(word.to_string()),
        })
    }
}

/// Reads operator commands from stdin on a worker thread.
pub fn console(handle: SchedulerHandle) -> Registration {
    Registration::threaded(move || run(io::stdin().lock(), &handle))
}

pub fn run(input: impl BufRead, handle: &SchedulerHandle) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::warn!("console: {}", e);
                break;
            }
        };
        match Command::parse(&line) {
            Some(Command::Quit) => {
                log::info!("console: shutting down");
                handle.stop();
                return;
            }
            Some(Command::Status) => {
                log::info!("console: {} active registrants", handle.active_registrants());
            }
            Some(Command::Help) => log::info!("console: commands are quit, status, help"),
            Some(Command::Unknown(word)) => log::warn!("console: unknown command {:?}", word),
            None => {}
        }
        if handle.is_closed() {
            return;
        }
    }
    log::debug!("console: input closed");
}
