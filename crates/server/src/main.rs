mod config;
mod console;
mod lobby;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use daide::{Game, Registration, Scheduler, ServerSocket, Validator};

use config::Args;
use lobby::Lobby;

fn main() -> Result<()> {
    let args = Args::parse();
    let mut options = args.options()?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(options.log_level().to_string()),
    )
    .init();

    let validator = Arc::new(Validator::from_options(&options).context("loading syntax")?);
    for (level, name) in validator.levels().levels() {
        log::debug!("syntax level {}: {}", level, name);
    }
    let levels = validator.levels();
    let level = levels
        .negotiate(options.syntax_level)
        .with_context(|| format!("no syntax level at or below {}", options.syntax_level))?;
    log::info!(
        "granting syntax level {} ({})",
        level,
        levels.name(level).unwrap_or("unnamed")
    );
    options.syntax_level = level;
    let options = Arc::new(options);

    let game: Rc<RefCell<dyn Game>> = Rc::new(RefCell::new(Lobby::new()));
    let socket = ServerSocket::bind(Arc::clone(&options), game, validator)
        .with_context(|| format!("binding {}", options.address()))?;
    log::info!("Server started on {}", socket.local_addr());

    let mut scheduler = Scheduler::new(&options);
    scheduler.register(Registration::polled(socket));
    if !args.headless {
        scheduler.register(console::console(scheduler.handle()));
    }

    scheduler.run()?;
    log::info!("Server shutting down");
    Ok(())
}
