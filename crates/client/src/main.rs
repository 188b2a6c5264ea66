mod player;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use daide::{Client, Options, Registration, Scheduler, Validator};

use player::Observer;

#[derive(Parser, Debug)]
#[command(name = "daide-client")]
#[command(about = "DAIDE observer client")]
struct Args {
    #[arg(short, long, help = "Server host to connect to")]
    server: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long, help = "Join as a named player instead of an observer")]
    name: Option<String>,

    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    client_version: String,

    #[arg(long, help = "JSON file with client options")]
    options: Option<PathBuf>,

    #[arg(short, long, help = "0 = errors only ... 4 = trace")]
    verbosity: Option<u8>,

    #[arg(long, help = "Do not check server messages against the grammar")]
    no_validate: bool,
}

impl Args {
    fn options(&self) -> anyhow::Result<Options> {
        let mut options: Options = match &self.options {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => Options::default(),
        };
        if let Some(server) = &self.server {
            options.host = server.clone();
        }
        if let Some(port) = self.port {
            options.port = port;
        }
        if let Some(verbosity) = self.verbosity {
            options.verbosity = verbosity;
        }
        if self.no_validate {
            options.validate_incoming = false;
        }
        Ok(options)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let options = args.options()?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(options.log_level().to_string()),
    )
    .init();

    let validator = if options.validate_incoming {
        Some(Arc::new(
            Validator::from_options(&options).context("loading syntax")?,
        ))
    } else {
        None
    };

    let player = match &args.name {
        Some(name) => Observer::named(name, &args.client_version),
        None => Observer::new(),
    };
    let client = Client::connect(1, options.address(), &options, player, validator)
        .with_context(|| format!("connecting to {}", options.address()))?;

    let mut scheduler = Scheduler::new(&options);
    scheduler.register(Registration::polled(client));
    scheduler.run()?;
    log::info!("Client finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_to_options() {
        let args = Args::try_parse_from([
            "daide-client",
            "--server",
            "example.org",
            "--port",
            "4000",
            "--no-validate",
        ])
        .unwrap();
        let options = args.options().unwrap();
        assert_eq!(options.address(), "example.org:4000");
        assert!(!options.validate_incoming);
        assert_eq!(args.client_version, env!("CARGO_PKG_VERSION"));
    }
}
