use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use daide::Options;

#[derive(Parser, Debug)]
#[command(name = "daide-server")]
#[command(about = "DAIDE protocol server with a lobby game")]
pub struct Args {
    #[arg(short, long, help = "Address to listen on")]
    pub bind: Option<String>,

    #[arg(short, long)]
    pub port: Option<u16>,

    #[arg(long, help = "JSON file with server options")]
    pub options: Option<PathBuf>,

    #[arg(long, help = "Syntax description file replacing the built-in grammar")]
    pub syntax: Option<PathBuf>,

    #[arg(short, long, help = "Syntax level granted to new connections")]
    pub level: Option<i32>,

    #[arg(short, long, help = "0 = errors only ... 4 = trace")]
    pub verbosity: Option<u8>,

    #[arg(long, help = "Answer a Final Message with a Final Message")]
    pub echo_final: bool,

    #[arg(long, help = "Send an empty Representation Message")]
    pub null_rep: bool,

    #[arg(long, help = "Drop connections silent for this many milliseconds")]
    pub idle_timeout: Option<u64>,

    #[arg(long, help = "Run without the stdin console")]
    pub headless: bool,
}

impl Args {
    /// Options file first, then whatever was given on the command line.
    pub fn options(&self) -> anyhow::Result<Options> {
        let mut options = match &self.options {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => Options {
                host: String::from("0.0.0.0"),
                ..Options::default()
            },
        };

        if let Some(bind) = &self.bind {
            options.host = bind.clone();
        }
        if let Some(port) = self.port {
            options.port = port;
        }
        if let Some(syntax) = &self.syntax {
            options.syntax_file = Some(syntax.clone());
        }
        if let Some(level) = self.level {
            options.syntax_level = level;
        }
        if let Some(verbosity) = self.verbosity {
            options.verbosity = verbosity;
        }
        if let Some(idle) = self.idle_timeout {
            options.peer_idle_timeout_ms = Some(idle);
        }
        options.echo_final |= self.echo_final;
        options.null_rep |= self.null_rep;
        Ok(options)
    }
}
