use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod config;
mod merge_cmd;
mod parse_cmd;
mod readout_cmd;

use config::ModuleConfig;

#[derive(Debug, Parser)]
#[clap(max_term_width = 80, about = "sis3316-class digitizer host driver")]
enum Cli {
    /// Drain both banks forever, writing one raw event file per global
    /// channel. Interrupt with SIGINT to finish the in-flight cycle and
    /// exit cleanly.
    Readout {
        /// Module hostname or address.
        host: String,
        /// Module UDP port.
        #[clap(long, default_value_t = 3333)]
        port: u16,
        /// Global channel indices to drain; defaults to all 16.
        #[clap(short, long = "channel")]
        channels: Vec<u8>,
        /// Output file prefix; files are named `<prefix><NN>.dat`.
        #[clap(short, long, default_value = "sis3316_chan")]
        output: String,
        /// Configuration file applied to the module before arming.
        #[clap(long)]
        config: Option<PathBuf>,
    },

    /// Decode one raw event file and print its events as text, one line
    /// per event.
    Parse {
        file: PathBuf,
        /// Comma-separated field names to print (default: all).
        #[clap(long, value_delimiter = ',')]
        fields: Vec<String>,
    },

    /// Merge raw event files by timestamp, optionally grouping them into
    /// coincidences and filtering by trigger.
    Merge {
        files: Vec<PathBuf>,
        /// `name:ch1,ch2,...` — may be repeated.
        #[clap(short, long = "trigger")]
        triggers: Vec<String>,
        /// Group events into coincidences before filtering.
        #[clap(long)]
        coinc: bool,
        /// Coincidence window, in timestamp ticks.
        #[clap(short = 'j', long, default_value_t = 0)]
        window: i64,
        /// `chan:delay` — may be repeated.
        #[clap(short, long = "delay")]
        delays: Vec<String>,
    },

    /// Configuration file operations.
    Config {
        #[clap(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Parse a configuration file and validate it against the parameter
    /// tables without opening a socket.
    Check { file: PathBuf },
}

/// Exit codes per the external-interfaces contract: 0 ok, 1 usage/argument
/// error, otherwise the top `io::Error`'s raw errno. `Cli::parse()` itself
/// already exits with clap's own code on a malformed command line.
fn main() -> std::process::ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            let errno = e
                .chain()
                .find_map(|cause| cause.downcast_ref::<std::io::Error>())
                .and_then(std::io::Error::raw_os_error);
            match errno {
                Some(code) => std::process::ExitCode::from(code.clamp(2, 255) as u8),
                None => std::process::ExitCode::from(1),
            }
        }
    }
}

fn run() -> Result<()> {
    match Cli::parse() {
        Cli::Readout {
            host,
            port,
            channels,
            output,
            config,
        } => {
            let module_config = config
                .map(|path| load_and_validate(&path))
                .transpose()?;
            readout_cmd::run(&host, port, &channels, &output, module_config.as_ref())
        }
        Cli::Parse { file, fields } => parse_cmd::run(&file, &fields),
        Cli::Merge {
            files,
            triggers,
            coinc,
            window,
            delays,
        } => merge_cmd::run(&files, &triggers, coinc, window, &delays),
        Cli::Config {
            command: ConfigCommand::Check { file },
        } => {
            load_and_validate(&file)?;
            println!("{}: ok", file.display());
            Ok(())
        }
    }
}

fn load_and_validate(path: &std::path::Path) -> Result<ModuleConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let parsed: ModuleConfig =
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    parsed
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(parsed)
}
