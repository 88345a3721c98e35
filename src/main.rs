use std::path::Path;

use anyhow::{anyhow, Result};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sandpad::config::{Config, Isolation};
use sandpad::console::TerminalSink;
use sandpad::editor::{FileEditor, InlineEditor, SourceEditor};
use sandpad::runtime::{Playground, UiEvent};
use sandpad::sandbox;

const DEFAULT_CONFIG_PATH: &str = "config/sandpad.toml";

fn print_help() {
    println!(
        "\
sandpad v{}

Runs a script in a fresh, isolated JavaScript sandbox and prints its console.

USAGE:
    sandpad [OPTIONS] SCRIPT
    sandpad [OPTIONS] -e CODE

ARGUMENTS:
    SCRIPT    Script file, re-read on every /run

OPTIONS:
    -c, --config PATH    TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
    -e, --eval CODE      Run CODE instead of a script file
        --once           Run once, print output until quiet, then exit
        --thread         Run sandboxes on a thread instead of a child process
    -h, --help           Print this help message and exit
    -V, --version        Print version and exit

COMMANDS (interactive mode, one per line on stdin):
{COMMANDS}
ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing, written to stderr
                (e.g. debug, sandpad=debug,warn)

EXAMPLES:
    sandpad demos/hello.js                  # interactive, uses {DEFAULT_CONFIG_PATH}
    sandpad --once demos/hello.js           # run and exit
    sandpad -e 'console.log(1 + 1)' --once  # one-liner
    RUST_LOG=debug sandpad demos/hello.js   # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

const COMMANDS: &str = "    /run      Re-read the script and run it in a new sandbox
    /clear    Clear the console
    /stop     Dispose the running sandbox
    /help     Show these commands
    /quit     Exit
";

struct Cli {
    config_path: String,
    config_explicit: bool,
    script: Option<String>,
    eval: Option<String>,
    once: bool,
    thread: bool,
}

fn parse_args(args: Vec<String>) -> Result<Cli> {
    let mut cli = Cli {
        config_path: DEFAULT_CONFIG_PATH.to_string(),
        config_explicit: false,
        script: None,
        eval: None,
        once: false,
        thread: false,
    };
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("sandpad v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--config" | "-c" => {
                cli.config_path = args.next().ok_or_else(|| anyhow!("{arg} needs a path"))?;
                cli.config_explicit = true;
            }
            "--eval" | "-e" => {
                cli.eval = Some(args.next().ok_or_else(|| anyhow!("{arg} needs code"))?);
            }
            "--once" => cli.once = true,
            "--thread" => cli.thread = true,
            flag if flag.starts_with('-') => return Err(anyhow!("Unknown option: {flag} (try --help)")),
            _ if cli.script.is_none() => cli.script = Some(arg),
            _ => return Err(anyhow!("Only one script can be given")),
        }
    }
    if cli.script.is_none() && cli.eval.is_none() {
        return Err(anyhow!("No script given (try --help)"));
    }
    Ok(cli)
}

fn init_logging(default_filter: &str) {
    // stdout carries console lines (and frames, in a worker): logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Child-process sandbox: no async runtime, no banner
    if args.first().map(String::as_str) == Some("sandbox-worker") {
        init_logging("sandpad=warn");
        return sandbox::worker::serve_stdio(args.into_iter().skip(1));
    }

    let cli = parse_args(args)?;
    init_logging("sandpad=info");
    playground_main(cli)
}

#[tokio::main]
async fn playground_main(cli: Cli) -> Result<()> {
    if !cli.once {
        eprintln!(
            r#"
                        _                  _
   ___  __ _ _ __   __| |_ __   __ _  __| |
  / __|/ _` | '_ \ / _` | '_ \ / _` |/ _` |
  \__ \ (_| | | | | (_| | |_) | (_| | (_| |
  |___/\__,_|_| |_|\__,_| .__/ \__,_|\__,_|
                        |_|   v{}
"#,
            env!("CARGO_PKG_VERSION")
        );
    }

    // Load configuration; the default file is optional
    let mut config = if cli.config_explicit || Path::new(&cli.config_path).exists() {
        info!("Loading configuration from {}", cli.config_path);
        Config::load(&cli.config_path)?
    } else {
        info!("No {} found, using defaults", cli.config_path);
        Config::default()
    };
    if cli.thread {
        config.sandbox.isolation = Isolation::Thread;
    }

    let factory = sandbox::factory_from_config(&config)?;
    info!("Isolation: {}", factory.description());
    info!("Ready timeout: {}ms", config.sandbox.ready_timeout_ms);
    match config.sandbox.watchdog_ms {
        Some(ms) => info!("Watchdog: {ms}ms"),
        None => info!("Watchdog: off"),
    }
    if !config.sandbox.allow_network {
        info!("Network access disabled for sandboxed code");
    }

    let editor: Box<dyn SourceEditor> = match (&cli.eval, &cli.script) {
        (Some(code), _) => Box::new(InlineEditor::new(code.clone())),
        (None, Some(path)) => Box::new(FileEditor::new(path)),
        (None, None) => return Err(anyhow!("No script given")),
    };
    info!("Script: {}", editor.name());

    let mut playground = Playground::new(factory, TerminalSink::stdout(), &config.sandbox);

    if cli.once {
        let source = editor.source_text().await?;
        playground.run(source)?;
        tokio::select! {
            _ = playground.settle(config.console.linger()) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
            }
        }
        playground.stop();
        return Ok(());
    }

    let (cmd_tx, cmd_rx) = mpsc::channel::<UiEvent>(16);
    tokio::spawn(read_commands(cmd_tx));
    eprintln!("Type /help for commands.");

    tokio::select! {
        result = playground.serve(editor.as_ref(), cmd_rx) => {
            if let Err(e) = &result {
                error!("Playground stopped: {e}");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
            Ok(())
        }
    }
}

/// Forwards commands typed on stdin. Closing stdin ends the session.
async fn read_commands(tx: mpsc::Sender<UiEvent>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read command: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match UiEvent::parse(&line) {
            Ok(UiEvent::Help) => eprint!("{COMMANDS}"),
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(message) => eprintln!("{message}"),
        }
    }
}
