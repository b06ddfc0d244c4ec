//! Tether controller - drive a live target from the terminal
//!
//! # Usage
//!
//! ```bash
//! # Attach to a target listening on 127.0.0.1:5678
//! tether connect --port 5678 --exit-on-disconnect false
//!
//! # Wait for a target to dial in, requiring a token
//! tether listen --port 5678 --token s3cret --exit-on-disconnect true
//! ```
//!
//! Once bound, commands are read line by line from stdin:
//!
//! ```text
//! break demo.rs:12     delete demo.rs:12    clear      breaks
//! pause [thread]       continue             step <thread>
//! threads              bt <thread>          set <thread> <name> <value>
//! detach [suspend]     kill
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tether_controller::{connect, ControllerConfig, ControllerListener, ControllerSession};
use tether_core::{SourceLocation, ThreadId};
use tether_protocol::TargetEvent;

/// Tether controller
#[derive(Parser, Debug)]
#[command(name = "tether", version, about)]
struct Args {
    /// Config file (defaults to <config dir>/tether/controller.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dial a target that is listening
    Connect(Endpoint),
    /// Wait for a target to dial in
    Listen(Endpoint),
}

#[derive(ClapArgs, Debug)]
struct Endpoint {
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Token a dialing target must present (listen only)
    #[arg(long)]
    token: Option<String>,

    /// Terminate the target when the session ends (required unless the
    /// config file states it)
    #[arg(long, value_name = "true|false")]
    exit_on_disconnect: Option<bool>,

    /// Connect attempts before giving up
    #[arg(long)]
    attempts: Option<u32>,
}

impl Endpoint {
    fn apply(self, mut config: ControllerConfig) -> ControllerConfig {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.token.is_some() {
            config.access_token = self.token;
        }
        if self.exit_on_disconnect.is_some() {
            config.exit_on_disconnect = self.exit_on_disconnect;
        }
        if let Some(attempts) = self.attempts {
            config.max_attempts = attempts;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tether_controller=info".parse()?)
                .add_directive("tether_protocol=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = ControllerConfig::load_or_default(args.config.as_deref())
        .context("Failed to load config")?;

    let session = match args.command {
        Command::Connect(endpoint) => {
            let config = endpoint.apply(config);
            info!(address = %config.address(), "Connecting");
            connect(&config).await?
        }
        Command::Listen(endpoint) => {
            let config = endpoint.apply(config);
            let listener = ControllerListener::bind(config).await?;
            println!("waiting for a target on {}", listener.local_addr()?);
            listener.accept_authorized().await?
        }
    };
    println!("bound to {}", session.peer());

    let printer = tokio::spawn(print_events(session.subscribe()));
    let result = repl(&session).await;
    printer.abort();
    result
}

async fn print_events(mut events: broadcast::Receiver<TargetEvent>) {
    loop {
        match events.recv().await {
            Ok(TargetEvent::Stopped(stop)) => {
                let place = stop
                    .location()
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| "<unknown>".to_string());
                println!("stopped ({}) thread {} at {place}", stop.reason, stop.thread_id);
            }
            Ok(TargetEvent::Continued { .. }) => println!("running"),
            Ok(TargetEvent::Output { output, .. }) => print!("{output}"),
            Ok(TargetEvent::Exited { exit_code }) => println!("target exited ({exit_code})"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn repl(session: &ControllerSession) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = session.closed() => {
                println!("session closed");
                return Ok(());
            }
        };
        let Some(line) = line else {
            session.disconnect(None, false).await?;
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        let command = match ReplCommand::from_str(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        match run(session, command).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Done) => return Ok(()),
            Err(e) => println!("error: {e}"),
        }
    }
}

enum Flow {
    Continue,
    Done,
}

async fn run(session: &ControllerSession, command: ReplCommand) -> Result<Flow> {
    match command {
        ReplCommand::Break(location) => session.add_breakpoint(location).await?,
        ReplCommand::Delete(location) => session.remove_breakpoint(location).await?,
        ReplCommand::Clear => session.clear_breakpoints().await?,
        ReplCommand::Breaks => {
            for location in session.breakpoints().await? {
                println!("  {location}");
            }
        }
        ReplCommand::Pause(thread) => session.pause(thread).await?,
        ReplCommand::Continue => session.resume().await?,
        ReplCommand::Step(thread) => session.step(thread).await?,
        ReplCommand::Threads => {
            for thread in session.threads().await? {
                println!("  {} {}", thread.id, thread.name);
            }
        }
        ReplCommand::Backtrace(thread) => {
            for frame in session.stack_trace(thread).await? {
                println!("  #{} {} at {}:{}", frame.id, frame.name, frame.source, frame.line);
            }
        }
        ReplCommand::Set { thread, name, value } => {
            let frames = session.stack_trace(thread).await?;
            let frame = frames
                .first()
                .ok_or_else(|| anyhow!("thread {thread} has no frames"))?;
            let value = session.set_expression(thread, frame.id, name, value).await?;
            println!("  = {value}");
        }
        ReplCommand::Detach { suspend } => {
            session.disconnect(None, suspend).await?;
            return Ok(Flow::Done);
        }
        ReplCommand::Kill => {
            session.disconnect(Some(true), false).await?;
            return Ok(Flow::Done);
        }
    }
    Ok(Flow::Continue)
}

// ============================================================================
// Command parsing
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum ReplCommand {
    Break(SourceLocation),
    Delete(SourceLocation),
    Clear,
    Breaks,
    Pause(Option<ThreadId>),
    Continue,
    Step(ThreadId),
    Threads,
    Backtrace(ThreadId),
    Set {
        thread: ThreadId,
        name: String,
        value: String,
    },
    Detach {
        suspend: bool,
    },
    Kill,
}

fn location(arg: Option<&str>) -> Result<SourceLocation> {
    let arg = arg.ok_or_else(|| anyhow!("expected <source>:<line>"))?;
    let (source, line) = arg
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected <source>:<line>, got {arg}"))?;
    let line: u32 = line.parse().with_context(|| format!("bad line in {arg}"))?;
    if source.is_empty() || line == 0 {
        bail!("expected <source>:<line>, got {arg}");
    }
    Ok(SourceLocation::new(source, line))
}

fn thread(arg: Option<&str>) -> Result<ThreadId> {
    let arg = arg.ok_or_else(|| anyhow!("expected a thread id"))?;
    Ok(ThreadId(arg.parse().with_context(|| format!("bad thread id {arg}"))?))
}

impl FromStr for ReplCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default();
        let command = match verb {
            "break" | "b" => Self::Break(location(words.next())?),
            "delete" | "d" => Self::Delete(location(words.next())?),
            "clear" => Self::Clear,
            "breaks" => Self::Breaks,
            "pause" => Self::Pause(words.next().map(|w| thread(Some(w))).transpose()?),
            "continue" | "c" => Self::Continue,
            "step" | "s" => Self::Step(thread(words.next())?),
            "threads" => Self::Threads,
            "bt" => Self::Backtrace(thread(words.next())?),
            "set" => {
                let thread = thread(words.next())?;
                let name = words.next().ok_or_else(|| anyhow!("expected a name"))?;
                let value = words.next().ok_or_else(|| anyhow!("expected a value"))?;
                Self::Set {
                    thread,
                    name: name.to_string(),
                    value: value.to_string(),
                }
            }
            "detach" => Self::Detach {
                suspend: words.next() == Some("suspend"),
            },
            "kill" => Self::Kill,
            other => bail!("unknown command {other:?}"),
        };
        Ok(command)
    }
}
