//! SMUX command line tool
//!
//! Attaches a multiplexer engine to a serial port (or to an in-process
//! simulated peer), opens one logical channel, sends stdin lines on it and
//! prints whatever arrives.

mod config;
mod ports;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use smux_engine::{options, MuxEngine, SerialTransport};
use smux_sim::EnginePair;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::session::{run_echo_peer, Session};

#[derive(Parser, Debug)]
#[command(name = "smux", version, about = "SMUX serial multiplexer")]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Print engine statistics as JSON on exit
    #[arg(long, global = true)]
    stats: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports
    Ports,
    /// Multiplex over a serial port
    Run(RunArgs),
    /// Talk to an in-process peer that echoes every channel
    Loopback(LoopbackArgs),
}

#[derive(Args, Debug)]
struct EngineArgs {
    /// Logical channel to open
    #[arg(long, short = 'c', default_value = "0")]
    channel: u8,

    /// Negotiate link sleep with the peer
    #[arg(long)]
    power_collapse: bool,

    /// Ask the peer to echo the channel back
    #[arg(long)]
    remote_loopback: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Serial port path (e.g. /dev/ttyUSB0, COM3)
    port: String,

    #[arg(long, short = 'b', default_value = "115200")]
    baud: u32,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args, Debug)]
struct LoopbackArgs {
    #[command(flatten)]
    engine: EngineArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "smux=info,smux_protocol=info,smux_engine=info,smux_sim=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Ports => ports::print_ports(),
        Command::Run(args) => {
            let config = config::load(cli.config.as_deref(), &args.engine)?;
            let transport = Arc::new(
                SerialTransport::open(&args.port, args.baud)
                    .with_context(|| format!("opening {}", args.port))?,
            );
            let engine = MuxEngine::start(config, transport.clone());
            transport
                .spawn_reader(engine.clone())
                .context("starting serial reader")?;
            info!("Attached to {} at {} baud", args.port, args.baud);

            let result = run_channel(&engine, &args.engine).await;
            finish(&engine, cli.stats)?;
            result
        }
        Command::Loopback(args) => {
            let config = config::load(cli.config.as_deref(), &args.engine)?;
            let pair = EnginePair::start(config.clone(), config);
            run_echo_peer(pair.b.clone(), args.engine.channel)?;
            info!("Started in-process peer echoing channel {}", args.engine.channel);

            let result = run_channel(&pair.a, &args.engine).await;
            finish(&pair.a, cli.stats)?;
            pair.shutdown();
            result
        }
    }
}

async fn run_channel(engine: &MuxEngine, args: &EngineArgs) -> anyhow::Result<()> {
    if args.remote_loopback {
        engine.set_option(args.channel, options::REMOTE_LOOPBACK, 0)?;
    }
    let mut session = Session::open(engine.clone(), args.channel)?;
    session.run().await
}

fn finish(engine: &MuxEngine, stats: bool) -> anyhow::Result<()> {
    if stats {
        eprintln!("{}", serde_json::to_string_pretty(&engine.stats())?);
    }
    engine.shutdown();
    Ok(())
}
