//! Buildwire Server - drives a build system for IDE clients.
//!
//! Speaks framed JSON over the process stdio by default, or over a named
//! pipe with `--pipe`. Logs go to stderr so stdout stays a clean protocol
//! channel.

use anyhow::{Context, Result};
use buildwire_core::platform;
use buildwire_core::{
    BuildSystem, BuildSystemFactory, CommandBuildSystem, Connection, PipeConnection, ProtocolV1,
    Server, StdioConnection,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Protocol 1 minors served by default.
const PROTOCOL_V1_MINORS: &[u32] = &[0, 1, 2];

#[derive(Parser, Debug)]
#[command(name = "buildwire-server")]
#[command(about = "Build system server for IDE integration")]
struct Args {
    /// Listen on a named pipe instead of stdio (platform default if no
    /// endpoint is given)
    #[arg(long, value_name = "ENDPOINT", num_args = 0..=1)]
    pipe: Option<Option<String>>,

    /// Offer experimental protocol versions
    #[arg(long)]
    experimental: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Build tool executable used for configure runs
    #[arg(long, value_name = "PROGRAM", default_value = "cmake")]
    cmake: PathBuf,
}

fn build_system_factory(program: PathBuf) -> BuildSystemFactory {
    Arc::new(move || Box::new(CommandBuildSystem::new(program.clone())) as Box<dyn BuildSystem>)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!(
        "Starting buildwire server on {} (build tool {:?})",
        platform::current_platform(),
        args.cmake
    );

    let mut server = Server::new(args.experimental);
    let factory = build_system_factory(args.cmake);
    for minor in PROTOCOL_V1_MINORS {
        server.register_protocol(Box::new(ProtocolV1::new(*minor, Arc::clone(&factory))));
    }

    let connection: Box<dyn Connection> = match args.pipe {
        Some(endpoint) => {
            let endpoint = endpoint.unwrap_or_else(platform::default_pipe_name);
            info!("Using pipe {}", endpoint);
            Box::new(PipeConnection::new(endpoint))
        }
        None => Box::new(StdioConnection::new()),
    };
    server.add_connection(connection);

    server.serve().context("Server stopped with an error")?;
    Ok(())
}
