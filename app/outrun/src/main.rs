use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use outrun_fs::{FsServer, PrefetchLimits, ServerConfig};
use outrun_protocol::OUTRUN_ERROR_CODE;
use outrun_remotefs::{Config, Session, SessionOptions};
use outrun_transport::FrameListener;

/// The session collaborator launches both halves: `serve` on the local
/// host over the tunneled socket, `mount` inside the remote chroot.
#[derive(Debug, Parser)]
#[command(name = "outrun")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Expose the local filesystem to a remote session.
    Serve {
        /// Address to listen on (tunnel endpoint).
        #[arg(long, default_value = "127.0.0.1:0")]
        listen: std::net::SocketAddr,

        /// Session token; falls back to $OUTRUN_TOKEN.
        #[arg(long)]
        token: Option<String>,

        /// Maximum concurrently served requests.
        #[arg(long, default_value_t = 16)]
        workers: usize,

        /// Config file location.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Mount the projected filesystem on the remote host.
    Mount {
        /// Local host's RPC endpoint (tunnel endpoint).
        #[arg(long)]
        connect: std::net::SocketAddr,

        /// Session token; falls back to $OUTRUN_TOKEN.
        #[arg(long)]
        token: Option<String>,

        /// Where to mount.
        mount_point: PathBuf,

        /// Config file location.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn session_token(flag: Option<String>) -> Result<String> {
    flag.or_else(|| std::env::var("OUTRUN_TOKEN").ok())
        .context("no session token: pass --token or set OUTRUN_TOKEN")
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outrun=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("outrun: {e:#}");
            ExitCode::from(u8::try_from(OUTRUN_ERROR_CODE).unwrap_or(1))
        }
    }
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Serve {
            listen,
            token,
            workers,
            config,
        } => {
            let token = session_token(token)?;
            let config = Config::load(&config.unwrap_or_else(Config::default_path));
            let listener = FrameListener::bind(listen)
                .await
                .context("failed to bind listener")?;

            // The collaborator scrapes this line to set up the tunnel.
            println!("{}", listener.local_addr().context("no local address")?);

            let server = FsServer::new(
                token,
                ServerConfig {
                    workers,
                    limits: PrefetchLimits {
                        max_entries: config.prefetch.max_entries,
                        max_bytes: config.prefetch.max_bytes,
                        ..PrefetchLimits::default()
                    },
                    min_ratio: config.compression.min_ratio,
                },
            );
            server.serve(listener).await.context("server failed")?;
            Ok(())
        }

        Command::Mount {
            connect,
            token,
            mount_point,
            config,
        } => {
            let token = session_token(token)?;
            let config = Config::load(&config.unwrap_or_else(Config::default_path));

            let session = Session::new(SessionOptions {
                addr: connect,
                token,
                mount_point,
                config,
            });
            session.run().await.context("session failed")?;
            Ok(())
        }
    }
}
