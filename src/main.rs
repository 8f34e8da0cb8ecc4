use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use openport::{client, server, ui};

#[derive(Parser, Debug)]
#[command(
    name = "openport",
    version = env!("CARGO_PKG_VERSION"),
    about = "Expose a local HTTP service to the public internet",
    long_about = "openport creates a tunnel from a public subdomain to a service running on your machine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "OPENPORT_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the rendezvous server
    Server {
        /// Public HTTP address; defaults to ":$PORT" or ":8080"
        #[arg(long)]
        addr: Option<String>,

        /// Address for tunnel client connections
        #[arg(long, default_value = ":9090")]
        tunnel_addr: String,

        /// Base domain for subdomain routing
        #[arg(long, env = "DOMAIN", default_value = "localhost")]
        domain: String,
    },

    /// Expose a local port through a tunnel server
    Http {
        /// Local port to expose
        port: u16,

        /// Tunnel server address
        #[arg(short, long, env = "OPENPORT_SERVER", default_value = "localhost:9090")]
        server: String,

        /// Request a specific subdomain
        #[arg(short = 'd', long)]
        subdomain: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(cli.log_level.parse()?)
                .from_env_lossy(),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Server {
            addr,
            tunnel_addr,
            domain,
        } => {
            // Cloud platforms hand out the public port via $PORT.
            let addr = addr.unwrap_or_else(|| {
                let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
                format!(":{port}")
            });

            let srv = server::Server::bind(server::Config {
                addr,
                tunnel_addr,
                domain,
            })
            .await?;

            tokio::select! {
                result = srv.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down server");
                    let _ = tokio::time::timeout(Duration::from_secs(5), srv.shutdown()).await;
                    Ok(())
                }
            }
        }

        Commands::Http {
            port,
            server,
            subdomain,
        } => {
            let local_addr = format!("localhost:{port}");
            let tunnel_client = client::Client::new(client::Config {
                server_addr: server,
                local_addr: local_addr.clone(),
                subdomain: subdomain.unwrap_or_default(),
                events: Arc::new(ui::ConsoleUi::new(local_addr)),
            });

            tokio::select! {
                result = tunnel_client.connect() => {
                    if let Err(e) = result {
                        ui::print_error(&e);
                        std::process::exit(1);
                    }
                    Ok(())
                }
                _ = tokio::signal::ctrl_c() => {
                    tunnel_client.close().await;
                    ui::print_shutdown();
                    Ok(())
                }
            }
        }
    }
}
