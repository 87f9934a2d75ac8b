//! hostgate: multi-hostname TLS termination with automatic ACME renewal.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!                 │                       hostgate                       │
//!  :80 / fd 3     │  ┌───────────┐   challenge, /update_certificate,     │
//! ───────────────▶│  │ plaintext │── 301 → https                        │
//!                 │  └─────┬─────┘                                       │
//!                 │        │ renew(host)        ┌──────────────────┐     │
//!                 │        └───────────────────▶│ acme::renewal    │────▶│ ACME
//!                 │                             │ state machine    │◀────│ directory
//!                 │  ┌───────────┐  SNI lookup  └────────┬─────────┘     │
//!  :443 / fd 4    │  │   tls     │◀──────────┐           │ pending       │
//! ───────────────▶│  │ listener  │     ┌─────┴───────────▼─┐ challenge,  │
//!                 │  └─────┬─────┘     │  site registry    │ new cert    │
//!                 │        │ dispatch  └───────────────────┘             │
//!                 │        ▼                                             │
//!                 │  site handlers (Exchange: hostname, peer, local)     │
//!                 └──────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures_util::future::join_all;

use hostgate::acme::{LetsEncryptIssuer, RenewalScheduler};
use hostgate::config::{load_config, SiteConfig};
use hostgate::lifecycle::shutdown_signal;
use hostgate::net::tls::install_crypto_provider;
use hostgate::net::BoundSockets;
use hostgate::observability::{logging, metrics};
use hostgate::security::trust::{spawn_probe, TrustOracle};
use hostgate::site::{HandlerChain, TextHandler};
use hostgate::Server;

#[derive(Debug, Parser)]
#[command(name = "hostgate", version, about = "Multi-hostname TLS server with ACME renewal")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "hostgate.toml")]
    config: PathBuf,
}

fn greeting(site: &SiteConfig) -> TextHandler {
    let body = site.body.clone().unwrap_or_else(|| {
        format!(
            "{} is served by hostgate\n",
            site.hostnames.first().map(String::as_str).unwrap_or("this site")
        )
    });
    TextHandler::new(body)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = %args.config.display(), "hostgate starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    install_crypto_provider();

    let sockets = BoundSockets::acquire(&config.listener)?;
    let trust = TrustOracle::new();
    let issuer = Arc::new(LetsEncryptIssuer::new(&config.acme));
    let server = Server::new(&config, &sockets, issuer, trust.clone());

    let registrations = join_all(config.sites.iter().map(|site| {
        let server = server.clone();
        async move {
            let result = server
                .register(site, HandlerChain::new().with(greeting(site)))
                .await;
            (site, result)
        }
    }))
    .await;

    let mut registered = 0;
    for (site, result) in registrations {
        match result {
            Ok(()) => registered += 1,
            Err(e) => tracing::error!(hostnames = ?site.hostnames, error = %e, "Site registration failed"),
        }
    }
    if registered == 0 {
        return Err("no site could be registered".into());
    }

    spawn_probe(trust, &config.trust);

    if config.renewal.enabled {
        let scheduler = RenewalScheduler::new(
            server.certificate_manager(),
            server.registry().clone(),
            &config.renewal,
        );
        tokio::spawn(scheduler.run(server.shutdown()));
    }

    {
        let server = server.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            server.stop();
        });
    }

    tracing::info!(
        http_port = server.http_port(),
        https_port = server.https_port(),
        hostnames = ?server.registered_hostnames(),
        "Serving"
    );
    server.run(sockets).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
