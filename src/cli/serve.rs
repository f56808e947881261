use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use crate::config::Config;
use crate::fabric::Fabric;
use crate::session::UpstreamConnector;
use crate::web::{AppContext, LiveServer};

/// Expose the REST and live-canvas surface over the configured upstream.
#[derive(Debug, Parser)]
pub struct ServeCommand {
    /// The IP address to listen on. Overrides `HOST`.
    #[clap(long)]
    pub address: Option<IpAddr>,

    /// The port to listen on. Overrides `PORT`.
    #[clap(long)]
    pub port: Option<u16>,
}

impl ServeCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let config = Config::from_env().context("invalid configuration")?;

        let address: SocketAddr = (
            self.address.unwrap_or(config.host),
            self.port.unwrap_or(config.port),
        )
            .into();

        if config.karakeep.is_some() {
            log::info!("bookmark webhook configuration detected; external ingestion enabled");
        }

        let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
        runtime.block_on(async move {
            let connector = Arc::new(UpstreamConnector::new(config.upstream.clone()));
            let fabric = Fabric::new(connector.clone());

            let server = LiveServer::new(AppContext {
                config,
                connector,
                fabric,
            });
            server.start(address).await
        })
    }
}
