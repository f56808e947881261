//! Defines the bridge's web interface: the REST surface under the route
//! table in `api`, and the live canvas WebSocket at `/canvas`.

mod api;
pub mod interface;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

pub use api::AppContext;

pub struct LiveServer {
    context: Arc<AppContext>,
}

impl LiveServer {
    pub fn new(context: AppContext) -> Self {
        LiveServer {
            context: Arc::new(context),
        }
    }

    /// Binds the listener and serves connections until the process exits.
    /// Returns an error only when binding fails (a startup failure).
    pub async fn start(self, address: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(address).await?;
        log::info!("Listening: http://{address}");

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::warn!("failed to accept connection: {err}");
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            let context = Arc::clone(&self.context);

            tokio::spawn(async move {
                let service = service_fn(move |request: Request<Incoming>| {
                    let context = Arc::clone(&context);
                    async move { Ok::<_, std::convert::Infallible>(api::call(context, request).await) }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    log::debug!("Error serving connection: {err}");
                }
            });
        }
    }
}
