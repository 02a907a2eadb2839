//! HTTP server and application wiring.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::bandwidth::BandwidthLayer;
use super::key::ip_key;
use super::middleware::RateLimitLayer;
use crate::config::{StoreBackend, StoreConfig, TokenwardenConfig};
use crate::error::{Result, TokenwardenError};
use crate::ratelimit::{BucketStore, DistributedStore, MemoryStore, RedisBackend};

/// Size of the `/download` payload.
const DOWNLOAD_SIZE: usize = 64 * 1024;

/// HTTP server for a rate limited router.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    router: Router,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Serve until `signal` resolves, then drain open connections.
    ///
    /// Peer addresses are recorded as `ConnectInfo<SocketAddr>` for the
    /// key functions.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %listener.local_addr()?, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            self.router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TokenwardenError::Io(e)
        })
    }
}

/// Primary store and fallbacks for one chain.
type Stores = (Arc<dyn BucketStore>, Vec<Arc<dyn BucketStore>>);

/// Hands out fresh stores, one set per chain, since a store takes a single
/// rate.
enum StoreFactory {
    Memory,
    Redis {
        backend: RedisBackend,
        prefix: String,
        memory_fallback: bool,
    },
}

impl StoreFactory {
    /// Redis is not contacted here; the first take connects, and until
    /// then failures go to the memory fallback like any other fault.
    fn from_config(config: &StoreConfig) -> Result<Self> {
        match config.backend {
            StoreBackend::Memory => Ok(Self::Memory),
            StoreBackend::Redis => {
                let url = config.redis_url.as_deref().ok_or_else(|| {
                    TokenwardenError::Config("store: redis backend requires redis_url".to_string())
                })?;
                Ok(Self::Redis {
                    backend: RedisBackend::open(url)?,
                    prefix: config.key_prefix.clone(),
                    memory_fallback: config.memory_fallback,
                })
            }
        }
    }

    fn stores(&self) -> Stores {
        match self {
            Self::Memory => {
                let primary: Arc<dyn BucketStore> = Arc::new(MemoryStore::new());
                (primary, Vec::new())
            }
            Self::Redis {
                backend,
                prefix,
                memory_fallback,
            } => {
                let primary: Arc<dyn BucketStore> =
                    Arc::new(DistributedStore::with_prefix(backend.clone(), prefix.clone()));
                let fallbacks: Vec<Arc<dyn BucketStore>> = if *memory_fallback {
                    vec![Arc::new(MemoryStore::new())]
                } else {
                    Vec::new()
                };
                (primary, fallbacks)
            }
        }
    }
}

/// Build the service router: `/` is request limited and `/download` is
/// bandwidth throttled, both keyed by client address.
///
/// Must run inside a Tokio runtime, which the memory stores' decay tasks
/// are spawned on.
pub fn build_app(config: &TokenwardenConfig) -> Result<Router> {
    let factory = StoreFactory::from_config(&config.store)?;

    let (primary, fallbacks) = factory.stores();
    let requests = RateLimitLayer::builder(ip_key)
        .rate(config.requests.to_rate()?)
        .limit_by(primary, fallbacks)?;

    let (primary, fallbacks) = factory.stores();
    let bandwidth = BandwidthLayer::builder(ip_key)
        .rate(config.bandwidth.to_rate()?)
        .quantum(config.bandwidth.quantum_bytes)
        .retry_interval(config.bandwidth.retry_interval())
        .limit_by(primary, fallbacks)?;

    info!(
        requests = %requests.rate(),
        bandwidth = %config.bandwidth.to_rate()?,
        quantum_bytes = config.bandwidth.quantum_bytes,
        backend = ?config.store.backend,
        "Rate limits configured"
    );

    let limited = Router::new().route("/", get(index)).layer(requests);
    let throttled = Router::new()
        .route("/download", get(download))
        .layer(bandwidth);

    Ok(limited.merge(throttled))
}

async fn index() -> &'static str {
    "ok\n"
}

async fn download() -> Vec<u8> {
    vec![b'x'; DOWNLOAD_SIZE]
}
