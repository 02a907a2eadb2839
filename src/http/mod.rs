//! HTTP middleware and server for request and bandwidth limiting.

mod bandwidth;
mod key;
mod middleware;
mod server;

pub use bandwidth::{throttled_body, BandwidthLayer, BandwidthLayerBuilder, BandwidthService};
pub use key::{ip_key, KeyFn};
pub use middleware::{RateLimitLayer, RateLimitLayerBuilder, RateLimitService};
pub use server::{build_app, HttpServer};
