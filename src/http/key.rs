//! Request key functions.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;

/// Derives the limiting key for a request. An empty key means the request
/// is not limited.
pub type KeyFn = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;

/// Key requests by client address.
///
/// Joins the peer IP, the first `X-Forwarded-For` entry and `X-Real-IP` with
/// commas. Both headers are client controlled unless a proxy in front
/// overwrites them, so a client can mint new keys by varying them.
pub fn ip_key<B>(req: &Request<B>) -> String {
    let mut key = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();

    if let Some(forwarded) = header(req, "x-forwarded-for") {
        let first = forwarded.split([',', ';']).next().unwrap_or_default();
        key.push(',');
        key.push_str(first);
    }

    if let Some(real_ip) = header(req, "x-real-ip") {
        key.push(',');
        key.push_str(real_ip);
    }

    key
}

fn header<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}
