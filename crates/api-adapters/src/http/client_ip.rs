use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use domains::DomainError;

use super::error::ApiError;
use super::AppState;

/// Address of the client that sent the request.
///
/// Behind a reverse proxy this is the first hop in `X-Forwarded-For`,
/// otherwise the peer address of the connection. The server must be started
/// with `into_make_service_with_connect_info::<SocketAddr>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

/// First address in `X-Forwarded-For`, if it parses.
pub fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let raw = headers.get("x-forwarded-for")?.to_str().ok()?;
    raw.split(',').next()?.trim().parse().ok()
}

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let ip = if state.reverse_proxied {
            forwarded_for(&parts.headers)
                .ok_or_else(|| DomainError::Internal("proxied request without X-Forwarded-For".into()))?
        } else {
            ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
                .await
                .map(|ConnectInfo(addr)| addr.ip())
                .map_err(|_| DomainError::Internal("no peer address on request".into()))?
        };
        Ok(ClientIp(ip.to_string()))
    }
}
