//! HTTP middleware.

use anyhow::anyhow;
use axum::{
    extract::{Extension, Host},
    http::Request,
    middleware::Next,
    response::Response,
};

use crate::error::{ServerError, ServerResult};
use crate::State;

/// Restricts valid `Host` headers to the configured allow-list.
///
/// An empty allow-list permits any `Host` header.
pub async fn restrict_host<B>(
    Extension(state): Extension<State>,
    Host(host): Host,
    req: Request<B>,
    next: Next<B>,
) -> ServerResult<Response> {
    let allowed_hosts = &state.config.allowed_hosts;

    if !allowed_hosts.is_empty() && !allowed_hosts.iter().any(|h| h.as_str() == host) {
        return Err(ServerError::RequestError(anyhow!("bad Host header")));
    }

    Ok(next.run(req).await)
}
