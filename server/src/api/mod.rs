//! HTTP API.

mod binary_cache;

use axum::Router;

pub(crate) fn get_router() -> Router {
    binary_cache::get_router()
}
