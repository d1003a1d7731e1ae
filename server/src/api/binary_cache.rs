//! Nix HTTP binary cache protocol.
//!
//! Translates `GET /nix-cache-info`, `GET /{hash}.narinfo`, `GET /nar/{path}`
//! and the maintenance `PUT`/`DELETE` counterparts onto [`CacheController`]
//! operations. Based on the protocol described at
//! <https://github.com/fzakaria/nix-http-binary-cache-api-spec>.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::StreamBody,
    extract::{BodyStream, Extension, Path},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::TryStreamExt;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio_util::io::StreamReader;
use tracing::instrument;

use crate::controller::{parse_nar_url, CacheController};
use crate::error::{ServerError, ServerResult};
use crate::narinfo::NarInfo;
use pullcache_core::mime;

type Controller = Arc<CacheController<DatabaseConnection>>;

/// `StoreDir` reported in `nix-cache-info`. Nix store paths are hardcoded
/// to `/nix/store` in practice; there is no supported way to relocate it.
const STORE_DIR: &str = "/nix/store";

#[derive(Debug, Clone, Serialize)]
struct NixCacheInfo {
    #[serde(rename = "WantMassQuery")]
    want_mass_query: bool,
    #[serde(rename = "StoreDir")]
    store_dir: PathBuf,
    #[serde(rename = "Priority")]
    priority: i32,
}

impl IntoResponse for NixCacheInfo {
    fn into_response(self) -> Response {
        match crate::nix_manifest::to_string(&self) {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", mime::NIX_CACHE_INFO)
                .body(body)
                .unwrap()
                .into_response(),
            Err(e) => e.into_response(),
        }
    }
}

async fn get_nix_cache_info() -> NixCacheInfo {
    NixCacheInfo {
        want_mass_query: true,
        store_dir: STORE_DIR.into(),
        priority: 40,
    }
}

/// Splits `{hash}.narinfo` into its hash component.
fn hash_from_narinfo_path(path: &str) -> ServerResult<&str> {
    path.strip_suffix(".narinfo")
        .ok_or(ServerError::NotFound)
}

#[instrument(skip(controller))]
async fn get_narinfo(Extension(controller): Extension<Controller>, Path(path): Path<String>) -> ServerResult<NarInfo> {
    let hash = hash_from_narinfo_path(&path)?;
    controller.get_info_record(hash).await
}

#[instrument(skip(controller, body))]
async fn put_narinfo(
    Extension(controller): Extension<Controller>,
    Path(_path): Path<String>,
    body: String,
) -> ServerResult<StatusCode> {
    controller.put_info_record(&body).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(controller))]
async fn delete_narinfo(Extension(controller): Extension<Controller>, Path(path): Path<String>) -> ServerResult<StatusCode> {
    let hash = hash_from_narinfo_path(&path)?;
    controller.delete_info_record(hash).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(controller))]
async fn get_nar(Extension(controller): Extension<Controller>, Path(path): Path<String>, uri: Uri) -> ServerResult<Response> {
    let relative_url = with_query(&path, &uri);
    let (hash, compression, query) = parse_nar_url(&relative_url)?;

    let stream = controller.get_nar(&hash, &compression, &query).await?;
    let stream = stream.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));

    Ok((
        [("Content-Type", mime::NAR)],
        StreamBody::new(stream),
    )
        .into_response())
}

#[instrument(skip(controller, body))]
async fn put_nar(
    Extension(controller): Extension<Controller>,
    Path(path): Path<String>,
    uri: Uri,
    body: BodyStream,
) -> ServerResult<StatusCode> {
    let relative_url = with_query(&path, &uri);
    let (hash, compression, query) = parse_nar_url(&relative_url)?;

    let body = body.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let mut reader = StreamReader::new(body);
    controller.put_nar(&hash, &compression, &query, &mut reader).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(controller))]
async fn delete_nar(Extension(controller): Extension<Controller>, Path(path): Path<String>, uri: Uri) -> ServerResult<StatusCode> {
    let relative_url = with_query(&path, &uri);
    let (hash, compression, query) = parse_nar_url(&relative_url)?;

    controller.delete_nar(&hash, &compression, &query).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn with_query(path: &str, uri: &Uri) -> String {
    match uri.query() {
        Some(q) => format!("nar/{path}?{q}"),
        None => format!("nar/{path}"),
    }
}

pub fn get_router() -> Router {
    Router::new()
        .route("/nix-cache-info", get(get_nix_cache_info))
        .route("/nar/:path", get(get_nar).put(put_nar).delete(delete_nar))
        .route("/:path", get(get_narinfo).put(put_narinfo).delete(delete_narinfo))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_from_narinfo_path_strips_the_suffix() {
        assert_eq!(hash_from_narinfo_path("abc123.narinfo").unwrap(), "abc123");
    }

    #[test]
    fn hash_from_narinfo_path_rejects_the_wrong_suffix() {
        assert!(hash_from_narinfo_path("abc123.json").is_err());
    }

    #[test]
    fn with_query_appends_the_query_string_when_present() {
        let uri: Uri = "/nar/abc123.nar.xz?foo=bar".parse().unwrap();
        assert_eq!(with_query("abc123.nar.xz", &uri), "nar/abc123.nar.xz?foo=bar");
    }

    #[test]
    fn with_query_omits_the_separator_when_absent() {
        let uri: Uri = "/nar/abc123.nar.xz".parse().unwrap();
        assert_eq!(with_query("abc123.nar.xz", &uri), "nar/abc123.nar.xz");
    }
}
