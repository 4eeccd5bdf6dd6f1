//! Live tree, upload, bulk and archive handlers.

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Path, Query};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Json as JsonResponse, Response};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::StreamReader;
use tracing::info;

use crate::archive::{ArchiveBuilder, ArchiveTicket};
use crate::audit::{AuditEvent, AuditSink};
use crate::bulk::{BulkAction, BulkCoordinator, BulkOutcome};
use crate::context::RequestContext;
use crate::error::ApiError;
use crate::http::attachment_response;
use crate::path;
use crate::quota::{Account, QuotaLedger};
use crate::tree::{StorageTree, TreeEntry, UploadOutcome};

const DEFAULT_SEARCH_LIMIT: usize = 100;

#[derive(Deserialize)]
pub(crate) struct OptionalPathQuery {
    path: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct RequiredPathQuery {
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct SearchQuery {
    q: String,
    limit: Option<usize>,
}

#[derive(Deserialize)]
pub(crate) struct UploadQuery {
    dir: Option<String>,
    name: String,
}

#[derive(Deserialize)]
pub(crate) struct CreateFolderBody {
    #[serde(default)]
    parent: String,
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RenameBody {
    path: String,
    new_name: String,
}

#[derive(Deserialize)]
pub(crate) struct TransferBody {
    path: String,
    #[serde(default)]
    destination: String,
}

#[derive(Deserialize)]
pub(crate) struct BulkBody {
    action: BulkAction,
    items: Vec<String>,
    destination: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct PathBody {
    path: String,
}

#[derive(Serialize)]
pub(crate) struct PathResponse {
    path: String,
}

pub async fn list_files(
    Extension(ctx): Extension<RequestContext>,
    Extension(tree): Extension<StorageTree>,
    Query(query): Query<OptionalPathQuery>,
) -> Result<JsonResponse<Vec<TreeEntry>>, ApiError> {
    let entries = tree.list(&ctx, query.path.as_deref().unwrap_or("")).await?;
    Ok(JsonResponse(entries))
}

pub async fn search_files(
    Extension(ctx): Extension<RequestContext>,
    Extension(tree): Extension<StorageTree>,
    Query(query): Query<SearchQuery>,
) -> Result<JsonResponse<Vec<TreeEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).min(DEFAULT_SEARCH_LIMIT);
    let results = tree.search(&ctx, &query.q, limit).await?;
    Ok(JsonResponse(results))
}

pub async fn download_file(
    Extension(ctx): Extension<RequestContext>,
    Extension(tree): Extension<StorageTree>,
    Query(RequiredPathQuery { path }): Query<RequiredPathQuery>,
) -> Result<Response, ApiError> {
    let (relative, target) = tree.locate(&ctx, &path).await?;
    let metadata = fs::metadata(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    if metadata.is_dir() {
        return Err(ApiError::BadRequest("path is not a file".into()));
    }
    let file = File::open(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let name = path::file_name(&relative);
    let mime = mime_guess::from_path(name).first_or_octet_stream();
    info!(user_id = ctx.user_id, path = relative, size = metadata.len(), "download file");
    attachment_response(file, metadata.len(), name, mime.essence_str())
}

pub async fn create_folder(
    Extension(ctx): Extension<RequestContext>,
    Extension(tree): Extension<StorageTree>,
    Json(body): Json<CreateFolderBody>,
) -> Result<(StatusCode, JsonResponse<PathResponse>), ApiError> {
    let path = tree.create_folder(&ctx, &body.parent, &body.name).await?;
    Ok((StatusCode::CREATED, JsonResponse(PathResponse { path })))
}

pub async fn rename_entry(
    Extension(ctx): Extension<RequestContext>,
    Extension(tree): Extension<StorageTree>,
    Json(body): Json<RenameBody>,
) -> Result<JsonResponse<PathResponse>, ApiError> {
    let path = tree.rename(&ctx, &body.path, &body.new_name).await?;
    Ok(JsonResponse(PathResponse { path }))
}

pub async fn move_entry(
    Extension(ctx): Extension<RequestContext>,
    Extension(tree): Extension<StorageTree>,
    Json(body): Json<TransferBody>,
) -> Result<JsonResponse<PathResponse>, ApiError> {
    let path = tree.move_entry(&ctx, &body.path, &body.destination).await?;
    Ok(JsonResponse(PathResponse { path }))
}

pub async fn copy_entry(
    Extension(ctx): Extension<RequestContext>,
    Extension(tree): Extension<StorageTree>,
    Json(body): Json<TransferBody>,
) -> Result<JsonResponse<PathResponse>, ApiError> {
    let path = tree.copy(&ctx, &body.path, &body.destination).await?;
    Ok(JsonResponse(PathResponse { path }))
}

/// Stores the request body at `dir/name`. `Content-Length` is required: the
/// quota check happens before the body is read.
pub async fn upload_file(
    Extension(ctx): Extension<RequestContext>,
    Extension(tree): Extension<StorageTree>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: AxumBody,
) -> Result<(StatusCode, JsonResponse<UploadOutcome>), ApiError> {
    let declared_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .ok_or_else(|| ApiError::BadRequest("content-length is required".into()))?;
    let stream = body.into_data_stream().map_err(io::Error::other);
    let reader = StreamReader::new(stream);
    let outcome = tree
        .upload(
            &ctx,
            query.dir.as_deref().unwrap_or(""),
            &query.name,
            declared_size,
            reader,
        )
        .await?;
    Ok((StatusCode::CREATED, JsonResponse(outcome)))
}

pub async fn bulk_action(
    Extension(ctx): Extension<RequestContext>,
    Extension(bulk): Extension<BulkCoordinator>,
    Json(body): Json<BulkBody>,
) -> Result<JsonResponse<BulkOutcome>, ApiError> {
    if body.items.is_empty() {
        return Err(ApiError::BadRequest("no items selected".into()));
    }
    let outcome = bulk
        .apply(&ctx, body.action, &body.items, body.destination.as_deref())
        .await?;
    Ok(JsonResponse(outcome))
}

/// Zips one folder and returns a download ticket for it.
pub async fn archive_folder(
    Extension(ctx): Extension<RequestContext>,
    Extension(tree): Extension<StorageTree>,
    Extension(archives): Extension<ArchiveBuilder>,
    Extension(audit): Extension<Arc<dyn AuditSink>>,
    Json(PathBody { path }): Json<PathBody>,
) -> Result<JsonResponse<ArchiveTicket>, ApiError> {
    let entry = tree.stat(&ctx, &path).await?;
    if !entry.is_dir {
        return Err(ApiError::BadRequest("path is not a folder".into()));
    }
    let ticket = archives
        .build_archive(&ctx, std::slice::from_ref(&entry.path), &entry.name)
        .await?;
    audit.record(
        AuditEvent::new(ctx.user_id, "download_folder")
            .item(&entry.name, path::parent(&entry.path)),
    );
    Ok(JsonResponse(ticket))
}

/// Serves a prepared archive exactly once.
pub async fn take_download(
    Extension(ctx): Extension<RequestContext>,
    Extension(archives): Extension<ArchiveBuilder>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    let handle = archives.take(&ctx, &token).await?;
    let filename = handle.filename.clone();
    let (file, size) = handle.open().await?;
    info!(user_id = ctx.user_id, size, "archive download");
    attachment_response(file, size, &filename, "application/zip")
}

pub async fn account_usage(
    Extension(ctx): Extension<RequestContext>,
    Extension(ledger): Extension<QuotaLedger>,
) -> Result<JsonResponse<Account>, ApiError> {
    Ok(JsonResponse(ledger.account(ctx.user_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::{CTX, fixture, write};
    use std::time::Duration;

    #[tokio::test]
    async fn upload_requires_content_length() {
        let f = fixture().await;
        let result = upload_file(
            Extension(CTX),
            Extension(f.tree.clone()),
            Query(UploadQuery {
                dir: None,
                name: "a.txt".to_string(),
            }),
            HeaderMap::new(),
            AxumBody::from("data"),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        assert!(!f.live.join("a.txt").exists());
    }

    #[tokio::test]
    async fn upload_streams_body_into_tree() {
        let f = fixture().await;
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, "4".parse().unwrap());
        let (status, JsonResponse(outcome)) = upload_file(
            Extension(CTX),
            Extension(f.tree.clone()),
            Query(UploadQuery {
                dir: Some("inbox".to_string()),
                name: "a.txt".to_string(),
            }),
            headers,
            AxumBody::from("data"),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(outcome.path, "inbox/a.txt");
        assert_eq!(std::fs::read(f.live.join("inbox/a.txt")).unwrap(), b"data");
    }

    #[tokio::test]
    async fn archive_download_is_served_once() {
        let f = fixture().await;
        write(&f, "docs/a.txt", b"a");
        let archives = ArchiveBuilder::new(f.layout.clone(), Duration::from_secs(600));
        let sink: Arc<dyn AuditSink> = Arc::new(f.audit.clone());

        let JsonResponse(ticket) = archive_folder(
            Extension(CTX),
            Extension(f.tree.clone()),
            Extension(archives.clone()),
            Extension(sink),
            Json(PathBody {
                path: "docs".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(ticket.filename, "docs.zip");
        assert_eq!(f.audit.actions(), ["download_folder"]);

        let response = take_download(
            Extension(CTX),
            Extension(archives.clone()),
            Path(ticket.token.clone()),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let again = take_download(Extension(CTX), Extension(archives), Path(ticket.token)).await;
        assert!(matches!(again, Err(ApiError::NotFound(_))));
    }
}
