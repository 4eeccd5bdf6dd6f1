//! Trash, version, favorite and quota administration handlers.

use axum::extract::{Extension, Json, Path, Query};
use axum::http::StatusCode;
use axum::response::{Json as JsonResponse, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::favorites::{Favorite, FavoriteStore};
use crate::http::attachment_response;
use crate::layout::UserId;
use crate::quota::{Account, QuotaLedger};
use crate::trash::{PurgeSummary, RestoreSummary, TrashRecord, TrashStore};
use crate::tree::StorageTree;
use crate::versions::{FileVersion, VersionStore};

/// User ids allowed to use the quota override.
#[derive(Clone, Debug, Default)]
pub struct AdminIds(pub Arc<HashSet<UserId>>);

#[derive(Deserialize)]
pub(crate) struct PathBody {
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct PathQuery {
    path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QuotaBody {
    user_id: UserId,
    quota_bytes: u64,
}

#[derive(Serialize)]
pub(crate) struct RestoredResponse {
    path: String,
}

#[derive(Serialize)]
pub(crate) struct VersionRestoreResponse {
    /// Snapshot taken of the content the restore replaced.
    backup: Option<FileVersion>,
}

pub async fn list_trash(
    Extension(ctx): Extension<RequestContext>,
    Extension(trash): Extension<TrashStore>,
) -> Result<JsonResponse<Vec<TrashRecord>>, ApiError> {
    Ok(JsonResponse(trash.list(&ctx).await?))
}

pub async fn trash_entry(
    Extension(ctx): Extension<RequestContext>,
    Extension(trash): Extension<TrashStore>,
    Json(PathBody { path }): Json<PathBody>,
) -> Result<JsonResponse<TrashRecord>, ApiError> {
    Ok(JsonResponse(trash.trash(&ctx, &path).await?))
}

pub async fn restore_trash(
    Extension(ctx): Extension<RequestContext>,
    Extension(trash): Extension<TrashStore>,
    Path(id): Path<i64>,
) -> Result<JsonResponse<RestoredResponse>, ApiError> {
    let path = trash.restore(&ctx, id).await?;
    Ok(JsonResponse(RestoredResponse { path }))
}

pub async fn restore_all_trash(
    Extension(ctx): Extension<RequestContext>,
    Extension(trash): Extension<TrashStore>,
) -> Result<JsonResponse<RestoreSummary>, ApiError> {
    Ok(JsonResponse(trash.restore_all(&ctx).await?))
}

pub async fn purge_trash(
    Extension(ctx): Extension<RequestContext>,
    Extension(trash): Extension<TrashStore>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    trash.purge(&ctx, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn empty_trash(
    Extension(ctx): Extension<RequestContext>,
    Extension(trash): Extension<TrashStore>,
) -> Result<JsonResponse<PurgeSummary>, ApiError> {
    Ok(JsonResponse(trash.purge_all(&ctx).await?))
}

pub async fn list_versions(
    Extension(ctx): Extension<RequestContext>,
    Extension(versions): Extension<VersionStore>,
    Query(PathQuery { path }): Query<PathQuery>,
) -> Result<JsonResponse<Vec<FileVersion>>, ApiError> {
    Ok(JsonResponse(versions.list(&ctx, &path).await?))
}

pub async fn restore_version(
    Extension(ctx): Extension<RequestContext>,
    Extension(versions): Extension<VersionStore>,
    Path(id): Path<i64>,
) -> Result<JsonResponse<VersionRestoreResponse>, ApiError> {
    let backup = versions.restore(&ctx, id).await?;
    Ok(JsonResponse(VersionRestoreResponse { backup }))
}

pub async fn delete_version(
    Extension(ctx): Extension<RequestContext>,
    Extension(versions): Extension<VersionStore>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    versions.delete(&ctx, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn download_version(
    Extension(ctx): Extension<RequestContext>,
    Extension(versions): Extension<VersionStore>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let (file, size, name) = versions.open(&ctx, id).await?;
    let mime = mime_guess::from_path(&name).first_or_octet_stream();
    attachment_response(file, size, &name, mime.essence_str())
}

pub async fn list_favorites(
    Extension(ctx): Extension<RequestContext>,
    Extension(favorites): Extension<FavoriteStore>,
) -> Result<JsonResponse<Vec<Favorite>>, ApiError> {
    Ok(JsonResponse(favorites.list(&ctx).await?))
}

pub async fn add_favorite(
    Extension(ctx): Extension<RequestContext>,
    Extension(tree): Extension<StorageTree>,
    Extension(favorites): Extension<FavoriteStore>,
    Json(PathBody { path }): Json<PathBody>,
) -> Result<StatusCode, ApiError> {
    let entry = tree.stat(&ctx, &path).await?;
    favorites.add(&ctx, &entry).await?;
    Ok(StatusCode::CREATED)
}

pub async fn remove_favorite(
    Extension(ctx): Extension<RequestContext>,
    Extension(favorites): Extension<FavoriteStore>,
    Query(PathQuery { path }): Query<PathQuery>,
) -> Result<StatusCode, ApiError> {
    favorites.remove(&ctx, &path).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Privileged quota override.
pub async fn set_quota(
    Extension(ctx): Extension<RequestContext>,
    Extension(admins): Extension<AdminIds>,
    Extension(ledger): Extension<QuotaLedger>,
    Json(body): Json<QuotaBody>,
) -> Result<JsonResponse<Account>, ApiError> {
    if !admins.0.contains(&ctx.user_id) {
        return Err(ApiError::Forbidden("quota changes require an admin".into()));
    }
    if body.user_id <= 0 {
        return Err(ApiError::BadRequest("invalid user id".into()));
    }
    Ok(JsonResponse(ledger.set_quota(body.user_id, body.quota_bytes).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::{CTX, fixture, write};

    #[tokio::test]
    async fn quota_override_is_admin_only() {
        let f = fixture().await;
        let body = || {
            Json(QuotaBody {
                user_id: 7,
                quota_bytes: 2_048,
            })
        };

        let denied = set_quota(
            Extension(CTX),
            Extension(AdminIds::default()),
            Extension(f.ledger.clone()),
            body(),
        )
        .await;
        assert!(matches!(denied, Err(ApiError::Forbidden(_))));

        let admins = AdminIds(Arc::new(HashSet::from([CTX.user_id])));
        let JsonResponse(account) = set_quota(
            Extension(CTX),
            Extension(admins),
            Extension(f.ledger.clone()),
            body(),
        )
        .await
        .unwrap();
        assert_eq!(account.user_id, 7);
        assert_eq!(account.quota, 2_048);
    }

    #[tokio::test]
    async fn restoring_unknown_trash_id_is_not_found() {
        let f = fixture().await;
        let trash = TrashStore::new(
            f.pool.clone(),
            f.layout.clone(),
            f.ledger.clone(),
            Arc::new(f.audit.clone()),
            30,
        );
        let result = restore_trash(Extension(CTX), Extension(trash), Path(404)).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn restore_all_reports_counts() {
        let f = fixture().await;
        let trash = TrashStore::new(
            f.pool.clone(),
            f.layout.clone(),
            f.ledger.clone(),
            Arc::new(f.audit.clone()),
            30,
        );
        write(&f, "a.txt", b"a");
        trash.trash(&CTX, "a.txt").await.unwrap();

        let JsonResponse(summary) = restore_all_trash(Extension(CTX), Extension(trash))
            .await
            .unwrap();
        assert_eq!(summary, RestoreSummary { restored: 1, failed: 0 });
        assert!(f.live.join("a.txt").is_file());
    }
}
