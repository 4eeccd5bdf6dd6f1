//! Filekeep server binary.
//!
//! Per-user file storage with a trash area, automatic versions of overwritten
//! files, byte quotas and bulk operations. Identity is supplied by an upstream
//! proxy through the `x-user-id` header; this binary wires the storage core to
//! a thin JSON API.

mod archive;
mod atomic;
mod audit;
mod background;
mod bulk;
mod config;
mod context;
mod db;
mod error;
mod favorites;
mod files;
mod http;
mod layout;
mod locking;
mod logging;
mod path;
mod quota;
mod recycle;
mod trash;
mod tree;
mod versions;
mod walk;

use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::routing::{delete, get, post, put};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::archive::ArchiveBuilder;
use crate::audit::{AuditSink, SqlAudit};
use crate::background::{BackgroundConfig, spawn_background_tasks};
use crate::bulk::BulkCoordinator;
use crate::config::{Args, USER_ID_HEADER};
use crate::context::identity_middleware;
use crate::favorites::FavoriteStore;
use crate::http::build_cors_layer;
use crate::layout::Layout;
use crate::locking::LockManager;
use crate::quota::QuotaLedger;
use crate::recycle::AdminIds;
use crate::trash::TrashStore;
use crate::tree::StorageTree;
use crate::versions::VersionStore;

shadow!(build);

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(&args.log_level);

    let layout = Layout::new(
        PathBuf::from(&args.storage_dir),
        PathBuf::from(&args.archive_dir),
    );
    layout.ensure_roots().await?;
    let pool = db::connect(&args.database_url)
        .await
        .map_err(|err| std::io::Error::other(format!("database unavailable: {err}")))?;

    let audit: Arc<dyn AuditSink> = Arc::new(SqlAudit::new(pool.clone()));
    let locks = Arc::new(LockManager::new());
    let ledger = QuotaLedger::new(pool.clone(), layout.clone(), args.default_quota);
    let versions = VersionStore::new(
        pool.clone(),
        layout.clone(),
        ledger.clone(),
        locks.clone(),
        audit.clone(),
    );
    let tree = StorageTree::new(
        layout.clone(),
        ledger.clone(),
        versions.clone(),
        locks,
        audit.clone(),
        args.version_snapshot,
    );
    let trash = TrashStore::new(
        pool.clone(),
        layout.clone(),
        ledger.clone(),
        audit.clone(),
        args.trash_retention_days,
    );
    let favorites = FavoriteStore::new(pool, audit.clone());
    let archives = ArchiveBuilder::new(layout, Duration::from_secs(args.archive_ttl_secs));
    let bulk = BulkCoordinator::new(
        tree.clone(),
        trash.clone(),
        favorites.clone(),
        archives.clone(),
        audit.clone(),
    );
    let admins = AdminIds(Arc::new(args.admin_ids.iter().copied().collect::<HashSet<_>>()));

    spawn_background_tasks(
        archives.clone(),
        ledger.clone(),
        trash.clone(),
        BackgroundConfig {
            quota_reconcile_secs: args.quota_reconcile_secs,
            trash_auto_purge: args.trash_auto_purge,
        },
    );

    let mut app = Router::new()
        .route("/api/account", get(files::account_usage))
        .route("/api/files/list", get(files::list_files))
        .route("/api/files/search", get(files::search_files))
        .route("/api/files/download", get(files::download_file))
        .route("/api/files/mkdir", post(files::create_folder))
        .route("/api/files/rename", post(files::rename_entry))
        .route("/api/files/move", post(files::move_entry))
        .route("/api/files/copy", post(files::copy_entry))
        .route(
            "/api/files/upload",
            put(files::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/files/bulk", post(files::bulk_action))
        .route("/api/files/archive", post(files::archive_folder))
        .route("/api/downloads/{token}", get(files::take_download))
        .route(
            "/api/trash",
            get(recycle::list_trash)
                .post(recycle::trash_entry)
                .delete(recycle::empty_trash),
        )
        .route("/api/trash/restore", post(recycle::restore_all_trash))
        .route("/api/trash/{id}", delete(recycle::purge_trash))
        .route("/api/trash/{id}/restore", post(recycle::restore_trash))
        .route("/api/versions", get(recycle::list_versions))
        .route("/api/versions/{id}", delete(recycle::delete_version))
        .route("/api/versions/{id}/restore", post(recycle::restore_version))
        .route("/api/versions/{id}/download", get(recycle::download_version))
        .route(
            "/api/favorites",
            get(recycle::list_favorites)
                .post(recycle::add_favorite)
                .delete(recycle::remove_favorite),
        )
        .route("/api/admin/quota", put(recycle::set_quota))
        .layer(middleware::from_fn(identity_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let user_id = request
                        .headers()
                        .get(USER_ID_HEADER)
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        user_id,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(tree))
        .layer(Extension(versions))
        .layer(Extension(trash))
        .layer(Extension(favorites))
        .layer(Extension(archives))
        .layer(Extension(bulk))
        .layer(Extension(ledger))
        .layer(Extension(audit))
        .layer(Extension(admins));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!(address = %http_addr, storage = args.storage_dir, "starting HTTP server");
    let server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.into_make_service());

    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
