//! # Canvas Sync Demo
//!
//! Runs one session against loopback backends, drops the transport, edits
//! offline, then lets the reconnect schedule bring it back and flush.

use std::sync::Arc;
use std::time::Duration;

use canvas_client::{Backends, ForwardingHook, SessionEvent, SyncSession};
use canvas_sync::{
    CanvasObject, FileStorage, Identity, KeyValueStorage, MemoryPresenceHub, MemoryRemoteStore,
    MemoryStorage, ObjectPatch, ShapeKind, SyncConfig, TransportSignal,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long to wait for the queued edits to reach the store.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(120);

/// Initialize structured tracing with optional JSON format.
///
/// Set `RUST_LOG` to control log levels (default: info,canvas_sync=debug,canvas_client=debug).
/// Set `RUST_LOG_FORMAT=json` for JSON output.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,canvas_sync=debug,canvas_client=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
    }
}

/// Durable storage under `CANVAS_SYNC_DATA_DIR`, or memory when unset.
fn init_storage() -> anyhow::Result<Arc<dyn KeyValueStorage>> {
    match std::env::var("CANVAS_SYNC_DATA_DIR") {
        Ok(dir) => {
            tracing::info!(data_dir = %dir, "Using file storage");
            Ok(Arc::new(FileStorage::new(dir)?))
        }
        Err(_) => Ok(Arc::new(MemoryStorage::new())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = SyncConfig::from_env();
    let user_id = std::env::var("CANVAS_SYNC_USER").unwrap_or_else(|_| "demo-user".to_string());
    let board = std::env::var("CANVAS_SYNC_BOARD").unwrap_or_else(|_| "demo-board".to_string());

    let remote = MemoryRemoteStore::new();
    let presence = MemoryPresenceHub::new();
    let (hook, mut attempts) = ForwardingHook::channel();

    let session = SyncSession::start(
        config,
        Identity::new(user_id.clone(), user_id),
        board,
        Backends {
            remote: Arc::new(remote.clone()),
            presence: Arc::new(presence),
            storage: init_storage()?,
            reconnect: Arc::new(hook),
        },
    );

    // Stand-in transport owner: the first attempt fails, the second succeeds.
    let monitor = session.monitor().clone();
    tokio::spawn(async move {
        while let Some(attempt) = attempts.recv().await {
            if attempt >= 2 {
                tracing::info!(attempt, "Transport resubscribed");
                monitor.handle_transport(TransportSignal::Subscribed);
            } else {
                tracing::info!(attempt, "Transport still unreachable");
                monitor.handle_transport(TransportSignal::ChannelError("unreachable".into()));
            }
        }
    });

    let mut events = session.subscribe();
    session.monitor().handle_transport(TransportSignal::Subscribed);

    let card = CanvasObject::new(ShapeKind::Rectangle, 40.0, 40.0).with_size(160.0, 90.0);
    let card_id = card.id;
    let outcome = session.create_object(card).await?;
    tracing::info!(?outcome, object_id = %card_id, "Created card while online");

    session.monitor().handle_transport(TransportSignal::Closed);

    let outcome = session
        .update_object(card_id, ObjectPatch::position(220.0, 60.0))
        .await?;
    tracing::info!(?outcome, "Moved card while offline");
    let note = CanvasObject::new(ShapeKind::Ellipse, 300.0, 200.0).with_fill("#ffd166");
    let outcome = session.create_object(note).await?;
    tracing::info!(?outcome, pending = session.queue().len(), "Created note while offline");

    tokio::time::timeout(FLUSH_TIMEOUT, async {
        loop {
            if let SessionEvent::Flushed(report) = events.recv().await? {
                if report.remaining == 0 && report.succeeded > 0 {
                    tracing::info!(succeeded = report.succeeded, "Queued edits delivered");
                    return anyhow::Ok(());
                }
            }
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("queued edits were not delivered within {FLUSH_TIMEOUT:?}"))??;

    println!(
        "{}",
        serde_json::to_string_pretty(&session.connection_state())?
    );
    println!("remote objects: {}", remote.len());

    session.shutdown().await;
    Ok(())
}
