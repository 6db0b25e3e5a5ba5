use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;

use stockledger_core::OrgId;
use stockledger_events::{AuditEvent, EventBus, InMemoryEventBus};
use stockledger_infra::{
    AuditLog, Backend, InMemoryLedgerStore, LedgerApplier, LedgerConfig, LedgerStore,
    PublishingAuditLog, Reconciler, StoreResult,
};

pub type AuditBus = InMemoryEventBus<AuditEvent>;

/// Everything the handlers need, shared behind an `Arc`.
///
/// Audit events go through a [`PublishingAuditLog`] so that the live feed
/// sees every event right after it is appended.
pub struct AppServices {
    pub store: Arc<dyn LedgerStore>,
    pub audit: Arc<dyn AuditLog>,
    pub applier: LedgerApplier<dyn LedgerStore>,
    pub reconciler: Reconciler<dyn LedgerStore>,
    pub bus: Arc<AuditBus>,
    pub event_poll_max: usize,
}

impl AppServices {
    pub fn from_backend(backend: Backend, event_poll_max: usize) -> Self {
        let bus = Arc::new(AuditBus::new());
        let audit: Arc<dyn AuditLog> =
            Arc::new(PublishingAuditLog::new(backend.audit, bus.clone()));
        Self {
            applier: LedgerApplier::new(backend.store.clone(), audit.clone()),
            reconciler: Reconciler::new(backend.store.clone(), audit.clone()),
            store: backend.store,
            audit,
            bus,
            event_poll_max,
        }
    }

    /// In-memory wiring (dev/test).
    pub fn in_memory() -> Self {
        let backend = Backend::from_store(Arc::new(InMemoryLedgerStore::new()));
        Self::from_backend(backend, stockledger_infra::config::DEFAULT_EVENT_POLL_MAX)
    }
}

pub async fn build_services(config: &LedgerConfig) -> StoreResult<AppServices> {
    let backend = config.open_backend().await?;
    Ok(AppServices::from_backend(backend, config.event_poll_max))
}

/// Server-sent events for one organization, fed from the audit bus.
///
/// The bus subscription is blocking, so it is drained on a blocking thread
/// and forwarded over a channel. The thread exits once the client is gone.
pub fn org_sse_stream(
    services: Arc<AppServices>,
    org_id: OrgId,
) -> Sse<UnboundedReceiverStream<Result<SseEvent, Infallible>>> {
    let subscription = services.bus.subscribe();
    let (tx, rx) = unbounded_channel::<Result<SseEvent, Infallible>>();

    tokio::task::spawn_blocking(move || {
        let mut last_heartbeat = Instant::now();
        loop {
            match subscription.recv_timeout(Duration::from_secs(1)) {
                Ok(event) => {
                    if event.org_id != org_id {
                        continue;
                    }
                    let data = match serde_json::to_string(&event) {
                        Ok(s) => s,
                        Err(_) => continue,
                    };
                    let sse = SseEvent::default()
                        .id(event.id.to_string())
                        .event(event.event_type.as_str())
                        .data(data);
                    if tx.send(Ok(sse)).is_err() {
                        break;
                    }
                    last_heartbeat = Instant::now();
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    if tx.is_closed() {
                        break;
                    }
                    if last_heartbeat.elapsed() > Duration::from_secs(15) {
                        let heartbeat = SseEvent::default().event("heartbeat").data("{}");
                        if tx.send(Ok(heartbeat)).is_err() {
                            break;
                        }
                        last_heartbeat = Instant::now();
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    Sse::new(UnboundedReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
