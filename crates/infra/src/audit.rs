//! Audit log decorator that fans committed events out to a bus.

use async_trait::async_trait;
use tracing::warn;

use stockledger_core::OrgId;
use stockledger_events::{AuditEvent, EventBus, NewAuditEvent};

use crate::store::{AuditError, AuditLog};

/// Appends to the inner log, then publishes the stored event.
///
/// The append is the durable step and decides the result. A publish failure
/// after it is logged and swallowed; consumers that need completeness resume
/// from `poll_events`.
#[derive(Debug, Clone)]
pub struct PublishingAuditLog<A, B> {
    log: A,
    bus: B,
}

impl<A, B> PublishingAuditLog<A, B> {
    pub fn new(log: A, bus: B) -> Self {
        Self { log, bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_parts(self) -> (A, B) {
        (self.log, self.bus)
    }
}

#[async_trait]
impl<A, B> AuditLog for PublishingAuditLog<A, B>
where
    A: AuditLog,
    B: EventBus<AuditEvent>,
{
    async fn append(&self, event: NewAuditEvent) -> Result<AuditEvent, AuditError> {
        let stored = self.log.append(event).await?;
        if let Err(err) = self.bus.publish(stored.clone()) {
            warn!(
                org_id = %stored.org_id,
                event_id = stored.id,
                error = ?err,
                "audit event stored but not published"
            );
        }
        Ok(stored)
    }

    async fn poll_events(
        &self,
        org_id: &OrgId,
        after: i64,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        self.log.poll_events(org_id, after, limit).await
    }

    async fn recent_events(&self, org_id: &OrgId, limit: usize) -> Result<Vec<AuditEvent>, AuditError> {
        self.log.recent_events(org_id, limit).await
    }
}
