use stockledger_core::OrgId;
use stockledger_ledger::Organization;

/// Organization context for a request.
///
/// Inserted by the org middleware after the organization was resolved, so
/// every org-scoped handler can rely on it existing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgContext {
    organization: Organization,
}

impl OrgContext {
    pub fn new(organization: Organization) -> Self {
        Self { organization }
    }

    pub fn org_id(&self) -> &OrgId {
        &self.organization.org_id
    }

    pub fn organization(&self) -> &Organization {
        &self.organization
    }
}
