//! Tenant identity and typed identifiers.
//!
//! Every storage call receives a [`TenantContext`] explicitly; nothing in
//! the engine reads tenant identity from ambient state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

define_id!(
    /// Identifier of a tenant (customer organisation).
    TenantId
);
define_id!(
    /// Identifier of a project inside a tenant.
    ProjectId
);
define_id!(
    /// Identifier of an IMAP, SMTP or provider connector.
    ConnectorId
);
define_id!(
    /// Identifier of an inbound mailbox.
    MailboxId
);
define_id!(
    /// Identifier of a ticket owned by the ticket service.
    TicketId
);
define_id!(
    /// Identifier of a stored inbound message.
    InboxMessageId
);

/// Tenant (and optional project) scope for one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
    project_ids: Vec<ProjectId>,
}

impl TenantContext {
    /// Scope covering a whole tenant.
    #[must_use]
    pub const fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            project_ids: Vec::new(),
        }
    }

    /// Narrow the scope to the given projects.
    #[must_use]
    pub fn with_projects(mut self, project_ids: impl IntoIterator<Item = ProjectId>) -> Self {
        self.project_ids = project_ids.into_iter().collect();
        self.project_ids.sort();
        self.project_ids.dedup();
        self
    }

    /// Tenant this context is bound to.
    #[must_use]
    pub const fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// Projects this context is narrowed to; empty means all projects.
    #[must_use]
    pub fn project_ids(&self) -> &[ProjectId] {
        &self.project_ids
    }

    /// Whether a row in `project` is visible to this context.
    #[must_use]
    pub fn allows_project(&self, project: Option<ProjectId>) -> bool {
        match project {
            _ if self.project_ids.is_empty() => true,
            Some(p) => self.project_ids.contains(&p),
            None => true,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trips_through_text() {
        let id = TicketId::new();
        let parsed: TicketId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<TicketId>().is_err());
    }

    #[test]
    fn project_scope() {
        let tenant = TenantId::new();
        let (a, b) = (ProjectId::new(), ProjectId::new());

        let open = TenantContext::new(tenant);
        assert!(open.allows_project(Some(a)));

        let narrowed = TenantContext::new(tenant).with_projects([a, a]);
        assert_eq!(narrowed.project_ids().len(), 1);
        assert!(narrowed.allows_project(Some(a)));
        assert!(!narrowed.allows_project(Some(b)));
        assert!(narrowed.allows_project(None));
    }
}
