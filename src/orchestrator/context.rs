//! Request-scoped caller identity.

use serde::{Deserialize, Serialize};

/// Who is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Principal {
    User(i64),
    /// Background jobs and controller-to-controller relays.
    System,
}

/// Caller context handed to every orchestrator operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub principal: Principal,
    /// Tenant the caller acts for. A system caller may inject one to run a
    /// job on behalf of a tenant.
    pub tenant_id: Option<i64>,
    /// The tenant is on a trial plan and is placed on shared nodes first.
    pub trial_tenant: bool,
}

impl RequestContext {
    pub fn system() -> Self {
        Self {
            principal: Principal::System,
            tenant_id: None,
            trial_tenant: false,
        }
    }

    pub fn user(user_id: i64, tenant_id: i64) -> Self {
        Self {
            principal: Principal::User(user_id),
            tenant_id: Some(tenant_id),
            trial_tenant: false,
        }
    }

    pub fn is_system(&self) -> bool {
        self.principal == Principal::System
    }

    /// Users only operate their own tenant's executions.
    pub fn may_operate(&self, tenant_id: i64) -> bool {
        self.is_system() || self.tenant_id == Some(tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission() {
        assert!(RequestContext::system().may_operate(42));
        assert!(RequestContext::user(1, 42).may_operate(42));
        assert!(!RequestContext::user(1, 42).may_operate(43));

        let orphan = RequestContext {
            tenant_id: None,
            ..RequestContext::user(1, 1)
        };
        assert!(!orphan.may_operate(1));
    }
}
