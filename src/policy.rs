// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Composable authorization policies.
//!
//! A [`Policy`] is a predicate over the acting [`Principal`] and, when it
//! needs relationship or workflow data, the live entity state visible
//! through an [`EntityReader`]. Evaluation returns a plain `Result`:
//! `Ok(())` grants, `Err(SyncError::AccessDenied(_))` refuses with a
//! [`Denial`], and any other error (a missing row, say) propagates.
//!
//! Three predicate classes:
//! - **Static**: role-derived grants, no data access ([`Policy::permission`])
//! - **Relationship**: live join against authorization tables
//! - **State**: derived from a row's workflow status
//!
//! # Example
//!
//! ```
//! use tenant_sync::{Policy, PolicyKind, Principal, Role, RoleAcls, TenantId};
//! use tenant_sync::store::TenantSnapshot;
//!
//! let acls = RoleAcls::new().grant(Role::Manager, ["products:update"]);
//! let manager = Principal::new(TenantId::new("t1"), "u1", Role::Manager, &acls);
//! let snapshot = TenantSnapshot::empty(TenantId::new("t1"));
//!
//! let policy = Policy::some(vec![
//!     Policy::permission("products:update"),
//!     Policy::relationship("not a room editor", |_, _| Ok(false)),
//! ]);
//! assert!(policy.evaluate(&manager, &snapshot).is_ok());
//! assert!(Policy::some(vec![]).evaluate(&manager, &snapshot).is_err());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::entity::TenantId;
use crate::error::{Denial, SyncError};
use crate::store::EntityReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Administrator,
    Operator,
    Manager,
    Customer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Administrator => "administrator",
            Role::Operator => "operator",
            Role::Manager => "manager",
            Role::Customer => "customer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Static,
    Relationship,
    State,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Static => "static",
            PolicyKind::Relationship => "relationship",
            PolicyKind::State => "state",
        }
    }
}

/// Static grants per role, e.g. `"products:read"`.
#[derive(Debug, Clone, Default)]
pub struct RoleAcls {
    grants: HashMap<Role, HashSet<String>>,
}

impl RoleAcls {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn grant<I, S>(mut self, role: Role, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grants
            .entry(role)
            .or_default()
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    pub fn permissions(&self, role: Role) -> HashSet<String> {
        self.grants.get(&role).cloned().unwrap_or_default()
    }
}

/// The authenticated actor of one request, resolved by the caller's auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub tenant_id: TenantId,
    pub user_id: String,
    pub role: Role,
    acl: HashSet<String>,
}

impl Principal {
    pub fn new(tenant_id: TenantId, user_id: impl Into<String>, role: Role, acls: &RoleAcls) -> Self {
        Self {
            tenant_id,
            user_id: user_id.into(),
            role,
            acl: acls.permissions(role),
        }
    }

    /// Extra static grant beyond the role's.
    #[must_use]
    pub fn with_grant(mut self, permission: impl Into<String>) -> Self {
        self.acl.insert(permission.into());
        self
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.acl.contains(permission)
    }

    pub fn permissions(&self) -> impl Iterator<Item = &str> {
        self.acl.iter().map(String::as_str)
    }
}

pub type PredicateFn =
    Arc<dyn Fn(&Principal, &dyn EntityReader) -> Result<bool, SyncError> + Send + Sync>;

#[derive(Clone)]
pub enum Policy {
    /// Static grant held by the principal.
    Permission(String),
    /// Data-dependent predicate. `Ok(false)` denies with `message`.
    Predicate {
        kind: PolicyKind,
        message: String,
        check: PredicateFn,
    },
    /// AND, short-circuits on the first refusal or error.
    Every(Vec<Policy>),
    /// OR, short-circuits on the first grant.
    Any(Vec<Policy>),
    /// Stamps `tag` onto any denial from `inner` so fallbacks can match it.
    Tagged { tag: String, inner: Box<Policy> },
}

impl Policy {
    pub fn permission(name: impl Into<String>) -> Self {
        Policy::Permission(name.into())
    }

    pub fn predicate<F>(kind: PolicyKind, message: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Principal, &dyn EntityReader) -> Result<bool, SyncError> + Send + Sync + 'static,
    {
        Policy::Predicate {
            kind,
            message: message.into(),
            check: Arc::new(check),
        }
    }

    pub fn relationship<F>(message: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Principal, &dyn EntityReader) -> Result<bool, SyncError> + Send + Sync + 'static,
    {
        Self::predicate(PolicyKind::Relationship, message, check)
    }

    pub fn state<F>(message: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Principal, &dyn EntityReader) -> Result<bool, SyncError> + Send + Sync + 'static,
    {
        Self::predicate(PolicyKind::State, message, check)
    }

    pub fn every(policies: Vec<Policy>) -> Self {
        Policy::Every(policies)
    }

    pub fn some(policies: Vec<Policy>) -> Self {
        Policy::Any(policies)
    }

    /// Always grants.
    pub fn allow() -> Self {
        Policy::Every(Vec::new())
    }

    #[must_use]
    pub fn tagged(self, tag: impl Into<String>) -> Self {
        Policy::Tagged {
            tag: tag.into(),
            inner: Box::new(self),
        }
    }

    pub fn evaluate(&self, principal: &Principal, reader: &dyn EntityReader) -> Result<(), SyncError> {
        match self {
            Policy::Permission(name) => {
                if principal.has_permission(name) {
                    Ok(())
                } else {
                    Err(SyncError::denied(
                        PolicyKind::Static,
                        format!("missing permission '{}'", name),
                    ))
                }
            }
            Policy::Predicate { kind, message, check } => {
                if check(principal, reader)? {
                    Ok(())
                } else {
                    Err(SyncError::denied(*kind, message.clone()))
                }
            }
            Policy::Every(policies) => {
                for policy in policies {
                    policy.evaluate(principal, reader)?;
                }
                Ok(())
            }
            Policy::Any(policies) => {
                let mut first_error = None;
                let mut last_denial = None;
                for policy in policies {
                    match policy.evaluate(principal, reader) {
                        Ok(()) => return Ok(()),
                        Err(SyncError::AccessDenied(denial)) => last_denial = Some(denial),
                        Err(err) => {
                            if first_error.is_none() {
                                first_error = Some(err);
                            }
                        }
                    }
                }
                Err(first_error.unwrap_or_else(|| {
                    SyncError::AccessDenied(last_denial.unwrap_or_else(|| {
                        Denial::new(PolicyKind::Static, "no policy granted access")
                    }))
                }))
            }
            Policy::Tagged { tag, inner } => {
                inner.evaluate(principal, reader).map_err(|err| match err {
                    SyncError::AccessDenied(mut denial) => {
                        denial.tag = Some(tag.clone());
                        SyncError::AccessDenied(denial)
                    }
                    other => other,
                })
            }
        }
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Permission(name) => write!(f, "permission({})", name),
            Policy::Predicate { kind, message, .. } => {
                write!(f, "{}({:?})", kind.as_str(), message)
            }
            Policy::Every(policies) => f.debug_tuple("every").field(policies).finish(),
            Policy::Any(policies) => f.debug_tuple("some").field(policies).finish(),
            Policy::Tagged { tag, inner } => write!(f, "{:?}#{}", inner, tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TenantSnapshot;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snapshot() -> TenantSnapshot {
        TenantSnapshot::empty(TenantId::new("t1"))
    }

    fn manager() -> Principal {
        let acls = RoleAcls::new().grant(Role::Manager, ["products:read", "products:update"]);
        Principal::new(TenantId::new("t1"), "u1", Role::Manager, &acls)
    }

    fn yes() -> Policy {
        Policy::state("unused", |_, _| Ok(true))
    }

    fn no(message: &str) -> Policy {
        Policy::state(message.to_string(), |_, _| Ok(false))
    }

    #[test]
    fn test_empty_combinators() {
        assert!(Policy::every(vec![]).evaluate(&manager(), &snapshot()).is_ok());
        assert!(Policy::some(vec![]).evaluate(&manager(), &snapshot()).is_err());
    }

    #[test]
    fn test_every_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let policy = Policy::every(vec![
            no("first"),
            Policy::state("second", move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }),
        ]);

        let err = policy.evaluate(&manager(), &snapshot()).unwrap_err();
        assert_eq!(err.denial().unwrap().message, "first");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_some_succeeds_without_evaluating_rest() {
        let policy = Policy::some(vec![
            yes(),
            Policy::state("boom", |_, _| Err(SyncError::Internal("unreachable".into()))),
        ]);
        assert!(policy.evaluate(&manager(), &snapshot()).is_ok());
    }

    #[test]
    fn test_some_reports_last_denial() {
        let policy = Policy::some(vec![no("first"), no("second")]);
        let err = policy.evaluate(&manager(), &snapshot()).unwrap_err();
        assert_eq!(err.denial().unwrap().message, "second");
    }

    #[test]
    fn test_some_prefers_real_errors_over_denials() {
        let policy = Policy::some(vec![
            no("denied"),
            Policy::relationship("lookup", |_, _| Err(SyncError::not_found("rooms", "r9"))),
        ]);
        let err = policy.evaluate(&manager(), &snapshot()).unwrap_err();
        assert_eq!(err.code(), "NotFoundError");
    }

    #[test]
    fn test_permission_checks_acl() {
        assert!(Policy::permission("products:update").evaluate(&manager(), &snapshot()).is_ok());

        let err = Policy::permission("rooms:delete")
            .evaluate(&manager(), &snapshot())
            .unwrap_err();
        assert_eq!(err.denial().unwrap().kind, PolicyKind::Static);

        let granted = manager().with_grant("rooms:delete");
        assert!(Policy::permission("rooms:delete").evaluate(&granted, &snapshot()).is_ok());
    }

    #[test]
    fn test_tag_propagates_through_combinators() {
        let policy = Policy::every(vec![
            Policy::permission("products:read"),
            no("row hidden").tagged("read-visibility"),
        ]);
        let err = policy.evaluate(&manager(), &snapshot()).unwrap_err();
        let denial = err.denial().unwrap();
        assert_eq!(denial.tag.as_deref(), Some("read-visibility"));
        assert_eq!(denial.kind, PolicyKind::State);
    }

    #[test]
    fn test_debug_is_readable() {
        let policy = Policy::some(vec![Policy::permission("a:b"), no("x").tagged("t")]);
        let rendered = format!("{:?}", policy);
        assert!(rendered.contains("permission(a:b)"));
        assert!(rendered.contains("#t"));
    }
}
