use super::Principal;
use crate::core::{QName, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Execute,
    Insert,
    Update,
    Activate,
    Deactivate,
}

#[derive(Debug, Clone, Copy)]
pub struct AuthzRequest<'a> {
    pub operation: OperationKind,
    pub resource: &'a QName,
    /// Fields touched by the operation; empty for `Execute`.
    pub fields: &'a [String],
}

pub trait Authorizer: Send + Sync {
    fn authorize(&self, principals: &[Principal], request: AuthzRequest<'_>) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclEffect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRule {
    pub effect: AclEffect,
    pub operations: Vec<OperationKind>,
    /// Empty matches every resource.
    #[serde(default)]
    pub resources: Vec<QName>,
    /// An allow rule covers a request only when every requested field is
    /// listed; a deny rule when any requested field is listed.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    pub principal: Principal,
}

impl AclRule {
    pub fn allow(operations: impl Into<Vec<OperationKind>>, principal: Principal) -> Self {
        Self {
            effect: AclEffect::Allow,
            operations: operations.into(),
            resources: Vec::new(),
            fields: None,
            principal,
        }
    }

    pub fn deny(operations: impl Into<Vec<OperationKind>>, principal: Principal) -> Self {
        Self {
            effect: AclEffect::Deny,
            ..Self::allow(operations, principal)
        }
    }

    pub fn on(mut self, resource: QName) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    fn matches(&self, principals: &[Principal], request: &AuthzRequest<'_>) -> bool {
        if !self.operations.contains(&request.operation) {
            return false;
        }
        if !self.resources.is_empty() && !self.resources.contains(request.resource) {
            return false;
        }
        if !principals.contains(&self.principal) {
            return false;
        }
        let Some(fields) = &self.fields else {
            return true;
        };
        let listed = fields.iter().map(String::as_str).collect::<HashSet<_>>();
        match self.effect {
            AclEffect::Allow => request
                .fields
                .iter()
                .all(|field| listed.contains(field.as_str())),
            AclEffect::Deny => request
                .fields
                .iter()
                .any(|field| listed.contains(field.as_str())),
        }
    }
}

/// Ordered rule list; the last matching rule decides, no match denies.
#[derive(Debug, Clone, Default)]
pub struct AclAuthorizer {
    rules: Vec<AclRule>,
}

impl AclAuthorizer {
    pub fn new(rules: Vec<AclRule>) -> Self {
        Self { rules }
    }

    pub fn rule(mut self, rule: AclRule) -> Self {
        self.rules.push(rule);
        self
    }
}

impl Authorizer for AclAuthorizer {
    fn authorize(&self, principals: &[Principal], request: AuthzRequest<'_>) -> Result<bool> {
        if principals.contains(&Principal::System) {
            return Ok(true);
        }
        let decision = self
            .rules
            .iter()
            .rev()
            .find(|rule| rule.matches(principals, &request))
            .map(|rule| rule.effect == AclEffect::Allow);
        Ok(decision.unwrap_or(false))
    }
}
