//! Authentication of command callers.

mod acl;

pub use acl::{AclAuthorizer, AclEffect, AclRule, Authorizer, AuthzRequest, OperationKind};

use crate::core::{ProcessorError, QName, Result, WorkspaceId, sys};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// Identity fact used as input to authorization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    Everyone,
    AuthenticatedUser,
    Guest,
    User(String),
    Device(String),
    /// The distinguished system identity used to seed data.
    System,
    Role(QName),
    Host(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubjectKind {
    User,
    Device,
    System,
}

/// Claims carried by an issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalPayload {
    pub login: String,
    pub subject: SubjectKind,
    /// Workspace owned by the subject.
    pub profile_workspace: Option<WorkspaceId>,
    /// Roles granted per workspace.
    #[serde(default)]
    pub roles: Vec<(WorkspaceId, QName)>,
}

impl PrincipalPayload {
    pub fn user(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            subject: SubjectKind::User,
            profile_workspace: None,
            roles: Vec::new(),
        }
    }

    pub fn device(login: impl Into<String>) -> Self {
        Self {
            subject: SubjectKind::Device,
            ..Self::user(login)
        }
    }

    pub fn system() -> Self {
        Self {
            subject: SubjectKind::System,
            ..Self::user("sys")
        }
    }

    pub fn with_profile(mut self, workspace: WorkspaceId) -> Self {
        self.profile_workspace = Some(workspace);
        self
    }

    pub fn with_role(mut self, workspace: WorkspaceId, role: QName) -> Self {
        self.roles.push((workspace, role));
        self
    }
}

/// Issues and validates bearer tokens.
pub trait TokenService: Send + Sync {
    fn issue(&self, payload: PrincipalPayload) -> Result<String>;

    /// `Ok(None)` for unknown or revoked tokens.
    fn validate(&self, token: &str) -> Result<Option<PrincipalPayload>>;
}

/// Opaque random tokens kept in memory.
#[derive(Debug, Default)]
pub struct MapTokenService {
    tokens: RwLock<HashMap<String, PrincipalPayload>>,
}

impl MapTokenService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self, token: &str) -> Result<bool> {
        Ok(self.tokens.write()?.remove(token).is_some())
    }
}

impl TokenService for MapTokenService {
    fn issue(&self, payload: PrincipalPayload) -> Result<String> {
        let token = Uuid::new_v4().simple().to_string();
        self.tokens.write()?.insert(token.clone(), payload);
        Ok(token)
    }

    fn validate(&self, token: &str) -> Result<Option<PrincipalPayload>> {
        Ok(self.tokens.read()?.get(token).cloned())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AuthnRequest<'a> {
    pub host: &'a str,
    pub workspace: WorkspaceId,
    pub token: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthnOutcome {
    pub principals: Vec<Principal>,
    /// `None` for anonymous callers.
    pub payload: Option<PrincipalPayload>,
}

impl AuthnOutcome {
    pub fn is_system(&self) -> bool {
        self.principals.contains(&Principal::System)
    }

    pub fn login(&self) -> Option<&str> {
        self.payload.as_ref().map(|payload| payload.login.as_str())
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: AuthnRequest<'_>) -> Result<AuthnOutcome>;
}

/// Resolves principals from tokens issued by a [`TokenService`].
pub struct TokenAuthenticator<T> {
    tokens: T,
}

impl<T: TokenService> TokenAuthenticator<T> {
    pub fn new(tokens: T) -> Self {
        Self { tokens }
    }

    pub fn tokens(&self) -> &T {
        &self.tokens
    }
}

#[async_trait]
impl<T: TokenService> Authenticator for TokenAuthenticator<T> {
    async fn authenticate(&self, request: AuthnRequest<'_>) -> Result<AuthnOutcome> {
        let host = Principal::Host(request.host.to_string());
        let Some(token) = request.token.filter(|token| !token.is_empty()) else {
            return Ok(AuthnOutcome {
                principals: vec![Principal::Everyone, Principal::Guest, host],
                payload: None,
            });
        };

        let payload = self
            .tokens
            .validate(token)?
            .ok_or_else(|| ProcessorError::AuthenticationFailed("unknown token".to_string()))?;

        let mut principals = vec![Principal::Everyone, Principal::AuthenticatedUser];
        principals.push(match payload.subject {
            SubjectKind::User => Principal::User(payload.login.clone()),
            SubjectKind::Device => Principal::Device(payload.login.clone()),
            SubjectKind::System => Principal::System,
        });
        principals.extend(
            payload
                .roles
                .iter()
                .filter(|(workspace, _)| *workspace == request.workspace)
                .map(|(_, role)| Principal::Role(role.clone())),
        );
        if payload.profile_workspace == Some(request.workspace) {
            principals.push(Principal::Role(sys::workspace_owner_role()));
        }
        principals.push(host);

        Ok(AuthnOutcome {
            principals,
            payload: Some(payload),
        })
    }
}
