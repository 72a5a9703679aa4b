use super::error::{ProcessorError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type WorkspaceId = u64;
pub type PartitionId = u32;
pub type Offset = u64;
pub type RecordId = u64;

/// First offset of every PLog and WLog.
pub const FIRST_OFFSET: Offset = 1;
/// Reference value meaning "no record".
pub const NULL_RECORD_ID: RecordId = 0;

lazy_static! {
    static ref IDENT_RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

fn valid_ident(s: &str) -> bool {
    IDENT_RE.is_match(s)
}

/// Qualified name `pkg.entity` of a schema element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QName {
    pkg: String,
    entity: String,
}

impl QName {
    pub fn new(pkg: impl Into<String>, entity: impl Into<String>) -> Result<Self> {
        let pkg = pkg.into();
        let entity = entity.into();
        if !valid_ident(&pkg) || !valid_ident(&entity) {
            return Err(ProcessorError::MalformedRequest(format!(
                "invalid qualified name '{}.{}'",
                pkg, entity
            )));
        }
        Ok(Self { pkg, entity })
    }

    /// Builds a name from literals known to be valid; used for built-in names.
    pub(crate) fn sys(entity: &str) -> Self {
        Self {
            pkg: "sys".to_string(),
            entity: entity.to_string(),
        }
    }

    pub fn pkg(&self) -> &str {
        &self.pkg
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pkg, self.entity)
    }
}

impl FromStr for QName {
    type Err = ProcessorError;

    fn from_str(s: &str) -> Result<Self> {
        let (pkg, entity) = s.split_once('.').ok_or_else(|| {
            ProcessorError::MalformedRequest(format!("invalid qualified name '{}'", s))
        })?;
        Self::new(pkg, entity)
    }
}

impl TryFrom<String> for QName {
    type Error = ProcessorError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<QName> for String {
    fn from(value: QName) -> Self {
        value.to_string()
    }
}

/// Application name `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppQName {
    owner: String,
    name: String,
}

impl AppQName {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let owner = owner.into();
        let name = name.into();
        if !valid_ident(&owner) || !valid_ident(&name) {
            return Err(ProcessorError::MalformedRequest(format!(
                "invalid application name '{}/{}'",
                owner, name
            )));
        }
        Ok(Self { owner, name })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for AppQName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for AppQName {
    type Err = ProcessorError;

    fn from_str(s: &str) -> Result<Self> {
        let (owner, name) = s.split_once('/').ok_or_else(|| {
            ProcessorError::MalformedRequest(format!("invalid application name '{}'", s))
        })?;
        Self::new(owner, name)
    }
}

impl TryFrom<String> for AppQName {
    type Error = ProcessorError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AppQName> for String {
    fn from(value: AppQName) -> Self {
        value.to_string()
    }
}

pub mod sys {
    //! Names and fields every application carries.

    use super::QName;

    pub const FIELD_ID: &str = "sys.ID";
    pub const FIELD_QNAME: &str = "sys.QName";
    pub const FIELD_IS_ACTIVE: &str = "sys.IsActive";
    pub const FIELD_PARENT_ID: &str = "sys.ParentID";
    pub const FIELD_CONTAINER: &str = "sys.Container";

    pub const DESCRIPTOR_FIELD_STATUS: &str = "Status";
    pub const DESCRIPTOR_FIELD_INIT_COMPLETED_AT_MS: &str = "InitCompletedAtMs";
    pub const DESCRIPTOR_FIELD_INIT_ERROR: &str = "InitError";

    /// `Status` values of the workspace descriptor.
    pub const WORKSPACE_STATUS_ACTIVE: i64 = 0;
    pub const WORKSPACE_STATUS_TO_BE_DEACTIVATED: i64 = 1;
    pub const WORKSPACE_STATUS_INACTIVE: i64 = 2;

    pub fn cud() -> QName {
        QName::sys("CUD")
    }

    pub fn init() -> QName {
        QName::sys("Init")
    }

    pub fn create_workspace() -> QName {
        QName::sys("CreateWorkspace")
    }

    pub fn create_workspace_id() -> QName {
        QName::sys("CreateWorkspaceID")
    }

    pub fn init_child_workspace() -> QName {
        QName::sys("InitChildWorkspace")
    }

    pub fn workspace_descriptor() -> QName {
        QName::sys("WorkspaceDescriptor")
    }

    pub fn workspace_owner_role() -> QName {
        QName::sys("WorkspaceOwner")
    }

    pub fn plog_projection() -> QName {
        QName::sys("PLog")
    }

    /// Commands accepted by a workspace that has not finished initialization.
    pub fn bootstrap_commands() -> [QName; 4] {
        [
            create_workspace(),
            create_workspace_id(),
            init(),
            init_child_workspace(),
        ]
    }

    /// Commands that may carry CUDs.
    pub fn is_cud_command(command: &QName) -> bool {
        *command == cud() || *command == init()
    }
}
