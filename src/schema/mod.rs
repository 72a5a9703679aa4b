//! In-memory application schema: records, commands, projectors and views.

pub(crate) mod fields;

use crate::core::{ProcessorError, QName, RecordId, Result, sys};
use crate::event::RawEvent;
use crate::extension::{
    CommandExtension, ExecContext, ProjectorContext, ProjectorHandler, ViewIntents,
};
use crate::ids::{FIRST_SINGLETON_ID, MAX_SINGLETON_ID};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    CDoc,
    CRecord,
    WDoc,
    WRecord,
    ODoc,
    ORecord,
    /// Transient argument/result object, never stored on its own.
    Object,
}

impl RecordKind {
    /// Kinds that CUDs may create or update.
    pub fn accepts_cud(self) -> bool {
        matches!(self, Self::CDoc | Self::CRecord | Self::WDoc | Self::WRecord)
    }

    /// Kinds a command parameter may have.
    pub fn is_argument(self) -> bool {
        matches!(self, Self::ODoc | Self::Object)
    }

    /// Kinds allowed as nested container elements.
    fn accepts_child(self, child: RecordKind) -> bool {
        match self {
            Self::CDoc | Self::CRecord => child == Self::CRecord,
            Self::WDoc | Self::WRecord => child == Self::WRecord,
            Self::ODoc | Self::ORecord => child == Self::ORecord,
            Self::Object => child == Self::Object,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Int,
    Float,
    Bool,
    Text,
    Json,
    RecordRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDef {
    pub name: String,
    pub type_name: QName,
    pub min_occurs: usize,
    pub max_occurs: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDef {
    pub qname: QName,
    pub kind: RecordKind,
    /// Fixed ID of a singleton; assigned by the schema builder.
    pub singleton_id: Option<RecordId>,
    pub fields: Vec<FieldDef>,
    /// Nested element containers in declaration order.
    pub containers: Vec<ContainerDef>,
    #[serde(default)]
    singleton: bool,
}

impl RecordDef {
    pub fn new(qname: QName, kind: RecordKind) -> Self {
        Self {
            qname,
            kind,
            singleton_id: None,
            fields: Vec::new(),
            containers: Vec::new(),
            singleton: false,
        }
    }

    pub fn require_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn with_container(
        mut self,
        name: impl Into<String>,
        type_name: QName,
        min_occurs: usize,
        max_occurs: Option<usize>,
    ) -> Self {
        self.containers.push(ContainerDef {
            name: name.into(),
            type_name,
            min_occurs,
            max_occurs,
        });
        self
    }

    /// Marks a CDoc or WDoc as a per-workspace singleton.
    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    pub fn is_singleton(&self) -> bool {
        self.singleton
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn container(&self, name: &str) -> Option<&ContainerDef> {
        self.containers
            .iter()
            .find(|container| container.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    /// Structured argument validated against a declared ODoc or Object.
    Object(QName),
    /// Body is passed through to the extension untouched.
    Raw,
}

#[derive(Clone)]
pub struct CommandDef {
    pub qname: QName,
    pub param: Option<ParamKind>,
    pub unlogged_param: Option<QName>,
    pub result: Option<QName>,
    pub(crate) extension: Option<CommandExtension>,
}

impl CommandDef {
    pub fn new(qname: QName) -> Self {
        Self {
            qname,
            param: None,
            unlogged_param: None,
            result: None,
            extension: None,
        }
    }

    pub fn with_param(mut self, type_name: QName) -> Self {
        self.param = Some(ParamKind::Object(type_name));
        self
    }

    pub fn with_raw_param(mut self) -> Self {
        self.param = Some(ParamKind::Raw);
        self
    }

    pub fn with_unlogged_param(mut self, type_name: QName) -> Self {
        self.unlogged_param = Some(type_name);
        self
    }

    pub fn with_result(mut self, type_name: QName) -> Self {
        self.result = Some(type_name);
        self
    }

    pub fn with_extension<F>(mut self, extension: F) -> Self
    where
        F: Fn(&mut ExecContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let extension: CommandExtension = Arc::new(extension);
        self.extension = Some(extension);
        self
    }
}

impl fmt::Debug for CommandDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDef")
            .field("qname", &self.qname)
            .field("param", &self.param)
            .field("unlogged_param", &self.unlogged_param)
            .field("result", &self.result)
            .field("extension", &self.extension.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectorTrigger {
    Command(QName),
    /// Any create or update of a record of this type.
    Cud(QName),
}

/// A synchronous projector; runs inside the request that commits the event.
#[derive(Clone)]
pub struct ProjectorDef {
    pub qname: QName,
    pub triggers: Vec<ProjectorTrigger>,
    pub(crate) handler: ProjectorHandler,
}

impl ProjectorDef {
    pub fn new<F>(qname: QName, handler: F) -> Self
    where
        F: Fn(&ProjectorContext<'_>, &mut ViewIntents) -> Result<()> + Send + Sync + 'static,
    {
        let handler: ProjectorHandler = Arc::new(handler);
        Self {
            qname,
            triggers: Vec::new(),
            handler,
        }
    }

    pub fn on_command(mut self, command: QName) -> Self {
        self.triggers.push(ProjectorTrigger::Command(command));
        self
    }

    pub fn on_cud(mut self, record: QName) -> Self {
        self.triggers.push(ProjectorTrigger::Cud(record));
        self
    }

    pub fn triggered_by(&self, event: &RawEvent) -> bool {
        self.triggers.iter().any(|trigger| match trigger {
            ProjectorTrigger::Command(command) => *command == event.command,
            ProjectorTrigger::Cud(record) => event.cuds.iter().any(|cud| cud.qname == *record),
        })
    }
}

impl fmt::Debug for ProjectorDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectorDef")
            .field("qname", &self.qname)
            .field("triggers", &self.triggers)
            .finish()
    }
}

#[derive(Debug)]
pub struct AppSchema {
    records: HashMap<QName, RecordDef>,
    commands: HashMap<QName, CommandDef>,
    projectors: Vec<ProjectorDef>,
    views: HashSet<QName>,
}

impl AppSchema {
    pub fn builder() -> AppSchemaBuilder {
        AppSchemaBuilder::new()
    }

    pub fn record(&self, qname: &QName) -> Option<&RecordDef> {
        self.records.get(qname)
    }

    pub fn command(&self, qname: &QName) -> Option<&CommandDef> {
        self.commands.get(qname)
    }

    pub fn projectors(&self) -> &[ProjectorDef] {
        &self.projectors
    }

    /// Projectors subscribed to `event`, in declaration order.
    pub fn projectors_for<'a>(
        &'a self,
        event: &'a RawEvent,
    ) -> impl Iterator<Item = &'a ProjectorDef> + 'a {
        self.projectors
            .iter()
            .filter(move |projector| projector.triggered_by(event))
    }

    pub fn has_view(&self, qname: &QName) -> bool {
        self.views.contains(qname)
    }
}

#[derive(Default)]
pub struct AppSchemaBuilder {
    records: Vec<RecordDef>,
    commands: Vec<CommandDef>,
    projectors: Vec<ProjectorDef>,
    views: Vec<QName>,
}

impl AppSchemaBuilder {
    pub fn new() -> Self {
        let descriptor = RecordDef::new(sys::workspace_descriptor(), RecordKind::CDoc)
            .optional_field(sys::DESCRIPTOR_FIELD_STATUS, FieldKind::Int)
            .optional_field(sys::DESCRIPTOR_FIELD_INIT_COMPLETED_AT_MS, FieldKind::Int)
            .optional_field(sys::DESCRIPTOR_FIELD_INIT_ERROR, FieldKind::Text)
            .singleton();

        Self {
            records: vec![descriptor],
            commands: vec![CommandDef::new(sys::cud()), CommandDef::new(sys::init())],
            projectors: Vec::new(),
            views: Vec::new(),
        }
    }

    pub fn record(mut self, def: RecordDef) -> Self {
        self.records.push(def);
        self
    }

    pub fn command(mut self, def: CommandDef) -> Self {
        self.commands.push(def);
        self
    }

    pub fn projector(mut self, def: ProjectorDef) -> Self {
        self.projectors.push(def);
        self
    }

    pub fn view(mut self, qname: QName) -> Self {
        self.views.push(qname);
        self
    }

    pub fn build(self) -> Result<AppSchema> {
        let mut records = HashMap::with_capacity(self.records.len());
        let mut next_singleton = FIRST_SINGLETON_ID;
        for mut def in self.records {
            if def.singleton {
                if !matches!(def.kind, RecordKind::CDoc | RecordKind::WDoc) {
                    return Err(schema_error(format!(
                        "singleton '{}' must be a CDoc or WDoc",
                        def.qname
                    )));
                }
                if next_singleton > MAX_SINGLETON_ID {
                    return Err(schema_error("too many singletons".to_string()));
                }
                def.singleton_id = Some(next_singleton);
                next_singleton += 1;
            }
            let qname = def.qname.clone();
            if records.insert(qname.clone(), def).is_some() {
                return Err(schema_error(format!("record '{}' declared twice", qname)));
            }
        }

        for def in records.values() {
            for container in &def.containers {
                let child = records.get(&container.type_name).ok_or_else(|| {
                    schema_error(format!(
                        "container '{}.{}' refers to unknown type '{}'",
                        def.qname, container.name, container.type_name
                    ))
                })?;
                if !def.kind.accepts_child(child.kind) {
                    return Err(schema_error(format!(
                        "container '{}.{}' cannot hold {:?} '{}'",
                        def.qname, container.name, child.kind, child.qname
                    )));
                }
            }
        }

        let kind_of = |qname: &QName| records.get(qname).map(|def| def.kind);
        let mut commands = HashMap::with_capacity(self.commands.len());
        for def in self.commands {
            if let Some(ParamKind::Object(param)) = &def.param {
                if !kind_of(param).map(RecordKind::is_argument).unwrap_or(false) {
                    return Err(schema_error(format!(
                        "parameter '{}' of '{}' must be a declared ODoc or Object",
                        param, def.qname
                    )));
                }
            }
            for object in def.unlogged_param.iter().chain(def.result.iter()) {
                if kind_of(object) != Some(RecordKind::Object) {
                    return Err(schema_error(format!(
                        "'{}' used by '{}' must be a declared Object",
                        object, def.qname
                    )));
                }
            }
            let qname = def.qname.clone();
            if commands.insert(qname.clone(), def).is_some() {
                return Err(schema_error(format!("command '{}' declared twice", qname)));
            }
        }

        let views = self.views.into_iter().collect::<HashSet<_>>();
        let mut projector_names = HashSet::new();
        for projector in &self.projectors {
            if !projector_names.insert(projector.qname.clone()) {
                return Err(schema_error(format!(
                    "projector '{}' declared twice",
                    projector.qname
                )));
            }
            if projector.triggers.is_empty() {
                return Err(schema_error(format!(
                    "projector '{}' has no triggers",
                    projector.qname
                )));
            }
            for trigger in &projector.triggers {
                let known = match trigger {
                    ProjectorTrigger::Command(command) => commands.contains_key(command),
                    ProjectorTrigger::Cud(record) => kind_of(record)
                        .map(RecordKind::accepts_cud)
                        .unwrap_or(false),
                };
                if !known {
                    return Err(schema_error(format!(
                        "projector '{}' has an unknown trigger {:?}",
                        projector.qname, trigger
                    )));
                }
            }
        }

        Ok(AppSchema {
            records,
            commands,
            projectors: self.projectors,
            views,
        })
    }
}

fn schema_error(message: String) -> ProcessorError {
    ProcessorError::Internal(format!("schema: {}", message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(name: &str) -> QName {
        name.parse().unwrap()
    }

    #[test]
    fn builder_registers_sys_definitions_and_singleton_ids() {
        let schema = AppSchema::builder()
            .record(RecordDef::new(q("app.Settings"), RecordKind::CDoc).singleton())
            .build()
            .unwrap();

        let descriptor = schema.record(&sys::workspace_descriptor()).unwrap();
        assert_eq!(descriptor.singleton_id, Some(FIRST_SINGLETON_ID));
        assert_eq!(
            schema.record(&q("app.Settings")).unwrap().singleton_id,
            Some(FIRST_SINGLETON_ID + 1)
        );
        assert!(schema.command(&sys::cud()).is_some());
        assert!(schema.command(&sys::init()).is_some());
    }

    #[test]
    fn containers_must_reference_compatible_kinds() {
        let result = AppSchema::builder()
            .record(RecordDef::new(q("app.Line"), RecordKind::CRecord))
            .record(
                RecordDef::new(q("app.Invoice"), RecordKind::ODoc).with_container(
                    "Lines",
                    q("app.Line"),
                    0,
                    None,
                ),
            )
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn command_parameter_must_be_an_argument_kind() {
        let result = AppSchema::builder()
            .record(RecordDef::new(q("app.Doc"), RecordKind::CDoc))
            .command(CommandDef::new(q("app.Do")).with_param(q("app.Doc")))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn projector_triggers_must_be_known() {
        let result = AppSchema::builder()
            .projector(ProjectorDef::new(q("app.P"), |_, _| Ok(())).on_command(q("app.Missing")))
            .build();
        assert!(result.is_err());
    }
}
