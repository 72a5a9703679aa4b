//! Immutable PLog events and their construction.

use crate::core::{
    AppQName, Offset, PartitionId, ProcessorError, QName, RecordId, Result, WorkspaceId,
};
use crate::ids::{IdGenerator, is_raw_id};
use crate::schema::fields::field_kind_of;
use crate::schema::{AppSchema, FieldKind, RecordDef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::ops::Deref;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CudOp {
    Create,
    Update,
}

/// One create or update carried by an event, with storage IDs only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCud {
    pub op: CudOp,
    pub id: RecordId,
    pub qname: QName,
    /// Full field set for creates, changed fields for updates.
    pub fields: JsonMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgContainer {
    pub name: String,
    pub elements: Vec<ArgElement>,
}

/// A parsed argument object and its nested elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgElement {
    pub qname: QName,
    #[serde(default)]
    pub id: Option<RecordId>,
    pub fields: JsonMap<String, JsonValue>,
    /// Containers in the order the schema declares them.
    #[serde(default)]
    pub containers: Vec<ArgContainer>,
}

impl ArgElement {
    pub fn container(&self, name: &str) -> Option<&[ArgElement]> {
        self.containers
            .iter()
            .find(|container| container.name == name)
            .map(|container| container.elements.as_slice())
    }

    /// Depth-first walk in stored container order.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a ArgElement)) {
        visit(self);
        for container in &self.containers {
            for element in &container.elements {
                element.walk(visit);
            }
        }
    }

    fn walk_mut(&mut self, visit: &mut impl FnMut(&mut ArgElement) -> Result<()>) -> Result<()> {
        visit(self)?;
        for container in &mut self.containers {
            for element in &mut container.elements {
                element.walk_mut(visit)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub app: AppQName,
    pub partition: PartitionId,
    pub workspace: WorkspaceId,
    pub command: QName,
    pub plog_offset: Offset,
    pub wlog_offset: Offset,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub cuds: Vec<EventCud>,
    #[serde(default)]
    pub args: Option<ArgElement>,
    #[serde(default)]
    pub raw_arg: Option<String>,
    /// Login of the principal that submitted the command.
    #[serde(default)]
    pub submitted_by: Option<String>,
}

impl RawEvent {
    pub fn created_ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.cuds
            .iter()
            .filter(|cud| cud.op == CudOp::Create)
            .map(|cud| cud.id)
    }
}

/// Shared handle to an event accepted by the log.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedEvent(Arc<RawEvent>);

impl CommittedEvent {
    pub fn new(event: RawEvent) -> Self {
        Self(Arc::new(event))
    }
}

impl Deref for CommittedEvent {
    type Target = RawEvent;

    fn deref(&self) -> &RawEvent {
        &self.0
    }
}

struct PendingCud {
    op: CudOp,
    id: RecordId,
    qname: QName,
    fields: JsonMap<String, JsonValue>,
}

pub struct EventBuilder {
    event: RawEvent,
    cuds: Vec<PendingCud>,
}

impl EventBuilder {
    pub fn new(
        app: AppQName,
        partition: PartitionId,
        workspace: WorkspaceId,
        command: QName,
        plog_offset: Offset,
        wlog_offset: Offset,
        registered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event: RawEvent {
                app,
                partition,
                workspace,
                command,
                plog_offset,
                wlog_offset,
                registered_at,
                cuds: Vec::new(),
                args: None,
                raw_arg: None,
                submitted_by: None,
            },
            cuds: Vec::new(),
        }
    }

    /// `id` is a raw ID, or an explicit storage ID for privileged callers.
    pub fn create(&mut self, qname: QName, id: RecordId, fields: JsonMap<String, JsonValue>) {
        self.cuds.push(PendingCud {
            op: CudOp::Create,
            id,
            qname,
            fields,
        });
    }

    pub fn update(&mut self, qname: QName, id: RecordId, fields: JsonMap<String, JsonValue>) {
        self.cuds.push(PendingCud {
            op: CudOp::Update,
            id,
            qname,
            fields,
        });
    }

    pub fn args(&mut self, args: ArgElement) {
        self.event.args = Some(args);
    }

    pub fn raw_arg(&mut self, raw: String) {
        self.event.raw_arg = Some(raw);
    }

    pub fn submitted_by(&mut self, login: impl Into<String>) {
        self.event.submitted_by = Some(login.into());
    }

    /// Assigns storage IDs to every raw ID and rewrites raw references.
    pub fn build(self, schema: &AppSchema, ids: &mut IdGenerator) -> Result<RawEvent> {
        let Self { mut event, cuds } = self;

        let mut resolved = Vec::with_capacity(cuds.len());
        for cud in cuds {
            let def = record_def(schema, &cud.qname)?;
            let id = match cud.op {
                CudOp::Create if is_raw_id(cud.id) => ids.next_id(cud.id, def)?,
                CudOp::Create => {
                    ids.update_on_sync(cud.id);
                    cud.id
                }
                CudOp::Update => cud.id,
            };
            resolved.push((cud, id));
        }

        if let Some(args) = event.args.as_mut() {
            args.walk_mut(&mut |element| {
                if let Some(raw) = element.id.filter(|id| is_raw_id(*id)) {
                    let def = record_def(schema, &element.qname)?;
                    element.id = Some(ids.next_id(raw, def)?);
                }
                Ok(())
            })?;
        }

        for (cud, id) in resolved {
            let def = record_def(schema, &cud.qname)?;
            let mut fields = cud.fields;
            rewrite_raw_refs(def, &mut fields, ids)?;
            event.cuds.push(EventCud {
                op: cud.op,
                id,
                qname: cud.qname,
                fields,
            });
        }

        if let Some(args) = event.args.as_mut() {
            args.walk_mut(&mut |element| {
                let def = record_def(schema, &element.qname)?;
                rewrite_raw_refs(def, &mut element.fields, ids)
            })?;
        }

        Ok(event)
    }
}

fn record_def<'a>(schema: &'a AppSchema, qname: &QName) -> Result<&'a RecordDef> {
    schema
        .record(qname)
        .ok_or_else(|| ProcessorError::MalformedRequest(format!("unknown record type '{}'", qname)))
}

fn rewrite_raw_refs(
    def: &RecordDef,
    fields: &mut JsonMap<String, JsonValue>,
    ids: &IdGenerator,
) -> Result<()> {
    for (name, value) in fields.iter_mut() {
        if field_kind_of(def, name) != Some(FieldKind::RecordRef) {
            continue;
        }
        let Some(raw) = value.as_u64().filter(|id| is_raw_id(*id)) else {
            continue;
        };
        let id = ids.resolve(raw).ok_or_else(|| {
            ProcessorError::ReferentialIntegrityViolation(format!(
                "'{}.{}' refers to raw ID {} which is not created by this request",
                def.qname, name, raw
            ))
        })?;
        *value = JsonValue::from(id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdRegister;
    use crate::schema::{RecordDef, RecordKind};
    use serde_json::json;

    fn q(name: &str) -> QName {
        name.parse().unwrap()
    }

    fn schema() -> AppSchema {
        AppSchema::builder()
            .record(
                RecordDef::new(q("app.Customer"), RecordKind::CDoc)
                    .require_field("Name", FieldKind::Text),
            )
            .record(
                RecordDef::new(q("app.Order"), RecordKind::CDoc)
                    .optional_field("Customer", FieldKind::RecordRef),
            )
            .record(
                RecordDef::new(q("app.Line"), RecordKind::ORecord)
                    .optional_field("Customer", FieldKind::RecordRef),
            )
            .record(RecordDef::new(q("app.Receipt"), RecordKind::ODoc).with_container(
                "Lines",
                q("app.Line"),
                0,
                None,
            ))
            .build()
            .unwrap()
    }

    fn fields(value: JsonValue) -> JsonMap<String, JsonValue> {
        value.as_object().cloned().unwrap()
    }

    fn builder() -> EventBuilder {
        EventBuilder::new(
            "test/app".parse().unwrap(),
            1,
            100,
            q("sys.CUD"),
            1,
            1,
            Utc::now(),
        )
    }

    #[test]
    fn raw_references_are_rewritten_to_storage_ids() {
        let schema = schema();
        let mut ids = IdGenerator::new();
        let mut builder = builder();
        builder.create(q("app.Customer"), 1, fields(json!({"Name": "Ann"})));
        builder.create(q("app.Order"), 2, fields(json!({"Customer": 1})));

        let event = builder.build(&schema, &mut ids).unwrap();
        let customer = event.cuds[0].id;
        assert_eq!(customer, IdRegister::Catalog.base() + 1);
        assert_eq!(event.cuds[1].fields["Customer"], json!(customer));
        assert_eq!(ids.take_new_ids().len(), 2);
    }

    #[test]
    fn dangling_raw_reference_is_rejected() {
        let schema = schema();
        let mut ids = IdGenerator::new();
        let mut builder = builder();
        builder.create(q("app.Order"), 2, fields(json!({"Customer": 7})));

        assert!(matches!(
            builder.build(&schema, &mut ids),
            Err(ProcessorError::ReferentialIntegrityViolation(_))
        ));
    }

    #[test]
    fn argument_elements_get_operation_ids() {
        let schema = schema();
        let mut ids = IdGenerator::new();
        let mut builder = builder();
        builder.create(q("app.Customer"), 1, fields(json!({"Name": "Ann"})));
        builder.args(ArgElement {
            qname: q("app.Receipt"),
            id: Some(5),
            fields: JsonMap::new(),
            containers: vec![ArgContainer {
                name: "Lines".to_string(),
                elements: vec![ArgElement {
                    qname: q("app.Line"),
                    id: Some(6),
                    fields: fields(json!({"Customer": 1})),
                    containers: Vec::new(),
                }],
            }],
        });

        let event = builder.build(&schema, &mut ids).unwrap();
        let args = event.args.as_ref().unwrap();
        assert_eq!(args.id, Some(IdRegister::Operation.base() + 1));
        let line = &args.container("Lines").unwrap()[0];
        assert_eq!(line.id, Some(IdRegister::Operation.base() + 2));
        assert_eq!(line.fields["Customer"], json!(event.cuds[0].id));
    }

    #[test]
    fn explicit_storage_id_seeds_the_generator() {
        let schema = schema();
        let mut ids = IdGenerator::new();
        let explicit = IdRegister::Catalog.base() + 40;
        let mut builder = builder();
        builder.create(q("app.Customer"), explicit, fields(json!({"Name": "Ann"})));
        builder.create(q("app.Customer"), 1, fields(json!({"Name": "Bob"})));

        let event = builder.build(&schema, &mut ids).unwrap();
        assert_eq!(event.cuds[0].id, explicit);
        assert_eq!(event.cuds[1].id, explicit + 1);
    }
}
