//! Parsing and policy checks of submitted CUDs.

use crate::auth::OperationKind;
use crate::core::{ProcessorError, QName, RecordId, Result, WorkspaceId, sys};
use crate::event::CudOp;
use crate::ids::is_raw_id;
use crate::schema::fields::{FieldCheck, validate_fields};
use crate::schema::{AppSchema, RecordDef};
use crate::storage::{Record, RecordStore};
use serde_json::{Map as JsonMap, Value as JsonValue};

const CUD_FIELDS: &str = "fields";

/// One create or update taken from the request body.
#[derive(Debug, Clone)]
pub(crate) struct ParsedCud {
    pub op: CudOp,
    pub qname: QName,
    /// Raw or explicit ID for creates, the target's storage ID for updates.
    pub id: RecordId,
    pub fields: JsonMap<String, JsonValue>,
    /// Current state of the update target.
    pub existing: Option<Record>,
}

impl ParsedCud {
    pub fn operation_kind(&self) -> OperationKind {
        match self.op {
            CudOp::Create => OperationKind::Insert,
            CudOp::Update if self.is_activation_only() => {
                match self.fields.get(sys::FIELD_IS_ACTIVE).and_then(JsonValue::as_bool) {
                    Some(false) => OperationKind::Deactivate,
                    _ => OperationKind::Activate,
                }
            }
            CudOp::Update => OperationKind::Update,
        }
    }

    /// Touched fields, sorted.
    pub fn field_names(&self) -> Vec<String> {
        let mut names = self.fields.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    fn is_activation_only(&self) -> bool {
        self.fields.len() == 1 && self.fields.contains_key(sys::FIELD_IS_ACTIVE)
    }
}

/// Parses the `cuds` body member.
///
/// An entry carrying a top-level `sys.ID` updates that record; any other
/// entry creates one from `fields`, which must name `sys.ID` and `sys.QName`.
pub(crate) fn parse_cuds<S: RecordStore + ?Sized>(
    schema: &AppSchema,
    store: &S,
    workspace: WorkspaceId,
    value: Option<&JsonValue>,
    max_cuds: usize,
    system_caller: bool,
) -> Result<Vec<ParsedCud>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let entries = value
        .as_array()
        .ok_or_else(|| ProcessorError::MalformedRequest("'cuds' must be an array".to_string()))?;
    if entries.len() > max_cuds {
        return Err(ProcessorError::MalformedRequest(format!(
            "{} CUDs exceed the limit of {}",
            entries.len(),
            max_cuds
        )));
    }

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let entry = entry.as_object().ok_or_else(|| {
                ProcessorError::MalformedRequest(format!("cuds[{}] must be an object", index))
            })?;
            let fields = entry
                .get(CUD_FIELDS)
                .and_then(JsonValue::as_object)
                .cloned()
                .ok_or_else(|| {
                    ProcessorError::MalformedRequest(format!(
                        "cuds[{}].{} must be an object",
                        index, CUD_FIELDS
                    ))
                })?;
            match entry.get(sys::FIELD_ID) {
                Some(id) => parse_update(schema, store, workspace, index, id, fields),
                None => parse_create(schema, index, fields, system_caller),
            }
        })
        .collect()
}

fn cud_def<'a>(schema: &'a AppSchema, index: usize, qname: &QName) -> Result<&'a RecordDef> {
    let def = schema.record(qname).ok_or_else(|| {
        ProcessorError::MalformedRequest(format!("cuds[{}]: unknown type '{}'", index, qname))
    })?;
    if !def.kind.accepts_cud() {
        return Err(ProcessorError::MalformedRequest(format!(
            "cuds[{}]: {:?} '{}' cannot be changed by CUDs",
            index, def.kind, qname
        )));
    }
    Ok(def)
}

fn parse_create(
    schema: &AppSchema,
    index: usize,
    mut fields: JsonMap<String, JsonValue>,
    system_caller: bool,
) -> Result<ParsedCud> {
    let id = fields
        .remove(sys::FIELD_ID)
        .and_then(|id| id.as_u64())
        .filter(|id| *id != crate::core::NULL_RECORD_ID)
        .ok_or_else(|| {
            ProcessorError::MalformedRequest(format!(
                "cuds[{}]: a new record needs a non-zero '{}'",
                index,
                sys::FIELD_ID
            ))
        })?;
    if !is_raw_id(id) && !system_caller {
        return Err(ProcessorError::MalformedRequest(format!(
            "cuds[{}]: '{}' {} is not a raw ID",
            index,
            sys::FIELD_ID,
            id
        )));
    }

    let qname = fields
        .remove(sys::FIELD_QNAME)
        .and_then(|qname| qname.as_str().map(str::to_string))
        .ok_or_else(|| {
            ProcessorError::MalformedRequest(format!(
                "cuds[{}]: a new record needs '{}'",
                index,
                sys::FIELD_QNAME
            ))
        })?
        .parse::<QName>()
        .map_err(|err| ProcessorError::MalformedRequest(format!("cuds[{}]: {}", index, err)))?;

    let def = cud_def(schema, index, &qname)?;
    validate_fields(def, &fields, FieldCheck::Complete)?;

    Ok(ParsedCud {
        op: CudOp::Create,
        qname,
        id,
        fields,
        existing: None,
    })
}

fn parse_update<S: RecordStore + ?Sized>(
    schema: &AppSchema,
    store: &S,
    workspace: WorkspaceId,
    index: usize,
    id: &JsonValue,
    mut fields: JsonMap<String, JsonValue>,
) -> Result<ParsedCud> {
    let id = id
        .as_u64()
        .filter(|id| *id != crate::core::NULL_RECORD_ID)
        .ok_or_else(|| {
            ProcessorError::MalformedRequest(format!(
                "cuds[{}]: '{}' must be a record ID",
                index,
                sys::FIELD_ID
            ))
        })?;
    if fields.remove(sys::FIELD_ID).is_some() {
        return Err(ProcessorError::MalformedRequest(format!(
            "cuds[{}]: '{}' cannot be changed",
            index,
            sys::FIELD_ID
        )));
    }

    let existing = store.get_record(workspace, id)?.ok_or_else(|| {
        ProcessorError::RecordNotFound(format!("record {} in workspace {}", id, workspace))
    })?;
    if let Some(qname) = fields.remove(sys::FIELD_QNAME) {
        if qname.as_str() != Some(existing.qname.to_string().as_str()) {
            return Err(ProcessorError::MalformedRequest(format!(
                "cuds[{}]: record {} is a '{}'",
                index, id, existing.qname
            )));
        }
    }

    let def = cud_def(schema, index, &existing.qname)?;
    if fields.is_empty() {
        return Err(ProcessorError::MalformedRequest(format!(
            "cuds[{}]: update of record {} changes nothing",
            index, id
        )));
    }
    validate_fields(def, &fields, FieldCheck::Partial)?;

    Ok(ParsedCud {
        op: CudOp::Update,
        qname: existing.qname.clone(),
        id,
        fields,
        existing: Some(existing),
    })
}

/// CUDs ride only on the CUD commands, and activation flips stand alone.
pub(crate) fn check_cud_policy(command: &QName, cuds: &[ParsedCud]) -> Result<()> {
    if cuds.is_empty() {
        return Ok(());
    }
    if !sys::is_cud_command(command) {
        return Err(ProcessorError::MalformedRequest(format!(
            "'{}' cannot carry CUDs",
            command
        )));
    }
    for cud in cuds.iter().filter(|cud| cud.op == CudOp::Update) {
        if cud.fields.contains_key(sys::FIELD_IS_ACTIVE) && cud.fields.len() > 1 {
            return Err(ProcessorError::MalformedRequest(format!(
                "update of record {} mixes '{}' with other fields",
                cud.id,
                sys::FIELD_IS_ACTIVE
            )));
        }
    }
    Ok(())
}
