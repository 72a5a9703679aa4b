//! Request body decoding into argument objects.

use crate::core::{ProcessorError, QName, Result, WorkspaceId, sys};
use crate::event::{ArgContainer, ArgElement};
use crate::ids::is_raw_id;
use crate::schema::fields::{FieldCheck, json_type_name, record_refs, validate_fields};
use crate::schema::{AppSchema, CommandDef, ParamKind, RecordDef, RecordKind};
use crate::storage::RecordStore;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;

const BODY_ARGS: &str = "args";
const BODY_UNLOGGED_ARGS: &str = "unloggedArgs";
const BODY_CUDS: &str = "cuds";

/// Structured parts of a command body.
#[derive(Debug, Default)]
pub(crate) struct DecodedBody {
    pub args: Option<ArgElement>,
    pub unlogged: Option<ArgElement>,
    pub raw_arg: Option<String>,
    pub cuds: Option<JsonValue>,
}

/// Splits the body into arguments, unlogged arguments and CUDs.
///
/// Commands with a raw parameter receive the body untouched.
pub(crate) fn decode_body(schema: &AppSchema, command: &CommandDef, body: &str) -> Result<DecodedBody> {
    if command.param == Some(ParamKind::Raw) {
        return Ok(DecodedBody {
            raw_arg: Some(body.to_string()),
            ..DecodedBody::default()
        });
    }

    let mut object = if body.trim().is_empty() {
        JsonMap::new()
    } else {
        match serde_json::from_str::<JsonValue>(body) {
            Ok(JsonValue::Object(object)) => object,
            Ok(other) => {
                return Err(ProcessorError::MalformedRequest(format!(
                    "body must be a JSON object, got {}",
                    json_type_name(&other)
                )));
            }
            Err(err) => {
                return Err(ProcessorError::MalformedRequest(format!(
                    "body is not valid JSON: {}",
                    err
                )));
            }
        }
    };

    let args = object.remove(BODY_ARGS);
    let unlogged = object.remove(BODY_UNLOGGED_ARGS);
    let cuds = object.remove(BODY_CUDS);
    if let Some(unknown) = object.keys().next() {
        return Err(ProcessorError::MalformedRequest(format!(
            "unexpected body member '{}'",
            unknown
        )));
    }

    let args = match (&command.param, args) {
        (Some(ParamKind::Object(type_name)), value) => {
            let def = argument_def(schema, type_name)?;
            let value = value.unwrap_or_else(|| JsonValue::Object(JsonMap::new()));
            Some(parse_element(schema, def, &value, BODY_ARGS)?)
        }
        (_, None) => None,
        (_, Some(_)) => {
            return Err(ProcessorError::MalformedRequest(format!(
                "'{}' takes no arguments",
                command.qname
            )));
        }
    };

    let unlogged = match (&command.unlogged_param, unlogged) {
        (Some(type_name), value) => {
            let def = argument_def(schema, type_name)?;
            let value = value.unwrap_or_else(|| JsonValue::Object(JsonMap::new()));
            Some(parse_element(schema, def, &value, BODY_UNLOGGED_ARGS)?)
        }
        (None, None) => None,
        (None, Some(_)) => {
            return Err(ProcessorError::MalformedRequest(format!(
                "'{}' takes no unlogged arguments",
                command.qname
            )));
        }
    };

    Ok(DecodedBody {
        args,
        unlogged,
        raw_arg: None,
        cuds,
    })
}

fn argument_def<'a>(schema: &'a AppSchema, type_name: &QName) -> Result<&'a RecordDef> {
    schema.record(type_name).ok_or_else(|| {
        ProcessorError::Internal(format!("argument type '{}' is not declared", type_name))
    })
}

/// Parses one argument element and its containers, recursively.
fn parse_element(
    schema: &AppSchema,
    def: &RecordDef,
    value: &JsonValue,
    path: &str,
) -> Result<ArgElement> {
    let object = value.as_object().ok_or_else(|| {
        ProcessorError::MalformedRequest(format!("'{}' must be an object", path))
    })?;

    let mut id = None;
    let mut fields = JsonMap::new();
    let mut nested: HashMap<&str, Vec<ArgElement>> = HashMap::new();

    for (name, value) in object {
        match name.as_str() {
            sys::FIELD_ID => {
                if !matches!(def.kind, RecordKind::ODoc | RecordKind::ORecord) {
                    return Err(ProcessorError::MalformedRequest(format!(
                        "'{}' of type '{}' cannot carry '{}'",
                        path,
                        def.qname,
                        sys::FIELD_ID
                    )));
                }
                let raw = value.as_u64().filter(|raw| is_raw_id(*raw)).ok_or_else(|| {
                    ProcessorError::MalformedRequest(format!(
                        "'{}.{}' must be a raw ID",
                        path,
                        sys::FIELD_ID
                    ))
                })?;
                id = Some(raw);
            }
            sys::FIELD_QNAME => {
                if value.as_str() != Some(def.qname.to_string().as_str()) {
                    return Err(ProcessorError::MalformedRequest(format!(
                        "'{}' must be of type '{}'",
                        path, def.qname
                    )));
                }
            }
            _ => match def.container(name) {
                Some(container) => {
                    let child = schema.record(&container.type_name).ok_or_else(|| {
                        ProcessorError::Internal(format!(
                            "container type '{}' is not declared",
                            container.type_name
                        ))
                    })?;
                    let items = value.as_array().ok_or_else(|| {
                        ProcessorError::MalformedRequest(format!(
                            "container '{}.{}' must be an array",
                            path, name
                        ))
                    })?;
                    let mut elements = Vec::with_capacity(items.len());
                    for (index, item) in items.iter().enumerate() {
                        let child_path = format!("{}.{}[{}]", path, name, index);
                        elements.push(parse_element(schema, child, item, &child_path)?);
                    }
                    nested.insert(container.name.as_str(), elements);
                }
                None => {
                    fields.insert(name.clone(), value.clone());
                }
            },
        }
    }

    validate_fields(def, &fields, FieldCheck::Complete)?;

    let mut containers = Vec::new();
    for container in &def.containers {
        let elements = nested.remove(container.name.as_str()).unwrap_or_default();
        let count = elements.len();
        if count < container.min_occurs || container.max_occurs.is_some_and(|max| count > max) {
            return Err(ProcessorError::MalformedRequest(format!(
                "container '{}.{}' holds {} elements, expected {}..{}",
                path,
                container.name,
                count,
                container.min_occurs,
                container
                    .max_occurs
                    .map(|max| max.to_string())
                    .unwrap_or_default()
            )));
        }
        if count > 0 {
            containers.push(ArgContainer {
                name: container.name.clone(),
                elements,
            });
        }
    }

    Ok(ArgElement {
        qname: def.qname.clone(),
        id,
        fields,
        containers,
    })
}

/// Fails unless every stored record referenced by `element` exists.
///
/// Raw references are resolved when the event is built.
pub(crate) fn check_arg_references<S: RecordStore + ?Sized>(
    schema: &AppSchema,
    store: &S,
    workspace: WorkspaceId,
    element: &ArgElement,
) -> Result<()> {
    let mut outcome = Ok(());
    element.walk(&mut |element| {
        if outcome.is_err() {
            return;
        }
        if let Some(def) = schema.record(&element.qname) {
            outcome = check_references(store, workspace, def, &element.fields);
        }
    });
    outcome
}

pub(crate) fn check_references<S: RecordStore + ?Sized>(
    store: &S,
    workspace: WorkspaceId,
    def: &RecordDef,
    fields: &JsonMap<String, JsonValue>,
) -> Result<()> {
    for (name, id) in record_refs(def, fields).filter(|(_, id)| !is_raw_id(*id)) {
        if store.get_record(workspace, id)?.is_none() {
            return Err(ProcessorError::ReferentialIntegrityViolation(format!(
                "'{}.{}' refers to missing record {}",
                def.qname, name, id
            )));
        }
    }
    Ok(())
}
