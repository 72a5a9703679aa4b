use super::{FieldKind, RecordDef};
use crate::core::{ProcessorError, RecordId, Result, sys};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// How strictly a field map is checked against its definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldCheck {
    /// Every required field must be present (inserts, arguments).
    Complete,
    /// Only the submitted fields are checked (updates).
    Partial,
}

/// System fields a record field map may carry besides the declared ones.
fn system_field_kind(name: &str) -> Option<FieldKind> {
    match name {
        sys::FIELD_IS_ACTIVE => Some(FieldKind::Bool),
        sys::FIELD_PARENT_ID => Some(FieldKind::RecordRef),
        sys::FIELD_CONTAINER => Some(FieldKind::Text),
        _ => None,
    }
}

pub(crate) fn field_kind_of(def: &RecordDef, name: &str) -> Option<FieldKind> {
    def.field(name)
        .map(|field| field.kind)
        .or_else(|| system_field_kind(name))
}

pub(crate) fn field_matches_kind(value: &JsonValue, kind: FieldKind) -> bool {
    match kind {
        FieldKind::Int => value.as_i64().is_some(),
        FieldKind::Float => value.as_f64().is_some(),
        FieldKind::Bool => value.is_boolean(),
        FieldKind::Text => value.is_string(),
        FieldKind::Json => true,
        FieldKind::RecordRef => value.as_u64().is_some(),
    }
}

pub(crate) fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(number) if number.is_i64() || number.is_u64() => "integer",
        JsonValue::Number(_) => "float",
        JsonValue::String(_) => "text",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Validates a field map against `def`.
pub(crate) fn validate_fields(
    def: &RecordDef,
    fields: &JsonMap<String, JsonValue>,
    check: FieldCheck,
) -> Result<()> {
    for (name, value) in fields {
        let kind = field_kind_of(def, name).ok_or_else(|| {
            ProcessorError::MalformedRequest(format!(
                "field '{}' is not declared by '{}'",
                name, def.qname
            ))
        })?;

        if value.is_null() {
            if def.field(name).map(|field| field.required).unwrap_or(false) {
                return Err(ProcessorError::MalformedRequest(format!(
                    "required field '{}.{}' must not be null",
                    def.qname, name
                )));
            }
            continue;
        }

        if !field_matches_kind(value, kind) {
            return Err(ProcessorError::MalformedRequest(format!(
                "field '{}.{}' type mismatch: expected {:?}, got {}",
                def.qname,
                name,
                kind,
                json_type_name(value)
            )));
        }
    }

    if check == FieldCheck::Complete {
        for field in def.fields.iter().filter(|field| field.required) {
            let present = fields
                .get(field.name.as_str())
                .map(|value| !value.is_null())
                .unwrap_or(false);
            if !present {
                return Err(ProcessorError::MalformedRequest(format!(
                    "missing required field '{}.{}'",
                    def.qname, field.name
                )));
            }
        }
    }

    Ok(())
}

/// Non-null record references held by `fields`.
pub(crate) fn record_refs<'a>(
    def: &'a RecordDef,
    fields: &'a JsonMap<String, JsonValue>,
) -> impl Iterator<Item = (&'a str, RecordId)> + 'a {
    fields.iter().filter_map(move |(name, value)| {
        if field_kind_of(def, name) != Some(FieldKind::RecordRef) {
            return None;
        }
        value
            .as_u64()
            .filter(|id| *id != crate::core::NULL_RECORD_ID)
            .map(|id| (name.as_str(), id))
    })
}
