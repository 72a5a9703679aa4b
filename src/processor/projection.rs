//! Synchronous projector fan-out sharing one rollback scope.

use crate::core::{ProcessorError, Result};
use crate::event::RawEvent;
use crate::extension::{ProjectorContext, ViewIntents};
use crate::schema::{AppSchema, ProjectorDef};
use crate::storage::{Storage, ViewBatch, ViewStore};
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{Level, event};

/// Runs a projector handler, converting a panic into an error.
fn invoke_projector(
    projector: &ProjectorDef,
    ctx: &ProjectorContext<'_>,
    intents: &mut ViewIntents,
) -> Result<()> {
    catch_unwind(AssertUnwindSafe(|| (projector.handler)(ctx, intents))).map_err(|_| {
        ProcessorError::ProjectionFailed(format!("projector '{}' panicked", projector.qname))
    })?
}

/// Applies every subscribed projector that has not seen `raw` yet.
///
/// Intents of all projectors are committed together with their offsets, or
/// not at all. Returns the number of projectors applied.
pub(crate) async fn apply_sync_projections(
    schema: &AppSchema,
    storage: &dyn Storage,
    raw: &RawEvent,
) -> Result<usize> {
    let mut pending = Vec::new();
    for projector in schema.projectors_for(raw) {
        if storage.projector_offset(raw.partition, &projector.qname)? < raw.plog_offset {
            pending.push(projector);
        }
    }
    if pending.is_empty() {
        return Ok(0);
    }

    let ctx = ProjectorContext::new(raw, storage);
    let mut batch = ViewBatch {
        partition: raw.partition,
        workspace: raw.workspace,
        plog_offset: raw.plog_offset,
        projectors: Vec::with_capacity(pending.len()),
        intents: Vec::new(),
    };

    for projector in pending {
        let mut intents = ViewIntents::new();
        invoke_projector(projector, &ctx, &mut intents).map_err(|err| match err {
            ProcessorError::ProjectionFailed(_) => err,
            other => ProcessorError::ProjectionFailed(format!(
                "projector '{}': {}",
                projector.qname, other
            )),
        })?;

        for intent in intents.into_vec() {
            if !schema.has_view(&intent.view) {
                return Err(ProcessorError::ProjectionFailed(format!(
                    "projector '{}' writes undeclared view '{}'",
                    projector.qname, intent.view
                )));
            }
            batch.intents.push(intent);
        }
        batch.projectors.push(projector.qname.clone());
    }

    let applied = batch.projectors.len();
    storage.apply_view_batch(batch).await.map_err(|err| {
        ProcessorError::ProjectionFailed(format!(
            "view batch at PLog offset {}: {}",
            raw.plog_offset, err
        ))
    })?;
    event!(
        Level::DEBUG,
        partition = raw.partition,
        plog_offset = raw.plog_offset,
        projectors = applied,
        "sync projections applied"
    );
    Ok(applied)
}
