//! The ordered, short-circuiting command pipeline.
//!
//! Every request walks the same stages in the same order. A failing stage
//! ends the request; nothing before the durable append leaves a trace, and
//! nothing after it is rolled back.

use super::appparts::{AppPartitions, BorrowedPartition};
use super::args::{check_arg_references, check_references, decode_body};
use super::cud::{ParsedCud, check_cud_policy, parse_cuds};
use super::message::{CommandRequest, CommandResponse};
use super::partition::PartitionState;
use super::policy::ProcessorPolicy;
use super::projection::apply_sync_projections;
use super::ratelimit::RateLimiter;
use super::recovery::recover_partition;
use super::service::ProcessorCounters;
use crate::auth::{
    AuthnOutcome, AuthnRequest, Authenticator, Authorizer, AuthzRequest, OperationKind, Principal,
};
use crate::core::{ProcessorError, RecordId, Result, StatusClass, sys};
use crate::event::{ArgElement, CommittedEvent, CudOp, EventBuilder};
use crate::extension::ExecContext;
use crate::notify::{Notifier, ProjectionKey};
use crate::schema::fields::{FieldCheck, validate_fields};
use crate::schema::{AppSchema, CommandDef};
use crate::storage::{AppendError, EventLog, Record, RecordStore, Storage};
use chrono::Utc;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

const STAGE_ACQUIRE: &str = "partition acquisition";
const STAGE_RECOVERY: &str = "partition recovery";
const STAGE_DESCRIPTOR: &str = "workspace descriptor";
const STAGE_INITIALIZED: &str = "workspace initialized";
const STAGE_ACTIVE: &str = "workspace active";
const STAGE_RATE_LIMIT: &str = "rate limit";
const STAGE_AUTHN: &str = "authentication";
const STAGE_AUTHZ: &str = "authorization";
const STAGE_BODY: &str = "body decoding";
const STAGE_CUDS: &str = "cud parsing";
const STAGE_CUD_POLICY: &str = "cud policy";
const STAGE_REFERENCES: &str = "reference integrity";
const STAGE_CUD_AUTHZ: &str = "cud authorization";
const STAGE_BUILD: &str = "event construction";
const STAGE_APPEND: &str = "append";
const STAGE_EXTENSION: &str = "extension";
const STAGE_RESULT: &str = "result validation";
const STAGE_PROJECTIONS: &str = "sync projections";
const STAGE_NOTIFY: &str = "notification";

/// Collaborators shared by every partition worker of a processor.
pub(crate) struct PipelineServices {
    pub partitions: Arc<AppPartitions>,
    pub authenticator: Arc<dyn Authenticator>,
    pub authorizer: Arc<dyn Authorizer>,
    pub notifier: Arc<dyn Notifier>,
    pub rate_limiter: RateLimiter,
    pub policy: ProcessorPolicy,
    pub counters: ProcessorCounters,
}

/// Caller-side cancellation: an explicit token or a dropped reply receiver.
pub(crate) struct CancelCheck<'a> {
    token: &'a CancellationToken,
    reply: &'a oneshot::Sender<CommandResponse>,
}

impl<'a> CancelCheck<'a> {
    pub fn new(token: &'a CancellationToken, reply: &'a oneshot::Sender<CommandResponse>) -> Self {
        Self { token, reply }
    }

    fn check(&self, stage: &str) -> Result<()> {
        if self.token.is_cancelled() || self.reply.is_closed() {
            return Err(ProcessorError::Cancelled(format!("before {}", stage)));
        }
        Ok(())
    }
}

/// Per-request state threaded through the stages.
struct CommandContext<'r> {
    request: &'r CommandRequest,
    stage: &'static str,
    partition: BorrowedPartition,
    schema: Arc<AppSchema>,
    storage: Arc<dyn Storage>,
    command: CommandDef,
    descriptor: Option<Record>,
    authn: Option<AuthnOutcome>,
    args: Option<ArgElement>,
    unlogged: Option<ArgElement>,
    raw_arg: Option<String>,
    raw_cuds: Option<JsonValue>,
    cuds: Vec<ParsedCud>,
    event: Option<CommittedEvent>,
    new_ids: BTreeMap<RecordId, RecordId>,
    result: Option<JsonMap<String, JsonValue>>,
}

impl<'r> CommandContext<'r> {
    fn new(request: &'r CommandRequest, partition: BorrowedPartition) -> Result<Self> {
        let schema = partition.shared_schema();
        let command = schema.command(&request.command).cloned().ok_or_else(|| {
            ProcessorError::MalformedRequest(format!(
                "command '{}' is not declared by '{}'",
                request.command, request.app
            ))
        })?;
        Ok(Self {
            request,
            stage: STAGE_ACQUIRE,
            storage: partition.shared_storage(),
            partition,
            schema,
            command,
            descriptor: None,
            authn: None,
            args: None,
            unlogged: None,
            raw_arg: None,
            raw_cuds: None,
            cuds: Vec::new(),
            event: None,
            new_ids: BTreeMap::new(),
            result: None,
        })
    }

    /// Enters a stage that may still be cancelled.
    fn checkpoint(&mut self, stage: &'static str, cancel: &CancelCheck<'_>) -> Result<()> {
        self.stage = stage;
        cancel.check(stage)
    }

    async fn run(
        &mut self,
        services: &PipelineServices,
        state: &mut Option<PartitionState>,
        cancel: &CancelCheck<'_>,
    ) -> Result<CommandResponse> {
        if state.is_none() {
            self.checkpoint(STAGE_RECOVERY, cancel)?;
            let recovered = recover_partition(
                &self.schema,
                self.storage.as_ref(),
                self.request.partition,
                services.policy.recovery.reapply,
            )
            .await?;
            services.counters.recovered();
            *state = Some(recovered);
        }

        self.checkpoint(STAGE_DESCRIPTOR, cancel)?;
        self.fetch_descriptor()?;
        self.checkpoint(STAGE_INITIALIZED, cancel)?;
        self.check_initialized(services).await?;
        self.checkpoint(STAGE_ACTIVE, cancel)?;
        self.check_active(services).await?;
        self.checkpoint(STAGE_RATE_LIMIT, cancel)?;
        services
            .rate_limiter
            .check(&self.request.command, self.request.workspace)?;
        self.checkpoint(STAGE_AUTHN, cancel)?;
        self.authenticate(services).await?;
        self.checkpoint(STAGE_AUTHZ, cancel)?;
        self.authorize_execute(services)?;
        self.checkpoint(STAGE_BODY, cancel)?;
        self.decode_body()?;
        self.checkpoint(STAGE_CUDS, cancel)?;
        self.parse_cuds(services)?;
        self.checkpoint(STAGE_CUD_POLICY, cancel)?;
        check_cud_policy(&self.command.qname, &self.cuds)?;
        self.checkpoint(STAGE_REFERENCES, cancel)?;
        self.check_references()?;
        self.checkpoint(STAGE_CUD_AUTHZ, cancel)?;
        self.authorize_cuds(services)?;
        self.checkpoint(STAGE_BUILD, cancel)?;
        self.build_and_append(state, cancel).await?;

        self.stage = STAGE_EXTENSION;
        self.invoke_extension()?;
        self.stage = STAGE_RESULT;
        self.validate_result()?;
        self.stage = STAGE_PROJECTIONS;
        self.apply_projections().await?;
        self.stage = STAGE_NOTIFY;
        self.notify(services);
        self.into_response()
    }

    fn fetch_descriptor(&mut self) -> Result<()> {
        self.descriptor = match self.schema.record(&sys::workspace_descriptor()) {
            Some(def) => self.storage.get_singleton(self.request.workspace, def)?,
            None => None,
        };
        Ok(())
    }

    /// Whether the caller is the system principal.
    ///
    /// Authenticates on demand; a caller that fails here is simply not the
    /// system and gets the proper error at the authentication stage.
    async fn is_system_caller(&mut self, services: &PipelineServices) -> bool {
        if self.authn.is_none() {
            match services.authenticator.authenticate(self.authn_request()).await {
                Ok(outcome) => self.authn = Some(outcome),
                Err(_) => return false,
            }
        }
        self.authn.as_ref().is_some_and(AuthnOutcome::is_system)
    }

    fn authn_request(&self) -> AuthnRequest<'r> {
        AuthnRequest {
            host: &self.request.host,
            workspace: self.request.workspace,
            token: self.request.token.as_deref(),
        }
    }

    async fn check_initialized(&mut self, services: &PipelineServices) -> Result<()> {
        let initialized = self
            .descriptor
            .as_ref()
            .and_then(|descriptor| descriptor.as_i64(sys::DESCRIPTOR_FIELD_INIT_COMPLETED_AT_MS))
            .is_some_and(|completed_at| completed_at > 0);
        if initialized || sys::bootstrap_commands().contains(&self.command.qname) {
            return Ok(());
        }
        if self.is_system_caller(services).await {
            return Ok(());
        }
        Err(ProcessorError::WorkspaceNotInitialized(self.request.workspace))
    }

    async fn check_active(&mut self, services: &PipelineServices) -> Result<()> {
        let inactive = self
            .descriptor
            .as_ref()
            .and_then(|descriptor| descriptor.as_i64(sys::DESCRIPTOR_FIELD_STATUS))
            .is_some_and(|status| status != sys::WORKSPACE_STATUS_ACTIVE);
        if !inactive || self.is_system_caller(services).await {
            return Ok(());
        }
        Err(ProcessorError::WorkspaceInactive(self.request.workspace))
    }

    async fn authenticate(&mut self, services: &PipelineServices) -> Result<()> {
        if self.authn.is_none() {
            let outcome = services
                .authenticator
                .authenticate(self.authn_request())
                .await?;
            self.authn = Some(outcome);
        }
        Ok(())
    }

    fn principals(&self) -> &[Principal] {
        self.authn
            .as_ref()
            .map(|outcome| outcome.principals.as_slice())
            .unwrap_or(&[])
    }

    fn authorize_execute(&self, services: &PipelineServices) -> Result<()> {
        let request = AuthzRequest {
            operation: OperationKind::Execute,
            resource: &self.command.qname,
            fields: &[],
        };
        if !services.authorizer.authorize(self.principals(), request)? {
            return Err(ProcessorError::AuthorizationDenied(format!(
                "execute '{}'",
                self.command.qname
            )));
        }
        Ok(())
    }

    fn decode_body(&mut self) -> Result<()> {
        let decoded = decode_body(&self.schema, &self.command, &self.request.body)?;
        self.args = decoded.args;
        self.unlogged = decoded.unlogged;
        self.raw_arg = decoded.raw_arg;
        self.raw_cuds = decoded.cuds;
        Ok(())
    }

    fn parse_cuds(&mut self, services: &PipelineServices) -> Result<()> {
        let system_caller = self.authn.as_ref().is_some_and(AuthnOutcome::is_system);
        self.cuds = parse_cuds(
            &self.schema,
            self.storage.as_ref(),
            self.request.workspace,
            self.raw_cuds.as_ref(),
            services.policy.cud.max_cuds,
            system_caller,
        )?;
        Ok(())
    }

    fn check_references(&self) -> Result<()> {
        let storage = self.storage.as_ref();
        let workspace = self.request.workspace;
        for element in self.args.iter().chain(self.unlogged.iter()) {
            check_arg_references(&self.schema, storage, workspace, element)?;
        }
        for cud in &self.cuds {
            if let Some(def) = self.schema.record(&cud.qname) {
                check_references(storage, workspace, def, &cud.fields)?;
            }
        }
        Ok(())
    }

    fn authorize_cuds(&self, services: &PipelineServices) -> Result<()> {
        for cud in &self.cuds {
            let fields = cud.field_names();
            let request = AuthzRequest {
                operation: cud.operation_kind(),
                resource: &cud.qname,
                fields: &fields,
            };
            if !services.authorizer.authorize(self.principals(), request)? {
                return Err(ProcessorError::AuthorizationDenied(format!(
                    "{:?} '{}' record {}",
                    request.operation, cud.qname, cud.id
                )));
            }
        }
        Ok(())
    }

    /// Builds the event against staged workspace state and appends it.
    ///
    /// The staged state replaces the live one only after a successful append;
    /// a fatal append drops the whole partition state for recovery.
    async fn build_and_append(
        &mut self,
        state: &mut Option<PartitionState>,
        cancel: &CancelCheck<'_>,
    ) -> Result<()> {
        let request = self.request;
        let live = state.as_ref().ok_or_else(|| {
            ProcessorError::Internal(format!("partition {} has no state", request.partition))
        })?;
        let mut staged = live.workspace(request.workspace).cloned().unwrap_or_default();

        let mut builder = EventBuilder::new(
            request.app.clone(),
            request.partition,
            request.workspace,
            self.command.qname.clone(),
            live.next_plog_offset(),
            staged.next_wlog_offset(),
            Utc::now(),
        );
        for cud in self.cuds.drain(..) {
            match cud.op {
                CudOp::Create => builder.create(cud.qname, cud.id, cud.fields),
                CudOp::Update => builder.update(cud.qname, cud.id, cud.fields),
            }
        }
        if let Some(args) = self.args.take() {
            builder.args(args);
        }
        if let Some(raw) = &self.raw_arg {
            builder.raw_arg(raw.clone());
        }
        if let Some(login) = self.authn.as_ref().and_then(AuthnOutcome::login) {
            builder.submitted_by(login);
        }
        let raw = builder.build(&self.schema, &mut staged.ids)?;

        self.checkpoint(STAGE_APPEND, cancel)?;
        let (plog_offset, wlog_offset) = (raw.plog_offset, raw.wlog_offset);
        match self.storage.append(raw).await {
            Ok(committed) => {
                staged.next_wlog_offset = wlog_offset + 1;
                self.new_ids = staged.ids.take_new_ids();
                if let Some(live) = state.as_mut() {
                    live.put_workspace(request.workspace, staged);
                    live.next_plog_offset = plog_offset + 1;
                }
                event!(
                    Level::DEBUG,
                    plog_offset,
                    wlog_offset,
                    new_ids = self.new_ids.len(),
                    "event appended"
                );
                self.event = Some(committed);
                Ok(())
            }
            Err(AppendError::Conflict(message)) => Err(ProcessorError::RecordIdConflict(message)),
            Err(AppendError::Misrouted(message)) => Err(ProcessorError::MalformedRequest(message)),
            Err(AppendError::Fatal(message)) => {
                *state = None;
                event!(
                    Level::ERROR,
                    partition = request.partition,
                    plog_offset,
                    error = %message,
                    "append failed, partition state dropped for recovery"
                );
                Err(ProcessorError::FatalAppendFailure(message))
            }
        }
    }

    fn committed(&self) -> Result<CommittedEvent> {
        self.event
            .clone()
            .ok_or_else(|| ProcessorError::Internal("no committed event".to_string()))
    }

    fn invoke_extension(&mut self) -> Result<()> {
        let committed = self.committed()?;
        let principals = self
            .authn
            .as_ref()
            .map(|outcome| outcome.principals.as_slice())
            .unwrap_or(&[]);
        let mut exec = ExecContext::new(
            &committed,
            self.unlogged.as_ref(),
            self.raw_arg.as_deref(),
            self.storage.as_ref(),
            principals,
        );
        self.partition
            .invoke(&self.command, &mut exec)
            .map_err(|err| {
                ProcessorError::ExtensionExecutionFault(format!("'{}': {}", self.command.qname, err))
            })?;

        if exec.response_intents > 1 {
            return Err(ProcessorError::InvalidIntents(format!(
                "'{}' produced {} responses",
                self.command.qname, exec.response_intents
            )));
        }
        self.result = exec.response.take();
        Ok(())
    }

    fn validate_result(&self) -> Result<()> {
        match (&self.command.result, &self.result) {
            (Some(type_name), Some(result)) => {
                let def = self.schema.record(type_name).ok_or_else(|| {
                    ProcessorError::Internal(format!("result type '{}' is not declared", type_name))
                })?;
                validate_fields(def, result, FieldCheck::Complete).map_err(|err| {
                    ProcessorError::InvalidIntents(format!("result of '{}': {}", self.command.qname, err))
                })
            }
            (None, Some(_)) => Err(ProcessorError::InvalidIntents(format!(
                "'{}' declares no result",
                self.command.qname
            ))),
            (_, None) => Ok(()),
        }
    }

    async fn apply_projections(&self) -> Result<()> {
        let committed = self.committed()?;
        apply_sync_projections(&self.schema, self.storage.as_ref(), &committed).await?;
        Ok(())
    }

    fn notify(&self, services: &PipelineServices) {
        let Some(committed) = &self.event else {
            return;
        };
        let key = ProjectionKey {
            app: self.request.app.clone(),
            projection: sys::plog_projection(),
            workspace: u64::from(self.request.partition),
        };
        if let Err(err) = services.notifier.publish(key, committed.plog_offset) {
            event!(Level::WARN, error = %err, "plog notification failed");
        }
    }

    fn into_response(&mut self) -> Result<CommandResponse> {
        let committed = self.committed()?;
        Ok(CommandResponse::Success {
            current_wlog_offset: committed.wlog_offset,
            new_ids: std::mem::take(&mut self.new_ids),
            result: self.result.take(),
        })
    }
}

/// Runs one request through every stage.
///
/// `state` is `None` until the partition is recovered and becomes `None`
/// again after a fatal append.
pub(crate) async fn process(
    services: &PipelineServices,
    state: &mut Option<PartitionState>,
    request: &CommandRequest,
    cancel: &CancelCheck<'_>,
) -> Result<CommandResponse> {
    let outcome = match acquire(services, request, cancel) {
        Ok(mut ctx) => {
            let result = ctx.run(services, state, cancel).await;
            (ctx.stage, result)
        }
        Err(err) => (STAGE_ACQUIRE, Err(err)),
    };

    match outcome {
        (_, Ok(response)) => Ok(response),
        (stage, Err(err)) => {
            log_rejection(stage, &err);
            Err(err)
        }
    }
}

fn acquire<'r>(
    services: &PipelineServices,
    request: &'r CommandRequest,
    cancel: &CancelCheck<'_>,
) -> Result<CommandContext<'r>> {
    cancel.check(STAGE_ACQUIRE)?;
    let partition = services.partitions.borrow(&request.app, request.partition)?;
    CommandContext::new(request, partition)
}

fn log_rejection(stage: &str, err: &ProcessorError) {
    if err.status_class() == StatusClass::InternalServerError {
        event!(Level::ERROR, stage, error = %err, "command failed");
    } else {
        event!(Level::DEBUG, stage, error = %err, "command rejected");
    }
}
