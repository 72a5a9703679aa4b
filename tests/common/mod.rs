#![allow(dead_code)]

use partition_processor::auth::{
    AclAuthorizer, AclRule, Authenticator, MapTokenService, OperationKind, Principal,
    PrincipalPayload, TokenAuthenticator, TokenService,
};
use partition_processor::core::{PartitionId, QName, RecordId, WorkspaceId, sys};
use partition_processor::event::CudOp;
use partition_processor::extension::{ExecContext, ProjectorContext, ViewIntents};
use partition_processor::notify::Notifier;
use partition_processor::schema::FieldKind;
use partition_processor::{
    AppDeployment, AppPartitions, AppQName, AppSchema, CommandDef, CommandProcessor,
    CommandRequest, MemoryStorage, ProcessorError, ProcessorPolicy, ProjectorDef, RecordDef,
    RecordKind, Result, Storage,
};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;

pub const PARTITION: PartitionId = 1;
/// Workspace initialized by [`Fixture::new`].
pub const WS: WorkspaceId = 2;
pub const FIRST_CATALOG_ID: RecordId = (1 << 40) + 1;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn q(name: &str) -> QName {
    name.parse().unwrap()
}

pub fn app() -> AppQName {
    "test/app".parse().unwrap()
}

fn count_docs(ctx: &ProjectorContext<'_>, intents: &mut ViewIntents) -> Result<()> {
    let created = ctx
        .event()
        .cuds
        .iter()
        .filter(|cud| cud.qname == q("app.Doc") && cud.op == CudOp::Create)
        .count() as i64;
    if created == 0 {
        return Ok(());
    }
    let current = ctx
        .view(&q("app.DocCount"), "docs")?
        .and_then(|value| value.as_i64())
        .unwrap_or(0);
    intents.put(q("app.DocCount"), "docs", json!(current + created));
    Ok(())
}

pub fn schema() -> AppSchema {
    AppSchema::builder()
        .record(
            RecordDef::new(q("app.Doc"), RecordKind::CDoc)
                .require_field("Name", FieldKind::Text)
                .optional_field("Size", FieldKind::Int)
                .optional_field("Owner", FieldKind::RecordRef),
        )
        .record(
            RecordDef::new(q("app.Order"), RecordKind::ODoc)
                .require_field("Number", FieldKind::Int)
                .with_container("Lines", q("app.OrderLine"), 1, Some(3)),
        )
        .record(
            RecordDef::new(q("app.OrderLine"), RecordKind::ORecord)
                .require_field("Qty", FieldKind::Int)
                .optional_field("Doc", FieldKind::RecordRef),
        )
        .record(RecordDef::new(q("app.EchoArgs"), RecordKind::Object).require_field("Text", FieldKind::Text))
        .record(
            RecordDef::new(q("app.EchoResult"), RecordKind::Object)
                .require_field("Text", FieldKind::Text)
                .require_field("WLog", FieldKind::Int),
        )
        .record(RecordDef::new(q("app.UploadResult"), RecordKind::Object).require_field("Size", FieldKind::Int))
        .command(CommandDef::new(q("app.Ping")))
        .command(CommandDef::new(q("app.Place")).with_param(q("app.Order")))
        .command(
            CommandDef::new(q("app.Echo"))
                .with_param(q("app.EchoArgs"))
                .with_result(q("app.EchoResult"))
                .with_extension(|ctx: &mut ExecContext<'_>| {
                    let text = ctx.arg("Text").cloned().unwrap_or(JsonValue::Null);
                    let wlog = ctx.wlog_offset();
                    let response = ctx.new_response();
                    response.insert("Text".to_string(), text);
                    response.insert("WLog".to_string(), json!(wlog));
                    Ok(())
                }),
        )
        .command(
            CommandDef::new(q("app.BadEcho"))
                .with_result(q("app.EchoResult"))
                .with_extension(|ctx: &mut ExecContext<'_>| {
                    ctx.new_response().insert("Text".to_string(), json!(5));
                    Ok(())
                }),
        )
        .command(CommandDef::new(q("app.Twice")).with_result(q("app.EchoResult")).with_extension(
            |ctx: &mut ExecContext<'_>| {
                ctx.new_response();
                ctx.new_response();
                Ok(())
            },
        ))
        .command(
            CommandDef::new(q("app.Upload"))
                .with_raw_param()
                .with_result(q("app.UploadResult"))
                .with_extension(|ctx: &mut ExecContext<'_>| {
                    let size = ctx.raw_arg().map(str::len).unwrap_or(0);
                    ctx.new_response().insert("Size".to_string(), json!(size));
                    Ok(())
                }),
        )
        .command(CommandDef::new(q("app.Fail")).with_extension(|_: &mut ExecContext<'_>| {
            Err(ProcessorError::Internal("boom".to_string()))
        }))
        .command(CommandDef::new(q("app.Panic")).with_extension(|_: &mut ExecContext<'_>| {
            panic!("extension exploded")
        }))
        .command(CommandDef::new(q("app.Fragile")))
        .projector(ProjectorDef::new(q("app.DocCounter"), count_docs).on_cud(q("app.Doc")))
        .projector(
            ProjectorDef::new(
                q("app.Breaker"),
                |_: &ProjectorContext<'_>, intents: &mut ViewIntents| {
                    intents.put(q("app.DocCount"), "fragile", json!(true));
                    Err(ProcessorError::Internal("projector broke".to_string()))
                },
            )
            .on_command(q("app.Fragile")),
        )
        .view(q("app.DocCount"))
        .build()
        .unwrap()
}

/// Users may run every command and write every record unless a test
/// narrows it down.
pub fn acl() -> AclAuthorizer {
    AclAuthorizer::default().rule(AclRule::allow(
        [
            OperationKind::Execute,
            OperationKind::Insert,
            OperationKind::Update,
            OperationKind::Activate,
            OperationKind::Deactivate,
        ],
        Principal::AuthenticatedUser,
    ))
}

pub struct Fixture {
    pub storage: Arc<MemoryStorage>,
    pub partitions: Arc<AppPartitions>,
    pub authn: Arc<TokenAuthenticator<MapTokenService>>,
    pub processor: CommandProcessor,
    pub system: String,
    pub user: String,
}

pub struct FixtureBuilder {
    storage: Arc<MemoryStorage>,
    policy: ProcessorPolicy,
    acl: AclAuthorizer,
    notifier: Option<Arc<dyn Notifier>>,
    initialize: bool,
    deployed: Vec<PartitionId>,
}

impl FixtureBuilder {
    pub fn policy(mut self, policy: ProcessorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn acl(mut self, acl: AclAuthorizer) -> Self {
        self.acl = acl;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Deploys these partitions instead of [`PARTITION`] alone.
    pub fn partitions(mut self, partitions: impl IntoIterator<Item = PartitionId>) -> Self {
        self.deployed = partitions.into_iter().collect();
        self
    }

    pub fn uninitialized(mut self) -> Self {
        self.initialize = false;
        self
    }

    pub async fn build(self) -> Fixture {
        init_tracing();
        let partitions = Arc::new(AppPartitions::new());
        partitions
            .deploy(
                AppDeployment::new(app(), schema(), self.storage.clone() as Arc<dyn Storage>)
                    .with_partitions(self.deployed),
            )
            .unwrap();

        let authn = Arc::new(TokenAuthenticator::new(MapTokenService::new()));
        let system = authn.tokens().issue(PrincipalPayload::system()).unwrap();
        let user = authn
            .tokens()
            .issue(PrincipalPayload::user("alice").with_profile(WS))
            .unwrap();

        let authenticator: Arc<dyn Authenticator> = authn.clone();
        let mut builder = CommandProcessor::builder(Arc::clone(&partitions))
            .authenticator(authenticator)
            .authorizer(Arc::new(self.acl))
            .policy(self.policy);
        if let Some(notifier) = self.notifier {
            builder = builder.notifier(notifier);
        }
        let processor = builder.build().unwrap();

        let fixture = Fixture {
            storage: self.storage,
            partitions,
            authn,
            processor,
            system,
            user,
        };
        if self.initialize {
            fixture.init_workspace(WS).await;
        }
        fixture
    }
}

impl Fixture {
    pub fn builder() -> FixtureBuilder {
        FixtureBuilder {
            storage: Arc::new(MemoryStorage::new()),
            policy: ProcessorPolicy::default(),
            acl: acl(),
            notifier: None,
            initialize: true,
            deployed: vec![PARTITION],
        }
    }

    pub async fn new() -> Self {
        Self::builder().build().await
    }

    pub fn request(&self, workspace: WorkspaceId, command: &str) -> CommandRequest {
        CommandRequest::new(app(), workspace, PARTITION, q(command))
    }

    /// `sys.CUD` in `workspace` on behalf of `token`.
    pub fn cud(&self, workspace: WorkspaceId, token: &str, cuds: JsonValue) -> CommandRequest {
        self.cud_on(PARTITION, workspace, token, cuds)
    }

    pub fn cud_on(
        &self,
        partition: PartitionId,
        workspace: WorkspaceId,
        token: &str,
        cuds: JsonValue,
    ) -> CommandRequest {
        CommandRequest::new(app(), workspace, partition, q("sys.CUD"))
            .with_token(token)
            .with_body(json!({ "cuds": cuds }).to_string())
    }

    pub async fn init_workspace(&self, workspace: WorkspaceId) {
        self.init_workspace_on(PARTITION, workspace).await;
    }

    pub async fn init_workspace_on(&self, partition: PartitionId, workspace: WorkspaceId) {
        let request = CommandRequest::new(app(), workspace, partition, q("sys.Init"))
            .with_token(self.system.clone())
            .with_body(
                json!({"cuds": [{"fields": {
                    "sys.ID": 1,
                    "sys.QName": "sys.WorkspaceDescriptor",
                    "InitCompletedAtMs": 1_700_000_000_000i64,
                    "Status": sys::WORKSPACE_STATUS_ACTIVE,
                }}]})
                .to_string(),
            );
        let response = self.processor.execute(request).await;
        assert!(response.is_success(), "workspace init failed: {:?}", response);
    }

    pub fn plog_len(&self) -> usize {
        self.plog_len_of(PARTITION)
    }

    pub fn plog_len_of(&self, partition: PartitionId) -> usize {
        self.storage.plog_len(partition).unwrap()
    }
}

pub fn create_doc(raw_id: RecordId, name: &str) -> JsonValue {
    json!({"fields": {"sys.ID": raw_id, "sys.QName": "app.Doc", "Name": name}})
}

pub fn update(id: RecordId, fields: JsonValue) -> JsonValue {
    json!({"sys.ID": id, "fields": fields})
}
