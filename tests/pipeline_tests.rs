mod common;

use common::*;
use partition_processor::StatusClass;
use partition_processor::auth::{AclRule, OperationKind, Principal, PrincipalPayload, TokenService};
use partition_processor::core::sys;
use partition_processor::ids::FIRST_SINGLETON_ID;
use partition_processor::notify::BroadcastNotifier;
use partition_processor::storage::{RecordStore, ViewStore};
use partition_processor::{CommandResponse, ProcessorPolicy};
use serde_json::json;
use std::sync::Arc;

fn status(response: &CommandResponse) -> Option<StatusClass> {
    response.status_class()
}

#[tokio::test]
async fn create_returns_offsets_and_new_ids() {
    let fx = Fixture::new().await;
    let response = fx
        .processor
        .execute(fx.cud(WS, &fx.user, json!([create_doc(1, "report"), create_doc(2, "notes")])))
        .await;

    assert!(response.is_success(), "{:?}", response);
    // wlog offset 1 belongs to the workspace descriptor
    assert_eq!(response.current_wlog_offset(), Some(2));
    let new_ids = response.new_ids().unwrap();
    assert_eq!(new_ids[&1], FIRST_CATALOG_ID);
    assert_eq!(new_ids[&2], FIRST_CATALOG_ID + 1);

    let record = fx.storage.get_record(WS, FIRST_CATALOG_ID).unwrap().unwrap();
    assert_eq!(record.as_str("Name"), Some("report"));
    assert!(record.is_active);
}

#[tokio::test]
async fn unauthorized_cud_leaves_log_and_ids_untouched() {
    let fx = Fixture::new().await;
    let before = fx.processor.partition_snapshot(&app(), PARTITION).await.unwrap();
    let plog = fx.plog_len();

    // no token: guest principals only
    let request = fx
        .request(WS, "sys.CUD")
        .with_body(json!({"cuds": [create_doc(1, "x")]}).to_string());
    let response = fx.processor.execute(request).await;

    assert_eq!(status(&response), Some(StatusClass::Forbidden));
    assert_eq!(fx.plog_len(), plog);
    let after = fx.processor.partition_snapshot(&app(), PARTITION).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn execute_denial_wins_over_later_cud_failures() {
    let acl = acl().rule(
        AclRule::deny([OperationKind::Execute], Principal::User("mallory".to_string()))
            .on(q("sys.CUD")),
    );
    let fx = Fixture::builder().acl(acl).build().await;
    let mallory = fx.authn.tokens().issue(PrincipalPayload::user("mallory")).unwrap();
    let before = fx.processor.partition_snapshot(&app(), PARTITION).await.unwrap();
    let plog = fx.plog_len();

    // an update of a record that does not exist
    let missing = json!([update(FIRST_CATALOG_ID + 99, json!({"Size": 1}))]);
    let allowed = fx.processor.execute(fx.cud(WS, &fx.user, missing.clone())).await;
    assert_eq!(status(&allowed), Some(StatusClass::NotFound));

    let denied = fx.processor.execute(fx.cud(WS, &mallory, missing)).await;
    assert_eq!(status(&denied), Some(StatusClass::Forbidden));
    assert_eq!(fx.plog_len(), plog);
    let after = fx.processor.partition_snapshot(&app(), PARTITION).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn workspace_sent_to_the_wrong_partition_is_rejected() {
    const OTHER: u64 = 9;
    let fx = Fixture::builder().partitions([PARTITION, 2]).build().await;
    fx.init_workspace_on(2, OTHER).await;
    let created = fx
        .processor
        .execute(fx.cud_on(2, OTHER, &fx.system, json!([create_doc(1, "there")])))
        .await;
    assert!(created.is_success(), "{:?}", created);

    let before = fx.processor.partition_snapshot(&app(), 2).await.unwrap();
    let plog = fx.plog_len_of(2);
    let recoveries = fx.processor.stats().unwrap().recoveries;

    // WS lives on PARTITION
    let misrouted = fx
        .processor
        .execute(fx.cud_on(2, WS, &fx.user, json!([create_doc(1, "lost")])))
        .await;
    assert_eq!(status(&misrouted), Some(StatusClass::BadRequest));
    assert_eq!(fx.plog_len_of(2), plog);
    let after = fx.processor.partition_snapshot(&app(), 2).await.unwrap();
    assert!(after.is_some());
    assert_eq!(before, after);

    let next = fx
        .processor
        .execute(fx.cud_on(2, OTHER, &fx.system, json!([create_doc(1, "again")])))
        .await;
    assert_eq!(next.current_wlog_offset(), Some(3));
    assert_eq!(fx.processor.stats().unwrap().recoveries, recoveries);
}

#[tokio::test]
async fn field_level_rules_decide_updates() {
    let acl = acl().rule(
        AclRule::deny([OperationKind::Update], Principal::AuthenticatedUser)
            .on(q("app.Doc"))
            .with_fields(["Name"]),
    );
    let fx = Fixture::builder().acl(acl).build().await;
    let created = fx
        .processor
        .execute(fx.cud(WS, &fx.user, json!([create_doc(1, "draft")])))
        .await;
    assert!(created.is_success());

    let rename = fx
        .processor
        .execute(fx.cud(WS, &fx.user, json!([update(FIRST_CATALOG_ID, json!({"Name": "final"}))])))
        .await;
    assert_eq!(status(&rename), Some(StatusClass::Forbidden));

    let resize = fx
        .processor
        .execute(fx.cud(WS, &fx.user, json!([update(FIRST_CATALOG_ID, json!({"Size": 42}))])))
        .await;
    assert!(resize.is_success(), "{:?}", resize);
    let record = fx.storage.get_record(WS, FIRST_CATALOG_ID).unwrap().unwrap();
    assert_eq!(record.as_str("Name"), Some("draft"));
    assert_eq!(record.as_i64("Size"), Some(42));
}

#[tokio::test]
async fn rate_limit_rejects_third_call_in_period() {
    let policy = ProcessorPolicy::default().with_rate_limit(q("app.Ping"), 2, 60_000);
    let fx = Fixture::builder().policy(policy).build().await;

    for _ in 0..2 {
        let response = fx
            .processor
            .execute(fx.request(WS, "app.Ping").with_token(fx.user.clone()))
            .await;
        assert!(response.is_success(), "{:?}", response);
    }
    let plog = fx.plog_len();
    let third = fx
        .processor
        .execute(fx.request(WS, "app.Ping").with_token(fx.user.clone()))
        .await;
    assert_eq!(status(&third), Some(StatusClass::TooManyRequests));
    assert_eq!(fx.plog_len(), plog);

    // quotas are per workspace
    fx.init_workspace(WS + 1).await;
    let other = fx
        .processor
        .execute(fx.request(WS + 1, "app.Ping").with_token(fx.user.clone()))
        .await;
    assert!(other.is_success());
}

#[tokio::test]
async fn update_of_missing_record_is_not_found() {
    let fx = Fixture::new().await;
    let plog = fx.plog_len();
    let response = fx
        .processor
        .execute(fx.cud(WS, &fx.user, json!([update(FIRST_CATALOG_ID + 999, json!({"Size": 1}))])))
        .await;

    assert_eq!(status(&response), Some(StatusClass::NotFound));
    assert_eq!(fx.plog_len(), plog);
}

#[tokio::test]
async fn explicit_id_collision_is_a_conflict() {
    let fx = Fixture::new().await;
    let created = fx
        .processor
        .execute(fx.cud(WS, &fx.user, json!([create_doc(1, "first")])))
        .await;
    assert_eq!(created.current_wlog_offset(), Some(2));
    let plog = fx.plog_len();

    let clash = json!([{"fields": {
        "sys.ID": FIRST_CATALOG_ID,
        "sys.QName": "app.Doc",
        "Name": "second",
    }}]);
    let response = fx.processor.execute(fx.cud(WS, &fx.system, clash)).await;
    assert_eq!(status(&response), Some(StatusClass::Conflict));
    assert_eq!(fx.plog_len(), plog);

    // offsets and counters were not advanced by the rejected event
    let next = fx
        .processor
        .execute(fx.cud(WS, &fx.user, json!([create_doc(1, "third")])))
        .await;
    assert_eq!(next.current_wlog_offset(), Some(3));
    assert_eq!(next.new_ids().unwrap()[&1], FIRST_CATALOG_ID + 1);
}

#[tokio::test]
async fn explicit_ids_are_reserved_for_the_system() {
    let fx = Fixture::new().await;
    let create = json!([{"fields": {
        "sys.ID": FIRST_CATALOG_ID + 10,
        "sys.QName": "app.Doc",
        "Name": "seeded",
    }}]);
    let response = fx.processor.execute(fx.cud(WS, &fx.user, create.clone())).await;
    assert_eq!(status(&response), Some(StatusClass::BadRequest));

    let response = fx.processor.execute(fx.cud(WS, &fx.system, create)).await;
    assert!(response.is_success(), "{:?}", response);

    // the generator moves past IDs observed in the log
    let next = fx
        .processor
        .execute(fx.cud(WS, &fx.user, json!([create_doc(1, "generated")])))
        .await;
    assert_eq!(next.new_ids().unwrap()[&1], FIRST_CATALOG_ID + 11);
}

#[tokio::test]
async fn references_must_resolve() {
    let fx = Fixture::new().await;
    let dangling = json!([{"fields": {
        "sys.ID": 1,
        "sys.QName": "app.Doc",
        "Name": "child",
        "Owner": FIRST_CATALOG_ID + 500,
    }}]);
    let response = fx.processor.execute(fx.cud(WS, &fx.user, dangling)).await;
    assert_eq!(status(&response), Some(StatusClass::BadRequest));

    // a raw ID points at a record created by the same request
    let linked = json!([
        create_doc(1, "parent"),
        {"fields": {"sys.ID": 2, "sys.QName": "app.Doc", "Name": "child", "Owner": 1}},
    ]);
    let response = fx.processor.execute(fx.cud(WS, &fx.user, linked)).await;
    assert!(response.is_success(), "{:?}", response);
    let ids = response.new_ids().unwrap();
    let child = fx.storage.get_record(WS, ids[&2]).unwrap().unwrap();
    assert_eq!(child.field("Owner"), Some(&json!(ids[&1])));
}

#[tokio::test]
async fn cud_policy_is_enforced() {
    let fx = Fixture::new().await;

    let request = fx
        .request(WS, "app.Ping")
        .with_token(fx.user.clone())
        .with_body(json!({"cuds": [create_doc(1, "sneaky")]}).to_string());
    let response = fx.processor.execute(request).await;
    assert_eq!(status(&response), Some(StatusClass::BadRequest));

    let created = fx
        .processor
        .execute(fx.cud(WS, &fx.user, json!([create_doc(1, "doc")])))
        .await;
    assert!(created.is_success());

    let mixed = update(FIRST_CATALOG_ID, json!({"sys.IsActive": false, "Size": 3}));
    let response = fx.processor.execute(fx.cud(WS, &fx.user, json!([mixed]))).await;
    assert_eq!(status(&response), Some(StatusClass::BadRequest));

    let deactivate = update(FIRST_CATALOG_ID, json!({"sys.IsActive": false}));
    let response = fx.processor.execute(fx.cud(WS, &fx.user, json!([deactivate]))).await;
    assert!(response.is_success(), "{:?}", response);
    let record = fx.storage.get_record(WS, FIRST_CATALOG_ID).unwrap().unwrap();
    assert!(!record.is_active);
}

#[tokio::test]
async fn too_many_cuds_are_malformed() {
    let mut policy = ProcessorPolicy::default();
    policy.cud.max_cuds = 2;
    let fx = Fixture::builder().policy(policy).build().await;
    let cuds = json!([create_doc(1, "a"), create_doc(2, "b"), create_doc(3, "c")]);
    let response = fx.processor.execute(fx.cud(WS, &fx.user, cuds)).await;
    assert_eq!(status(&response), Some(StatusClass::BadRequest));
}

#[tokio::test]
async fn uninitialized_workspace_accepts_bootstrap_and_system_only() {
    let fx = Fixture::new().await;
    let fresh = WS + 10;

    let response = fx
        .processor
        .execute(fx.cud(fresh, &fx.user, json!([create_doc(1, "early")])))
        .await;
    assert_eq!(status(&response), Some(StatusClass::Forbidden));
    assert!(response.to_json()["error"]["message"]
        .as_str()
        .unwrap()
        .contains("not initialized"));

    let bootstrap = fx
        .processor
        .execute(fx.request(fresh, "sys.Init").with_token(fx.user.clone()))
        .await;
    assert!(bootstrap.is_success(), "{:?}", bootstrap);

    let seeded = fx
        .processor
        .execute(fx.cud(fresh, &fx.system, json!([create_doc(1, "seed")])))
        .await;
    assert!(seeded.is_success(), "{:?}", seeded);
}

#[tokio::test]
async fn inactive_workspace_is_gone_for_users() {
    let fx = Fixture::new().await;
    let deactivate = update(FIRST_SINGLETON_ID, json!({"Status": sys::WORKSPACE_STATUS_INACTIVE}));
    let response = fx.processor.execute(fx.cud(WS, &fx.system, json!([deactivate]))).await;
    assert!(response.is_success(), "{:?}", response);

    let response = fx
        .processor
        .execute(fx.request(WS, "app.Ping").with_token(fx.user.clone()))
        .await;
    assert_eq!(status(&response), Some(StatusClass::Gone));

    let response = fx
        .processor
        .execute(fx.request(WS, "app.Ping").with_token(fx.system.clone()))
        .await;
    assert!(response.is_success());
}

#[tokio::test]
async fn unknown_token_fails_authentication() {
    let fx = Fixture::new().await;
    let response = fx
        .processor
        .execute(fx.request(WS, "app.Ping").with_token("forged"))
        .await;
    assert_eq!(status(&response), Some(StatusClass::Unauthorized));
}

#[tokio::test]
async fn malformed_requests_are_rejected_before_append() {
    let fx = Fixture::new().await;
    let plog = fx.plog_len();

    let unknown = fx.processor.execute(fx.request(WS, "app.Nope").with_token(fx.user.clone())).await;
    assert_eq!(status(&unknown), Some(StatusClass::BadRequest));

    let garbage = fx
        .request(WS, "app.Echo")
        .with_token(fx.user.clone())
        .with_body("{not json");
    assert_eq!(status(&fx.processor.execute(garbage).await), Some(StatusClass::BadRequest));

    let wrong_type = fx
        .request(WS, "app.Echo")
        .with_token(fx.user.clone())
        .with_body(json!({"args": {"Text": 7}}).to_string());
    assert_eq!(status(&fx.processor.execute(wrong_type).await), Some(StatusClass::BadRequest));

    let extra_member = fx
        .request(WS, "app.Echo")
        .with_token(fx.user.clone())
        .with_body(json!({"args": {"Text": "hi"}, "extra": 1}).to_string());
    assert_eq!(status(&fx.processor.execute(extra_member).await), Some(StatusClass::BadRequest));

    assert_eq!(fx.plog_len(), plog);
}

#[tokio::test]
async fn operation_arguments_get_storage_ids() {
    let fx = Fixture::new().await;
    fx.processor
        .execute(fx.cud(WS, &fx.user, json!([create_doc(1, "catalogue")])))
        .await;

    let body = json!({"args": {
        "sys.ID": 1,
        "Number": 77,
        "Lines": [
            {"sys.ID": 2, "Qty": 1, "Doc": FIRST_CATALOG_ID},
            {"sys.ID": 3, "Qty": 5},
        ],
    }});
    let request = fx
        .request(WS, "app.Place")
        .with_token(fx.user.clone())
        .with_body(body.to_string());
    let response = fx.processor.execute(request).await;
    assert!(response.is_success(), "{:?}", response);
    let ids = response.new_ids().unwrap();
    assert_eq!(ids.len(), 3);
    assert!(ids.values().all(|id| *id > 2 << 40));

    let too_many = json!({"args": {
        "Number": 78,
        "Lines": [{"Qty": 1}, {"Qty": 2}, {"Qty": 3}, {"Qty": 4}],
    }});
    let request = fx
        .request(WS, "app.Place")
        .with_token(fx.user.clone())
        .with_body(too_many.to_string());
    assert_eq!(status(&fx.processor.execute(request).await), Some(StatusClass::BadRequest));
}

#[tokio::test]
async fn extension_result_is_validated_and_returned() {
    let fx = Fixture::new().await;
    let request = fx
        .request(WS, "app.Echo")
        .with_token(fx.user.clone())
        .with_body(json!({"args": {"Text": "hello"}}).to_string());
    let response = fx.processor.execute(request).await;
    assert_eq!(
        response.to_json(),
        json!({"currentWLogOffset": 2, "result": {"Text": "hello", "WLog": 2}})
    );

    let bad = fx
        .processor
        .execute(fx.request(WS, "app.BadEcho").with_token(fx.user.clone()))
        .await;
    assert_eq!(status(&bad), Some(StatusClass::InternalServerError));
    assert!(bad.to_json()["error"]["message"].as_str().unwrap().contains("Invalid intents"));

    let twice = fx
        .processor
        .execute(fx.request(WS, "app.Twice").with_token(fx.user.clone()))
        .await;
    assert!(twice.to_json()["error"]["message"].as_str().unwrap().contains("Invalid intents"));
}

#[tokio::test]
async fn raw_argument_reaches_the_extension() {
    let fx = Fixture::new().await;
    let request = fx
        .request(WS, "app.Upload")
        .with_token(fx.user.clone())
        .with_body("plain text payload");
    let response = fx.processor.execute(request).await;
    assert!(response.is_success(), "{:?}", response);
    assert_eq!(response.to_json()["result"], json!({"Size": 18}));
}

#[tokio::test]
async fn extension_error_is_an_execution_fault() {
    let fx = Fixture::new().await;
    let response = fx
        .processor
        .execute(fx.request(WS, "app.Fail").with_token(fx.user.clone()))
        .await;
    assert_eq!(status(&response), Some(StatusClass::InternalServerError));
    assert!(response.to_json()["error"]["message"].as_str().unwrap().contains("boom"));
    assert_eq!(fx.processor.stats().unwrap().extension_faults, 1);
}

#[tokio::test]
async fn projections_follow_committed_events() {
    let fx = Fixture::new().await;
    for name in ["a", "b"] {
        let response = fx
            .processor
            .execute(fx.cud(WS, &fx.user, json!([create_doc(1, name)])))
            .await;
        assert!(response.is_success());
    }
    let count = fx.storage.get_view(WS, &q("app.DocCount"), "docs").unwrap();
    assert_eq!(count, Some(json!(2)));
}

#[tokio::test]
async fn plog_offsets_are_published() {
    let notifier = Arc::new(BroadcastNotifier::new(16));
    let mut rx = notifier.subscribe();
    let fx = Fixture::builder().notifier(notifier).build().await;

    let init = rx.recv().await.unwrap();
    assert_eq!(init.offset, 1);

    fx.processor
        .execute(fx.request(WS, "app.Ping").with_token(fx.user.clone()))
        .await;
    let ping = rx.recv().await.unwrap();
    assert_eq!(ping.key.app, app());
    assert_eq!(ping.key.projection, sys::plog_projection());
    assert_eq!(ping.key.workspace, u64::from(PARTITION));
    assert_eq!(ping.offset, 2);
}
