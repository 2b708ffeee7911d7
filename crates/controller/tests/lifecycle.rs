//! Scenario tests for the lifecycle controller, driven against the
//! in-memory mock provider and a loopback HTTP server standing in for the
//! staging URL.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::http::StatusCode;
use controller::constants::{ACTIVE_ALIAS, PREACTIVE_ALIAS};
use controller::{DeployOptions, deploy_with, publish, resolve_version, undeploy, versions};
use fnspec::Spec;
use provider::Provider;
use provider::mock::MockProvider;

const QUEUE_ARN: &str = "arn:aws:sqs:us-west-2:1:q";

fn load_spec(doc: &str) -> Spec {
    Spec::load(doc.as_bytes(), &BTreeMap::new()).unwrap()
}

fn registry_spec() -> Spec {
    load_spec(
        "name: app1\n\
         image: 123456789012.dkr.ecr.us-west-2.amazonaws.com/app1:latest\n\
         role: arn:aws:iam::123456789012:role/r\n",
    )
}

fn triggered_spec() -> Spec {
    load_spec(
        "name: app1\n\
         image: 123456789012.dkr.ecr.us-west-2.amazonaws.com/app1:latest\n\
         role: arn:aws:iam::123456789012:role/r\n\
         cron:\n\
           nightly: 0 2 * * ? *\n\
         sqs_triggers:\n\
           - arn: arn:aws:sqs:us-west-2:1:q\n",
    )
}

fn test_deploy_options() -> DeployOptions {
    DeployOptions {
        prime: 2,
        phase_timeout: Duration::from_secs(30),
        prime_timeout: Duration::from_secs(5),
        schedule_recreate_timeout: Duration::from_secs(5),
    }
}

/// Serves every request with a fixed status on a random loopback port.
async fn spawn_status_server(status: StatusCode) -> String {
    let app = axum::Router::new().fallback(move || async move { status });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn assert_ordered(journal: &[String], expected: &[&str]) {
    let mut idx = 0;
    for entry in journal {
        if idx < expected.len() && entry.starts_with(expected[idx]) {
            idx += 1;
        }
    }
    assert_eq!(
        idx,
        expected.len(),
        "journal is missing ordered entries {:?}\nfull journal: {journal:#?}",
        &expected[idx..],
    );
}

#[tokio::test]
async fn idempotent_publish_bumps_version() {
    let mock = MockProvider::new("123456789012", "us-west-2");

    let first = publish(&mock, None, registry_spec()).await.unwrap();
    assert_eq!(first.version, 1);

    let second = publish(&mock, None, registry_spec()).await.unwrap();
    assert_eq!(second.version, first.version + 1);
    assert_eq!(second.name, "app1");

    let tags = mock.function_tags("app1");
    assert_eq!(tags.len(), 1);
    assert_eq!(tags.get("Name").map(String::as_str), Some("app1"));
}

#[tokio::test]
async fn publish_rejects_disallowed_account() {
    let mock = MockProvider::new("999999999999", "us-west-2");
    let spec = load_spec(
        "name: app1\n\
         image: 123456789012.dkr.ecr.us-west-2.amazonaws.com/app1:latest\n\
         role: arn:aws:iam::123456789012:role/r\n\
         allowed_account_regions:\n\
           - '123456789012:*'\n",
    );
    let err = publish(&mock, None, spec).await.unwrap_err();
    assert!(matches!(err, controller::ControllerError::NotAllowedHere));
    assert!(mock.journal().is_empty());
}

#[tokio::test]
async fn staged_cutover_honors_ordering() {
    let server = spawn_status_server(StatusCode::OK).await;
    let mock = MockProvider::new("123456789012", "us-west-2").with_url_base(&server);

    // Two published versions with a queue trigger each; v1 is live.
    publish(&mock, None, triggered_spec()).await.unwrap();
    publish(&mock, None, triggered_spec()).await.unwrap();
    mock.create_alias("app1", ACTIVE_ALIAS, 1).await.unwrap();
    let v1_bindings = mock.list_queue_bindings("app1:1").await.unwrap();
    mock.set_queue_binding_enabled(&v1_bindings[0].uuid, true)
        .await
        .unwrap();
    mock.clear_journal();

    let url = deploy_with(&mock, "app1", 2, &test_deploy_options())
        .await
        .unwrap();
    assert!(url.contains(ACTIVE_ALIAS));

    // Both versions' bindings are enabled between the two set_binding
    // entries, which is the whole point of the ordering.
    let enable_new = format!("set_binding {QUEUE_ARN} v2 enabled=true (enabled_now=2)");
    let disable_old = format!("set_binding {QUEUE_ARN} v1 enabled=false (enabled_now=1)");
    let journal = mock.journal();
    assert_ordered(
        &journal,
        &[
            "create_alias lambdafy-preactive -> v2",
            "create_function_url lambdafy-preactive",
            "add_permission lambdafy-preactive",
            &enable_new,
            &disable_old,
            "delete_schedule_group lambdafy-app1",
            "create_schedule_group lambdafy-app1",
            "create_schedule lambdafy-app1-nightly",
            "update_alias lambdafy-active -> v2",
            "create_function_url lambdafy-active",
            "add_permission lambdafy-active",
        ],
    );

    assert_eq!(mock.alias_target("app1", ACTIVE_ALIAS), Some(2));
    assert_eq!(mock.alias_target("app1", PREACTIVE_ALIAS), Some(2));

    let schedules = mock.schedules("lambdafy-app1");
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].name, "lambdafy-app1-nightly");
    assert_eq!(schedules[0].expression, "0 2 * * ? *");
    assert_eq!(schedules[0].input, "{\"cron\":\"nightly\"}");
    assert!(schedules[0].target_arn.ends_with(":2"));
}

#[tokio::test]
async fn canary_failure_aborts_before_cutover() {
    let server = spawn_status_server(StatusCode::BAD_GATEWAY).await;
    let mock = MockProvider::new("123456789012", "us-west-2").with_url_base(&server);

    publish(&mock, None, triggered_spec()).await.unwrap();
    publish(&mock, None, triggered_spec()).await.unwrap();
    mock.create_alias("app1", ACTIVE_ALIAS, 1).await.unwrap();
    let v1_bindings = mock.list_queue_bindings("app1:1").await.unwrap();
    mock.set_queue_binding_enabled(&v1_bindings[0].uuid, true)
        .await
        .unwrap();
    mock.clear_journal();

    let mut opts = test_deploy_options();
    opts.prime = 5;
    opts.prime_timeout = Duration::from_secs(2);
    let err = deploy_with(&mock, "app1", 2, &opts).await.unwrap_err();
    assert!(
        matches!(err, controller::ControllerError::CanaryFailure(_, _)),
        "expected canary failure, got {err:?}"
    );

    // Live traffic and queue ownership are untouched.
    assert_eq!(mock.alias_target("app1", ACTIVE_ALIAS), Some(1));
    let mut states = mock.binding_states("app1");
    states.sort();
    assert_eq!(
        states,
        vec![
            (QUEUE_ARN.to_string(), Some(1), "Enabled".to_string()),
            (QUEUE_ARN.to_string(), Some(2), "Disabled".to_string()),
        ]
    );
    assert!(
        !mock.journal().iter().any(|e| e.starts_with("set_binding")),
        "no binding may change state on canary failure"
    );
}

#[tokio::test]
async fn generated_role_is_reused_across_publishes() {
    let mock = MockProvider::new("123456789012", "us-west-2");
    let doc = "name: app1\n\
               image: 123456789012.dkr.ecr.us-west-2.amazonaws.com/app1:latest\n\
               role: generate\n\
               role_extra_policy:\n\
                 - effect: Allow\n\
                   action: [s3:GetObject]\n\
                   resource: ['*']\n";

    publish(&mock, None, load_spec(doc)).await.unwrap();
    publish(&mock, None, load_spec(doc)).await.unwrap();

    let roles = mock.role_names();
    assert_eq!(roles.len(), 1, "identical policies must share one role");
    assert!(roles[0].starts_with("lambdafy-v1-"));

    let journal = mock.journal();
    let created = format!("create_role {}", roles[0]);
    assert_eq!(journal.iter().filter(|e| **e == created).count(), 1);
    assert_eq!(
        journal
            .iter()
            .filter(|e| e.starts_with("create_role") && e.ends_with("(exists)"))
            .count(),
        1
    );
    // The inline policy is re-put on every publish.
    assert_eq!(
        journal
            .iter()
            .filter(|e| e.starts_with("put_role_policy"))
            .count(),
        2
    );
}

#[tokio::test]
async fn undeploy_removes_active_alias_and_disables_triggers() {
    let server = spawn_status_server(StatusCode::OK).await;
    let mock = MockProvider::new("123456789012", "us-west-2").with_url_base(&server);

    publish(&mock, None, triggered_spec()).await.unwrap();
    deploy_with(&mock, "app1", 1, &test_deploy_options())
        .await
        .unwrap();
    assert_eq!(mock.alias_target("app1", ACTIVE_ALIAS), Some(1));

    undeploy(&mock, "app1").await.unwrap();

    assert_eq!(mock.alias_target("app1", ACTIVE_ALIAS), None);
    // The staging alias survives an undeploy.
    assert_eq!(mock.alias_target("app1", PREACTIVE_ALIAS), Some(1));
    for (_, _, state) in mock.binding_states("app1") {
        assert_eq!(state, "Disabled");
    }

    // Undeploying again is a no-op.
    undeploy(&mock, "app1").await.unwrap();
}

#[tokio::test]
async fn resolver_handles_numeric_latest_and_alias() {
    let mock = MockProvider::new("123456789012", "us-west-2");
    publish(&mock, None, registry_spec()).await.unwrap();
    publish(&mock, None, registry_spec()).await.unwrap();
    mock.create_alias("app1", "staging", 1).await.unwrap();

    assert_eq!(resolve_version(&mock, "app1", "7").await.unwrap(), 7);
    assert_eq!(resolve_version(&mock, "app1", "latest").await.unwrap(), 2);
    assert_eq!(resolve_version(&mock, "app1", "staging").await.unwrap(), 1);
    assert!(
        resolve_version(&mock, "app1", "missing")
            .await
            .unwrap_err()
            .is_not_found()
    );

    let vers = versions(&mock, "app1").await.unwrap();
    assert_eq!(
        vers.iter().map(|v| v.version).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(vers[0].aliases, vec!["staging".to_string()]);
    assert!(vers[1].aliases.is_empty());
}
