#![allow(clippy::unwrap_used)]
// End-to-end reconciliation scenarios against a wiremock controller.

use std::time::Duration;

use serde_json::{Map, Value, json};
use url::Url;
use wiremock::matchers::{
    body_partial_json, body_string_contains, method, path, query_param, query_param_is_missing,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ontap_api::{ClusterEndpoint, Credentials, RestClient, ZapiClient};
use ontap_core::{
    CdAction, ConnectionArgs, ErrorKind, JobTracker, Protocol, ResourceKind, Session, UseRest,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn session(server: &MockServer, use_rest: UseRest) -> Session {
    session_with(server, use_rest, reqwest::Client::new())
}

fn session_with(server: &MockServer, use_rest: UseRest, http: reqwest::Client) -> Session {
    let credentials = Credentials::new("admin", "netapp1!".to_string().into());
    let rest = RestClient::with_client(
        http.clone(),
        Url::parse(&format!("{}/api/", server.uri())).unwrap(),
        credentials.clone(),
    );
    let zapi = ZapiClient::with_client(
        http,
        Url::parse(&format!("{}{}", server.uri(), ClusterEndpoint::ZAPI_PATH)).unwrap(),
        credentials,
    );
    let mut args = ConnectionArgs::new("cluster1", "admin", "netapp1!".to_string().into());
    args.use_rest = use_rest;
    Session::with_clients(rest, zapi, args)
        .with_job_tracker(JobTracker::new(Duration::from_millis(10)))
}

fn params(value: Value) -> Map<String, Value> {
    value.as_object().unwrap().clone()
}

fn xml(results: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_string(format!(
        "<?xml version='1.0' encoding='UTF-8'?>\
         <netapp version='1.180' xmlns='http://www.netapp.com/filer/admin'>{results}</netapp>"
    ))
}

fn records(items: Value) -> ResponseTemplate {
    let count = items.as_array().map_or(0, Vec::len);
    ResponseTemplate::new(200).set_body_json(json!({ "records": items, "num_records": count }))
}

fn accepted(job: &str) -> ResponseTemplate {
    ResponseTemplate::new(202).set_body_json(json!({
        "job": { "uuid": job, "_links": { "self": { "href": format!("/api/cluster/jobs/{job}") } } }
    }))
}

async fn mount_rest_cluster(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/cluster"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "version": {
                "full": "NetApp Release 9.12.1", "generation": 9, "major": 12, "minor": 1
            },
            "san_optimized": false
        })))
        .mount(server)
        .await;
}

async fn mount_job(server: &MockServer, job: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/api/cluster/jobs/{job}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uuid": job, "state": "success", "message": "success"
        })))
        .mount(server)
        .await;
}

async fn mount_zapi_version(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(ClusterEndpoint::ZAPI_PATH))
        .and(body_string_contains("<system-get-version/>"))
        .respond_with(xml(
            r#"<results status="passed">
                 <version>NetApp Release 9.8P4: Sun Apr 11 2021</version>
                 <version-tuple><system-version-tuple>
                   <generation>9</generation><major>8</major><minor>0</minor>
                 </system-version-tuple></version-tuple>
               </results>"#,
        ))
        .mount(server)
        .await;
}

// ── Aggregate over ZAPI ─────────────────────────────────────────────

const AGGR_ONLINE: &str = r#"<results status="passed">
    <num-records>1</num-records>
    <attributes-list><aggr-attributes>
      <aggregate-name>aggr1</aggregate-name>
      <aggr-raid-attributes><state>online</state><disk-count>3</disk-count></aggr-raid-attributes>
      <nodes><node-name>node1</node-name></nodes>
    </aggr-attributes></attributes-list>
  </results>"#;

#[tokio::test]
async fn aggregate_is_created_then_left_alone() {
    let server = MockServer::start().await;
    mount_zapi_version(&server).await;

    // First lookup misses; the online wait and the second run see it.
    Mock::given(method("POST"))
        .and(body_string_contains("<aggr-get-iter>"))
        .respond_with(xml(r#"<results status="passed"><num-records>0</num-records></results>"#))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("<aggr-get-iter>"))
        .respond_with(xml(AGGR_ONLINE))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("<storage-disk-get-iter>"))
        .respond_with(xml(
            r#"<results status="passed"><num-records>3</num-records><attributes-list>
                 <storage-disk-info><disk-name>1.0.1</disk-name></storage-disk-info>
                 <storage-disk-info><disk-name>1.0.2</disk-name></storage-disk-info>
                 <storage-disk-info><disk-name>1.0.3</disk-name></storage-disk-info>
               </attributes-list></results>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("<aggr-create>"))
        .and(body_string_contains("<aggregate>aggr1</aggregate>"))
        .respond_with(xml(r#"<results status="passed"/>"#))
        .expect(1)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Never);
    let request = json!({
        "name": "aggr1", "disk_count": 3, "nodes": ["node1"], "wait_for_online": true
    });

    let first = ResourceKind::Aggregate
        .apply(&session, params(request.clone()), false)
        .await
        .unwrap();
    assert!(first.changed);
    assert_eq!(first.cd_action, CdAction::Create);
    assert_eq!(first.protocol, Protocol::Zapi);

    let second = ResourceKind::Aggregate
        .apply(&session, params(request), false)
        .await
        .unwrap();
    assert!(!second.changed);
    assert_eq!(second.cd_action, CdAction::None);
}

/// Name of the API element carried by a ZAPI request body.
fn zapi_api(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let inner = text
        .split_once("<netapp")
        .and_then(|(_, rest)| rest.split_once('>'))
        .map_or("", |(_, rest)| rest);
    inner
        .trim_start()
        .trim_start_matches('<')
        .split(|c: char| c == '>' || c == '/' || c.is_whitespace())
        .next()
        .unwrap_or_default()
        .to_owned()
}

async fn zapi_calls(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| zapi_api(&r.body))
        .filter(|api| api != "system-get-version")
        .collect()
}

#[tokio::test]
async fn nodeless_aggregate_is_created_then_left_alone() {
    let server = MockServer::start().await;
    mount_zapi_version(&server).await;

    Mock::given(method("POST"))
        .and(body_string_contains("<aggr-get-iter>"))
        .respond_with(xml(r#"<results status="passed"><num-records>0</num-records></results>"#))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("<aggr-get-iter>"))
        .respond_with(xml(
            r#"<results status="passed">
                 <num-records>1</num-records>
                 <attributes-list><aggr-attributes>
                   <aggregate-name>ansibleAggr</aggregate-name>
                   <aggr-raid-attributes>
                     <state>online</state><disk-count>1</disk-count>
                   </aggr-raid-attributes>
                   <aggr-snaplock-attributes>
                     <snaplock-type>non_snaplock</snaplock-type>
                   </aggr-snaplock-attributes>
                 </aggr-attributes></attributes-list>
               </results>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("<aggr-create>"))
        .and(body_string_contains("<aggregate>ansibleAggr</aggregate>"))
        .and(body_string_contains("<disk-count>1</disk-count>"))
        .and(body_string_contains("<snaplock-type>non_snaplock</snaplock-type>"))
        .respond_with(xml(r#"<results status="passed"/>"#))
        .expect(1)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Never);
    let request = json!({
        "name": "ansibleAggr", "state": "present", "disk_count": 1,
        "service_state": "online", "wait_for_online": true,
        "snaplock_type": "non_snaplock"
    });

    let first = ResourceKind::Aggregate
        .apply(&session, params(request.clone()), false)
        .await
        .unwrap();
    assert!(first.changed);
    assert_eq!(
        zapi_calls(&server).await,
        ["aggr-get-iter", "aggr-create", "aggr-get-iter"]
    );

    let second = ResourceKind::Aggregate
        .apply(&session, params(request), false)
        .await
        .unwrap();
    assert!(!second.changed);
    assert_eq!(
        zapi_calls(&server).await,
        ["aggr-get-iter", "aggr-create", "aggr-get-iter", "aggr-get-iter"]
    );
}

// ── SnapMirror policy rules over REST ───────────────────────────────

#[tokio::test]
async fn snapmirror_rules_are_patched_in_one_call() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;
    mount_job(&server, "j-1").await;

    Mock::given(method("GET"))
        .and(path("/api/snapmirror/policies"))
        .and(query_param("name", "sm_policy"))
        .and(query_param("svm.name", "svm1"))
        .respond_with(records(json!([{
            "uuid": "p-1",
            "name": "sm_policy",
            "type": "async",
            "retention": [
                { "label": "daily", "count": 7 },
                { "label": "weekly", "count": 2 },
                { "label": "sm_created", "count": 1 }
            ]
        }])))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/snapmirror/policies/p-1"))
        .and(body_partial_json(json!({
            "retention": [
                { "label": "daily", "count": 7 },
                { "label": "weekly", "count": 4 }
            ]
        })))
        .respond_with(accepted("j-1"))
        .expect(1)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let outcome = ResourceKind::SnapmirrorPolicy
        .apply(
            &session,
            params(json!({
                "name": "sm_policy", "vserver": "svm1",
                "snapmirror_label": ["daily", "weekly"], "keep": [7, 4]
            })),
            false,
        )
        .await
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.protocol, Protocol::Rest);
}

#[tokio::test]
async fn system_rule_does_not_cause_a_change() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/snapmirror/policies"))
        .respond_with(records(json!([{
            "uuid": "p-1",
            "name": "sm_policy",
            "retention": [
                { "label": "daily", "count": "7" },
                { "label": "sm_created", "count": 1 }
            ]
        }])))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let outcome = ResourceKind::SnapmirrorPolicy
        .apply(
            &session,
            params(json!({
                "name": "sm_policy", "vserver": "svm1",
                "snapmirror_label": ["daily"], "keep": [7]
            })),
            false,
        )
        .await
        .unwrap();
    assert!(!outcome.changed);
}

#[tokio::test]
async fn changed_keep_rewrites_every_rule_once() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;
    mount_job(&server, "j-2").await;

    Mock::given(method("GET"))
        .and(path("/api/snapmirror/policies"))
        .and(query_param("name", "sm_policy"))
        .respond_with(records(json!([{
            "uuid": "p-1",
            "name": "sm_policy",
            "type": "async",
            "retention": [
                {
                    "label": "daily", "count": 7, "prefix": "daily",
                    "creation_schedule": { "name": "daily" }
                },
                {
                    "label": "weekly", "count": 5, "prefix": "weekly",
                    "creation_schedule": { "name": "weekly" }
                },
                {
                    "label": "monthly", "count": 12, "prefix": "monthly",
                    "creation_schedule": { "name": "monthly" }
                }
            ]
        }])))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/snapmirror/policies/p-1"))
        .and(body_partial_json(json!({
            "retention": [
                {
                    "label": "daily", "count": 7, "prefix": "daily",
                    "creation_schedule": { "name": "daily" }
                },
                {
                    "label": "weekly", "count": 5, "prefix": "weekly",
                    "creation_schedule": { "name": "weekly" }
                },
                {
                    "label": "monthly", "count": 6, "prefix": "monthly",
                    "creation_schedule": { "name": "monthly" }
                }
            ]
        })))
        .respond_with(accepted("j-2"))
        .expect(1)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let request = |monthly: u64| {
        params(json!({
            "name": "sm_policy", "vserver": "svm1",
            "snapmirror_label": ["daily", "weekly", "monthly"],
            "keep": [7, 5, monthly],
            "prefix": ["daily", "weekly", "monthly"],
            "schedule": ["daily", "weekly", "monthly"]
        }))
    };

    let same = ResourceKind::SnapmirrorPolicy
        .apply(&session, request(12), false)
        .await
        .unwrap();
    assert!(!same.changed);

    let changed = ResourceKind::SnapmirrorPolicy
        .apply(&session, request(6), false)
        .await
        .unwrap();
    assert!(changed.changed);
    assert_eq!(mutations(&server).await.len(), 1);
}

#[tokio::test]
async fn failed_job_fails_the_invocation() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/snapmirror/policies"))
        .respond_with(records(json!([{
            "uuid": "p-1", "name": "sm_policy", "comment": "old", "retention": []
        }])))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/snapmirror/policies/p-1"))
        .respond_with(accepted("j-3"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/cluster/jobs/j-3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uuid": "j-3", "state": "failure", "message": "policy is in use"
        })))
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let err = ResourceKind::SnapmirrorPolicy
        .apply(
            &session,
            params(json!({"name": "sm_policy", "vserver": "svm1", "comment": "new"})),
            false,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::JobFailed);
    assert!(err.to_string().contains("policy is in use"));
}

// ── EMS destination type change ─────────────────────────────────────

#[tokio::test]
async fn ems_type_change_recreates_the_destination() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;

    Mock::given(method("GET"))
        .and(path("/api/support/ems/destinations"))
        .and(query_param("name", "dest1"))
        .respond_with(records(json!([{
            "name": "dest1",
            "type": "syslog",
            "destination": "10.0.0.1",
            "filters": [{ "name": "important-events" }]
        }])))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/support/ems/destinations/dest1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/support/ems/destinations"))
        .and(body_partial_json(json!({
            "name": "dest1",
            "type": "rest_api",
            "destination": "https://hooks.example.com/ems"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let outcome = ResourceKind::EmsDestination
        .apply(
            &session,
            params(json!({
                "name": "dest1", "type": "rest-api",
                "destination": "https://hooks.example.com/ems",
                "filters": ["important-events"]
            })),
            false,
        )
        .await
        .unwrap();
    assert!(outcome.changed);

    let order: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() != "GET")
        .map(|r| r.method.to_string())
        .collect();
    assert_eq!(order, ["DELETE", "POST"]);
}

// ── LUN resize ──────────────────────────────────────────────────────

fn lun_record(size: u64) -> Value {
    json!([{
        "uuid": "l-1",
        "name": "/vol/vol1/lun1",
        "location": { "logical_unit": "lun1", "volume": { "name": "vol1" } },
        "space": { "size": size },
        "enabled": true
    }])
}

#[tokio::test]
async fn lun_at_requested_size_is_untouched() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/storage/luns"))
        .and(query_param("name", "/vol/vol1/lun1"))
        .respond_with(records(lun_record(2_147_483_648)))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let outcome = ResourceKind::Lun
        .apply(
            &session,
            params(json!({
                "name": "lun1", "vserver": "svm1", "flexvol_name": "vol1", "size": "2g"
            })),
            false,
        )
        .await
        .unwrap();
    assert!(!outcome.changed);
}

#[tokio::test]
async fn same_size_refusal_is_not_a_failure() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/storage/luns"))
        .respond_with(records(lun_record(2_147_467_264)))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/storage/luns/l-1"))
        .and(body_partial_json(json!({ "space": { "size": 2_147_483_648_u64 } })))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "message": "New LUN size is the same as the current size.",
                "code": "5374922"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let outcome = ResourceKind::Lun
        .apply(
            &session,
            params(json!({
                "name": "lun1", "vserver": "svm1", "flexvol_name": "vol1", "size": "2g"
            })),
            false,
        )
        .await
        .unwrap();
    assert!(!outcome.changed);
    assert_eq!(outcome.previous_errors.len(), 1);
}

#[tokio::test]
async fn conflict_on_another_object_fails_the_create() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/support/ems/destinations"))
        .and(query_param("name", "dest1"))
        .respond_with(records(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/support/ems/destinations"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "message": "Filter \"important-events\" already exists in another destination",
                "code": "983152"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let err = ResourceKind::EmsDestination
        .apply(
            &session,
            params(json!({
                "name": "dest1", "type": "syslog", "destination": "10.0.0.1",
                "filters": ["important-events"]
            })),
            false,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CreateError);
    assert!(err.to_string().contains("in another destination"));
}

#[tokio::test]
async fn conflict_naming_the_object_is_tolerated() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/support/ems/destinations"))
        .respond_with(records(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/support/ems/destinations"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error": { "message": "Destination \"dest1\" already exists.", "code": "983088" }
        })))
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let outcome = ResourceKind::EmsDestination
        .apply(
            &session,
            params(json!({"name": "dest1", "type": "syslog", "destination": "10.0.0.1"})),
            false,
        )
        .await
        .unwrap();
    assert!(!outcome.changed);
    assert_eq!(outcome.previous_errors.len(), 1);
}

// ── Volume delete ───────────────────────────────────────────────────

async fn mount_live_volume(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/storage/volumes"))
        .and(query_param("name", "vol1"))
        .and(query_param("svm.name", "svm1"))
        .respond_with(records(json!([{
            "uuid": "v-1",
            "name": "vol1",
            "state": "online",
            "nas": { "path": "/vol1" }
        }])))
        .mount(server)
        .await;
}

async fn mutations(server: &MockServer) -> Vec<(String, Value)> {
    server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() != "GET")
        .map(|r| {
            let body = serde_json::from_slice(&r.body).unwrap_or(Value::Null);
            (r.method.to_string(), body)
        })
        .collect()
}

#[tokio::test]
async fn forced_delete_unmounts_and_offlines_first() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;
    mount_live_volume(&server).await;
    Mock::given(method("PATCH"))
        .and(path("/api/storage/volumes/v-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/storage/volumes/v-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let outcome = ResourceKind::Volume
        .apply(
            &session,
            params(json!({
                "name": "vol1", "vserver": "svm1", "state": "absent",
                "force_unmount": true, "force_offline": true
            })),
            false,
        )
        .await
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.cd_action, CdAction::Delete);
    assert_eq!(
        mutations(&server).await,
        vec![
            ("PATCH".to_owned(), json!({ "nas": { "path": "" } })),
            ("PATCH".to_owned(), json!({ "state": "offline" })),
            ("DELETE".to_owned(), Value::Null),
        ]
    );
}

#[tokio::test]
async fn unforced_delete_sends_only_the_delete() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;
    mount_live_volume(&server).await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/storage/volumes/v-1"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "message":
                "Volume \"vol1\" in SVM \"svm1\" must be unmounted and offline to be deleted.",
                "code": "917536"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let err = ResourceKind::Volume
        .apply(
            &session,
            params(json!({"name": "vol1", "vserver": "svm1", "state": "absent"})),
            false,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeleteError);
    assert_eq!(mutations(&server).await.len(), 1);
}

// ── Broadcast domain split ──────────────────────────────────────────

#[tokio::test]
async fn subset_of_existing_domain_is_split_off() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;

    Mock::given(method("GET"))
        .and(path("/api/network/ethernet/broadcast-domains"))
        .and(query_param("name", "bd_new"))
        .respond_with(records(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/network/ethernet/broadcast-domains"))
        .and(query_param_is_missing("name"))
        .respond_with(records(json!([{
            "uuid": "bd-1",
            "name": "bd_old",
            "ipspace": { "name": "Default" },
            "mtu": 1500,
            "ports": [
                { "uuid": "port-a", "name": "e0a", "node": { "name": "node1" } },
                { "uuid": "port-b", "name": "e0b", "node": { "name": "node1" } },
                { "uuid": "port-c", "name": "e0c", "node": { "name": "node1" } }
            ]
        }])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/network/ethernet/broadcast-domains"))
        .and(body_partial_json(json!({ "name": "bd_new", "ipspace": { "name": "Default" } })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    for port in ["port-a", "port-b"] {
        Mock::given(method("PATCH"))
            .and(path(format!("/api/network/ethernet/ports/{port}")))
            .and(body_partial_json(json!({ "broadcast_domain": { "name": "bd_new" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("PATCH"))
        .and(path("/api/network/ethernet/ports/port-c"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let outcome = ResourceKind::BroadcastDomain
        .apply(
            &session,
            params(json!({"name": "bd_new", "ports": ["node1:e0a", "node1:e0b"]})),
            false,
        )
        .await
        .unwrap();
    assert!(outcome.changed);
}

#[tokio::test]
async fn split_domain_is_unchanged_on_the_second_run() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;

    Mock::given(method("GET"))
        .and(path("/api/network/ethernet/broadcast-domains"))
        .and(query_param("name", "domain2"))
        .respond_with(records(json!([])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/network/ethernet/broadcast-domains"))
        .and(query_param("name", "domain2"))
        .respond_with(records(json!([{
            "uuid": "bd-2",
            "name": "domain2",
            "ipspace": { "name": "ip1" },
            "mtu": 1500,
            "ports": [{ "uuid": "port-a", "name": "e0a", "node": { "name": "node1" } }]
        }])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/network/ethernet/broadcast-domains"))
        .and(query_param_is_missing("name"))
        .and(query_param("ipspace.name", "ip1"))
        .respond_with(records(json!([{
            "uuid": "bd-1",
            "name": "domain1",
            "ipspace": { "name": "ip1" },
            "mtu": 1500,
            "ports": [
                { "uuid": "port-a", "name": "e0a", "node": { "name": "node1" } },
                { "uuid": "port-b", "name": "e0b", "node": { "name": "node1" } },
                { "uuid": "port-d", "name": "e0d", "node": { "name": "node1" } }
            ]
        }])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/network/ethernet/broadcast-domains"))
        .and(body_partial_json(json!({ "name": "domain2", "ipspace": { "name": "ip1" } })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/network/ethernet/ports/port-a"))
        .and(body_partial_json(json!({ "broadcast_domain": { "name": "domain2" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let request = json!({"name": "domain2", "ipspace": "ip1", "ports": ["node1:e0a"]});

    let first = ResourceKind::BroadcastDomain
        .apply(&session, params(request.clone()), false)
        .await
        .unwrap();
    assert!(first.changed);
    assert_eq!(first.cd_action, CdAction::Create);

    let second = ResourceKind::BroadcastDomain
        .apply(&session, params(request), false)
        .await
        .unwrap();
    assert!(!second.changed);
    assert_eq!(second.cd_action, CdAction::None);
}

#[tokio::test]
async fn adopted_domain_is_renamed_then_given_the_new_mtu() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;

    let ports = json!([
        { "uuid": "port-a", "name": "e0a", "node": { "name": "node1" } },
        { "uuid": "port-b", "name": "e0b", "node": { "name": "node1" } }
    ]);
    Mock::given(method("GET"))
        .and(path("/api/network/ethernet/broadcast-domains"))
        .and(query_param("name", "bd_new"))
        .respond_with(records(json!([])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/network/ethernet/broadcast-domains"))
        .and(query_param("name", "bd_new"))
        .respond_with(records(json!([{
            "uuid": "bd-1", "name": "bd_new", "ipspace": { "name": "Default" },
            "mtu": 1500, "ports": ports.clone()
        }])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/network/ethernet/broadcast-domains"))
        .and(query_param_is_missing("name"))
        .respond_with(records(json!([{
            "uuid": "bd-1", "name": "bd_old", "ipspace": { "name": "Default" },
            "mtu": 1500, "ports": ports
        }])))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/network/ethernet/broadcast-domains/bd-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let outcome = ResourceKind::BroadcastDomain
        .apply(
            &session,
            params(json!({"name": "bd_new", "mtu": 9000, "ports": ["node1:e0a", "node1:e0b"]})),
            false,
        )
        .await
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(
        mutations(&server).await,
        vec![
            ("PATCH".to_owned(), json!({ "name": "bd_new" })),
            ("PATCH".to_owned(), json!({ "mtu": 9000 })),
        ]
    );
}

// ── User lock state ─────────────────────────────────────────────────

async fn mount_account(server: &MockServer, account: Value) {
    Mock::given(method("GET"))
        .and(path("/api/security/accounts"))
        .and(query_param("name", "bob"))
        .respond_with(records(json!([account])))
        .mount(server)
        .await;
}

#[tokio::test]
async fn locking_without_a_password_is_rejected() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;
    mount_account(
        &server,
        json!({
            "name": "bob",
            "owner": { "uuid": "o-1", "name": "svm1" },
            "role": { "name": "admin" },
            "applications": [{ "application": "ssh" }]
        }),
    )
    .await;

    let session = session(&server, UseRest::Auto);
    let err = ResourceKind::User
        .apply(
            &session,
            params(json!({
                "name": "bob", "vserver": "svm1", "applications": ["ssh"],
                "role_name": "admin", "lock_user": true
            })),
            false,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot modify lock state if password is not set"));
}

#[tokio::test]
async fn check_mode_plans_password_before_lock_and_sends_nothing() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;
    mount_account(
        &server,
        json!({
            "name": "bob",
            "owner": { "uuid": "o-1", "name": "svm1" },
            "role": { "name": "admin" },
            "locked": false,
            "applications": [{ "application": "ssh" }]
        }),
    )
    .await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let outcome = ResourceKind::User
        .apply(
            &session,
            params(json!({
                "name": "bob", "vserver": "svm1", "applications": ["ssh"],
                "role_name": "admin", "lock_user": true, "set_password": "n3w-secret"
            })),
            true,
        )
        .await
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(
        outcome.plan.unwrap(),
        vec!["set password (user bob)".to_owned(), "modify user bob: lock_user".to_owned()]
    );

    let mutations = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() != "GET")
        .count();
    assert_eq!(mutations, 0);
}

#[tokio::test]
async fn password_then_lock_are_patched_in_order() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;
    mount_account(
        &server,
        json!({
            "name": "bob",
            "owner": { "uuid": "o-1", "name": "svm1" },
            "role": { "name": "admin" },
            "locked": false,
            "applications": [{ "application": "ssh" }]
        }),
    )
    .await;
    Mock::given(method("PATCH"))
        .and(path("/api/security/accounts/o-1/bob"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let outcome = ResourceKind::User
        .apply(
            &session,
            params(json!({
                "name": "bob", "vserver": "svm1", "applications": ["ssh"],
                "role_name": "admin", "lock_user": true, "set_password": "n3w-secret"
            })),
            false,
        )
        .await
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(
        mutations(&server).await,
        vec![
            ("PATCH".to_owned(), json!({ "password": "n3w-secret" })),
            ("PATCH".to_owned(), json!({ "locked": true })),
        ]
    );
}

#[tokio::test]
async fn reused_password_is_unchanged_when_applied() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;
    mount_account(
        &server,
        json!({
            "name": "bob",
            "owner": { "uuid": "o-1", "name": "svm1" },
            "role": { "name": "admin" },
            "locked": false,
            "applications": [{ "application": "ssh" }]
        }),
    )
    .await;
    Mock::given(method("PATCH"))
        .and(path("/api/security/accounts/o-1/bob"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "message": "New password must be different than the old password.",
                "code": "7077918"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let request = params(json!({
        "name": "bob", "vserver": "svm1", "applications": ["ssh"],
        "role_name": "admin", "set_password": "0ld-secret"
    }));

    let planned = ResourceKind::User.apply(&session, request.clone(), true).await.unwrap();
    assert!(planned.changed);

    let applied = ResourceKind::User.apply(&session, request, false).await.unwrap();
    assert!(!applied.changed);
    assert_eq!(applied.previous_errors.len(), 1);
}

// ── Software download ───────────────────────────────────────────────

async fn mount_no_package(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/cluster/software/packages"))
        .and(query_param("version", "9.13.1"))
        .respond_with(records(json!([])))
        .mount(server)
        .await;
}

fn download_request() -> Map<String, Value> {
    params(json!({"package_version": "9.13.1", "package_url": "https://repo/image.tgz"}))
}

#[tokio::test]
async fn bad_gateway_during_download_counts_as_started() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;
    mount_no_package(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/cluster/software/download"))
        .and(body_partial_json(json!({ "url": "https://repo/image.tgz" })))
        .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
        .expect(1)
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    let outcome = ResourceKind::SoftwareDownload
        .apply(&session, download_request(), false)
        .await
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.previous_errors.len(), 1);
}

#[tokio::test]
async fn transport_timeout_during_download_counts_as_started() {
    let server = MockServer::start().await;
    mount_rest_cluster(&server).await;
    mount_no_package(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/cluster/software/download"))
        .respond_with(
            ResponseTemplate::new(202)
                .set_body_json(json!({}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    let session = session_with(&server, UseRest::Auto, http);
    let outcome = ResourceKind::SoftwareDownload
        .apply(&session, download_request(), false)
        .await
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.previous_errors.len(), 1);
}

// ── Version caching ─────────────────────────────────────────────────

#[tokio::test]
async fn version_is_read_once_per_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/cluster"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "version": { "generation": 9, "major": 13, "minor": 1 }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/support/ems/destinations"))
        .respond_with(records(json!([])))
        .mount(&server)
        .await;

    let session = session(&server, UseRest::Auto);
    for _ in 0..2 {
        let outcome = ResourceKind::EmsDestination
            .apply(&session, params(json!({"name": "gone", "state": "absent"})), false)
            .await
            .unwrap();
        assert!(!outcome.changed);
    }
}
