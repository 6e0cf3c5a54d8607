#![allow(clippy::unwrap_used)]
// Integration tests for `ZapiClient` using wiremock.

use url::Url;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ontap_api::{ClusterEndpoint, Credentials, Error, NaElement, ZapiClient};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, ZapiClient) {
    let server = MockServer::start().await;
    let url = Url::parse(&format!("{}{}", server.uri(), ClusterEndpoint::ZAPI_PATH)).unwrap();
    let credentials = Credentials::new("admin", "netapp1!".to_string().into());
    let client = ZapiClient::with_client(reqwest::Client::new(), url, credentials);
    (server, client)
}

fn xml(results: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_string(format!(
        "<?xml version='1.0' encoding='UTF-8'?>\
         <netapp version='1.180' xmlns='http://www.netapp.com/filer/admin'>{results}</netapp>"
    ))
}

// ── Invoke ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_invoke_passed() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path(ClusterEndpoint::ZAPI_PATH))
        .and(header("content-type", "text/xml; charset=utf-8"))
        .and(body_string_contains("<system-get-version/>"))
        .respond_with(xml(
            r#"<results status="passed">
                 <version>NetApp Release 9.8P4: Sun Apr 11 2021</version>
                 <version-tuple><system-version-tuple>
                   <generation>9</generation><major>8</major><minor>0</minor>
                 </system-version-tuple></version-tuple>
               </results>"#,
        ))
        .mount(&server)
        .await;

    let results = client
        .invoke(&NaElement::new("system-get-version"), false)
        .await
        .unwrap();
    assert_eq!(
        results.find_str("version-tuple.system-version-tuple.major"),
        Some("8")
    );
}

#[tokio::test]
async fn test_invoke_failed_maps_errno() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path(ClusterEndpoint::ZAPI_PATH))
        .respond_with(xml(
            r#"<results status="failed" errno="15661" reason="entry doesn't exist"/>"#,
        ))
        .mount(&server)
        .await;

    let err = client
        .invoke(&NaElement::new("lun-destroy"), true)
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::Zapi { ref code, .. } if code == "15661"),
        "expected Zapi error, got: {err:?}"
    );
    assert_eq!(err.message(), "entry doesn't exist");
}

#[tokio::test]
async fn test_tunneling_sets_vfiler() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path(ClusterEndpoint::ZAPI_PATH))
        .and(body_string_contains(r#"vfiler="svm1""#))
        .respond_with(xml(r#"<results status="passed"/>"#))
        .expect(1)
        .mount(&server)
        .await;

    let client = client.for_vserver(Some("svm1"));
    client
        .invoke(&NaElement::new("lun-online"), true)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unauthorized() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path(ClusterEndpoint::ZAPI_PATH))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = client
        .invoke(&NaElement::new("system-get-version"), false)
        .await
        .unwrap_err();
    assert!(err.is_auth());
}

// ── Iteration ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_invoke_iter_follows_next_tag() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path(ClusterEndpoint::ZAPI_PATH))
        .and(body_string_contains("<tag>page2</tag>"))
        .respond_with(xml(
            r#"<results status="passed">
                 <attributes-list><aggr-attributes>
                   <aggregate-name>aggr2</aggregate-name>
                 </aggr-attributes></attributes-list>
                 <num-records>1</num-records>
               </results>"#,
        ))
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(ClusterEndpoint::ZAPI_PATH))
        .and(body_string_contains("<aggr-get-iter>"))
        .respond_with(xml(
            r#"<results status="passed">
                 <attributes-list><aggr-attributes>
                   <aggregate-name>aggr1</aggregate-name>
                 </aggr-attributes></attributes-list>
                 <next-tag>page2</next-tag>
                 <num-records>1</num-records>
               </results>"#,
        ))
        .with_priority(2)
        .mount(&server)
        .await;

    let request = NaElement::new("aggr-get-iter").with_child_content("max-records", "1");
    let records = client.invoke_iter(&request, false).await.unwrap();
    let names: Vec<_> = records
        .iter()
        .filter_map(|r| r.child_str("aggregate-name"))
        .collect();
    assert_eq!(names, ["aggr1", "aggr2"]);
}
