//! End-to-end tests of the adapter's event dispatch against a loopback
//! server standing in for the user program.

use std::io::Read;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use lambdafy_proxy::runtime::{Context, dispatch};
use serde_json::{Value, json};

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path_and_query: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

type Log = Arc<Mutex<Vec<Recorded>>>;

async fn capture(State(log): State<Log>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
    let failing = bytes.as_ref() == b"bad";
    log.lock().unwrap().push(Recorded {
        method: parts.method.to_string(),
        path_and_query: parts
            .uri
            .path_and_query()
            .map(|p| p.to_string())
            .unwrap_or_default(),
        headers: parts
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect(),
        body: bytes.to_vec(),
    });
    let status = if failing {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    Response::builder().status(status).body(Body::empty()).unwrap()
}

async fn spawn_app(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr.to_string()
}

async fn recording_context() -> (Context, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new().fallback(capture).with_state(log.clone());
    let endpoint = spawn_app(app).await;
    (
        Context {
            client: reqwest::Client::new(),
            app_endpoint: endpoint,
        },
        log,
    )
}

fn header<'a>(r: &'a Recorded, name: &str) -> Option<&'a str> {
    r.headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[tokio::test]
async fn queue_envelope_posts_each_record_body() {
    let (ctx, log) = recording_context().await;
    let envelope = json!({
        "Records": [{
            "messageId": "m",
            "body": "hello",
            "receiptHandle": "r",
            "eventSourceARN": "arn:aws:sqs:us-west-2:1:q",
        }]
    });

    let out = dispatch(&ctx, envelope.to_string().as_bytes()).await.unwrap();
    assert_eq!(out["batchItemFailures"], json!([]));

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].method, "POST");
    assert_eq!(log[0].path_and_query, "/_lambdafy/sqs");
    assert_eq!(log[0].body, b"hello");
}

#[tokio::test]
async fn queue_failures_are_reported_per_item() {
    let (ctx, _log) = recording_context().await;
    let envelope = json!({
        "Records": [
            {"messageId": "m1", "body": "ok"},
            {"messageId": "m2", "body": "bad"},
            {"messageId": "m3", "body": "ok"},
        ]
    });

    let out = dispatch(&ctx, envelope.to_string().as_bytes()).await.unwrap();
    let failures: Vec<&str> = out["batchItemFailures"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["itemIdentifier"].as_str().unwrap())
        .collect();
    assert_eq!(failures, vec!["m2"]);
}

#[tokio::test]
async fn http_envelope_forwards_method_path_and_query() {
    let (ctx, log) = recording_context().await;
    let envelope = json!({
        "rawQueryString": "a=1",
        "rawPath": "/x",
        "requestContext": {"http": {"method": "GET"}},
        "headers": {},
    });

    let out = dispatch(&ctx, envelope.to_string().as_bytes()).await.unwrap();
    assert_eq!(out["statusCode"], json!(200));

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].method, "GET");
    assert_eq!(log[0].path_and_query, "/x?a=1");
}

#[tokio::test]
async fn cron_envelope_posts_to_reserved_mount() {
    let (ctx, log) = recording_context().await;
    let envelope = json!({"cron": "nightly run"});

    let out = dispatch(&ctx, envelope.to_string().as_bytes()).await.unwrap();
    assert_eq!(out, Value::Null);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].method, "POST");
    assert_eq!(log[0].path_and_query, "/_lambdafy/cron?name=nightly%20run");
    assert_eq!(header(&log[0], "content-length"), Some("0"));
}

#[tokio::test]
async fn unknown_envelope_is_an_error() {
    let (ctx, log) = recording_context().await;
    let err = dispatch(&ctx, b"{\"something\": 1}").await.unwrap_err();
    assert!(err.to_string().contains("not supported"));
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reserved_paths_return_404_without_reaching_the_app() {
    let (ctx, log) = recording_context().await;
    let envelope = json!({
        "rawQueryString": "",
        "rawPath": "/_lambdafy/anything",
        "requestContext": {"http": {"method": "GET"}},
        "headers": {},
    });

    let out = dispatch(&ctx, envelope.to_string().as_bytes()).await.unwrap();
    assert_eq!(out["statusCode"], json!(404));
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn host_is_forwarded_and_accept_encoding_withheld() {
    let (ctx, log) = recording_context().await;
    let envelope = json!({
        "rawQueryString": "",
        "rawPath": "/",
        "requestContext": {"http": {"method": "POST"}},
        "headers": {
            "Host": "example.com",
            "Accept-Encoding": "gzip, br",
            "X-Custom": "42",
        },
        "body": BASE64.encode(b"payload"),
        "isBase64Encoded": true,
    });

    dispatch(&ctx, envelope.to_string().as_bytes()).await.unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(header(&log[0], "host"), Some("example.com"));
    assert_eq!(header(&log[0], "accept-encoding"), None);
    assert_eq!(header(&log[0], "x-custom"), Some("42"));
    assert_eq!(log[0].body, b"payload");
}

#[tokio::test]
async fn response_headers_are_split_and_body_gzipped_on_request() {
    async fn fancy() -> Response {
        let mut resp = Response::new(Body::from("hello response"));
        let headers = resp.headers_mut();
        headers.append("set-cookie", "a=1".parse().unwrap());
        headers.append("set-cookie", "b=2".parse().unwrap());
        headers.insert("x-single", "one".parse().unwrap());
        headers.append("x-multi", "1".parse().unwrap());
        headers.append("x-multi", "2".parse().unwrap());
        resp
    }
    let endpoint = spawn_app(Router::new().fallback(fancy)).await;
    let ctx = Context {
        client: reqwest::Client::new(),
        app_endpoint: endpoint,
    };

    let envelope = json!({
        "rawQueryString": "",
        "rawPath": "/",
        "requestContext": {"http": {"method": "GET"}},
        "headers": {"accept-encoding": "gzip"},
    });
    let out = dispatch(&ctx, envelope.to_string().as_bytes()).await.unwrap();

    let mut cookies: Vec<&str> = out["cookies"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c.as_str().unwrap())
        .collect();
    cookies.sort();
    assert_eq!(cookies, vec!["a=1", "b=2"]);
    assert_eq!(out["headers"]["x-single"], json!("one"));
    assert_eq!(out["multiValueHeaders"]["x-multi"], json!(["1", "2"]));
    assert_eq!(out["headers"]["Content-Encoding"], json!("gzip"));

    assert_eq!(out["isBase64Encoded"], json!(true));
    let compressed = BASE64.decode(out["body"].as_str().unwrap()).unwrap();
    let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
    let mut plain = String::new();
    decoder.read_to_string(&mut plain).unwrap();
    assert_eq!(plain, "hello response");
}
