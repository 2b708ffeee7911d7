//! HTTP gateway event translation: gateway envelope in, loopback request to
//! the user program, gateway response envelope out.

use std::collections::HashMap;
use std::io::Write;

use anyhow::Context as _;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

/// Paths under this prefix belong to the adapter and never reach the app.
pub const RESERVED_PATH_PREFIX: &str = "/_lambdafy/";

#[derive(Debug, Default, Deserialize)]
pub struct HttpRequestEvent {
    #[serde(default, rename = "rawPath")]
    pub raw_path: String,
    #[serde(default, rename = "rawQueryString")]
    pub raw_query_string: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default, rename = "isBase64Encoded")]
    pub is_base64_encoded: bool,
    #[serde(default, rename = "requestContext")]
    pub request_context: RequestContext,
}

#[derive(Debug, Default, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub http: HttpContext,
}

#[derive(Debug, Default, Deserialize)]
pub struct HttpContext {
    #[serde(default)]
    pub method: String,
}

#[derive(Debug, Default, Serialize)]
pub struct HttpResponseEvent {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    #[serde(rename = "multiValueHeaders")]
    pub multi_value_headers: HashMap<String, Vec<String>>,
    pub cookies: Vec<String>,
    pub body: String,
    #[serde(rename = "isBase64Encoded")]
    pub is_base64_encoded: bool,
}

/// Forwards a gateway request to the user program and folds the response
/// back into the gateway shape.
pub async fn handle_http(
    client: &reqwest::Client,
    app_endpoint: &str,
    event: HttpRequestEvent,
) -> anyhow::Result<HttpResponseEvent> {
    // Reserved mounts are answered by the adapter without touching the app.
    if event.raw_path.starts_with(RESERVED_PATH_PREFIX) {
        return Ok(HttpResponseEvent {
            status_code: 404,
            ..Default::default()
        });
    }

    let body = if event.is_base64_encoded {
        BASE64
            .decode(event.body.as_bytes())
            .context("failed to decode base64 request body")?
    } else {
        event.body.into_bytes()
    };

    let path = if event.raw_path.is_empty() {
        "/"
    } else {
        &event.raw_path
    };
    let query = if event.raw_query_string.is_empty() {
        String::new()
    } else {
        format!("?{}", event.raw_query_string)
    };
    let url = format!("http://{app_endpoint}{path}{query}");

    let method = reqwest::Method::from_bytes(event.request_context.http.method.as_bytes())
        .context("invalid request method")?;
    let mut req = client.request(method, &url).body(body);

    let mut gzip_allowed = false;
    for (key, value) in &event.headers {
        match key.to_ascii_lowercase().as_str() {
            "host" => {
                req = req.header(reqwest::header::HOST, value);
            }
            // Withheld: the adapter compresses responses itself.
            "accept-encoding" => {
                if value.contains("gzip") {
                    gzip_allowed = true;
                }
            }
            _ => {
                req = req.header(key, value);
            }
        }
    }

    let upstream = req.send().await.context("request to app failed")?;

    let mut response = HttpResponseEvent {
        status_code: upstream.status().as_u16(),
        is_base64_encoded: true,
        ..Default::default()
    };

    let mut already_encoded = false;
    for key in upstream.headers().keys() {
        let values: Vec<String> = upstream
            .headers()
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        let lower = key.as_str().to_ascii_lowercase();
        if lower == "content-encoding" {
            already_encoded = true;
        }
        if lower == "set-cookie" {
            response.cookies.extend(values);
        } else if let [value] = values.as_slice() {
            response
                .headers
                .insert(key.as_str().to_string(), value.clone());
        } else {
            response
                .multi_value_headers
                .insert(key.as_str().to_string(), values);
        }
    }

    let mut body = upstream.bytes().await.context("failed to read app response")?.to_vec();

    if gzip_allowed && !already_encoded {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body)?;
        body = encoder.finish()?;
        response
            .headers
            .insert("Content-Encoding".to_string(), "gzip".to_string());
    }

    response.body = BASE64.encode(&body);
    Ok(response)
}
