//! Minimal HTTP/1 JSON client for talking to deployed groups and to the
//! control plane's read endpoint.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde_json::Value;
use tracing::debug;

use crate::error::{DriverError, DriverResult};

/// Task a group should run.
pub const TASK_NAME_HEADER: &str = "Task-Name";
/// Where the group can reach the control plane's read endpoint.
pub const SERVER_ADDRESS_HEADER: &str = "Fusionizer-Server-Address";
/// Redirects the invocation has already taken.
pub const HOPS_HEADER: &str = "Fusion-Hops";

/// Headers attached to a group invocation.
#[derive(Debug, Clone, Default)]
pub struct InvokeHeaders {
    pub task: String,
    pub server_address: Option<String>,
    pub hops: u32,
}

/// POST `payload` to a group's entry point and return its JSON answer.
///
/// Non-JSON success bodies come back as a JSON string.
pub async fn invoke_group(
    address: &str,
    headers: &InvokeHeaders,
    payload: &Value,
    timeout: Duration,
) -> DriverResult<Value> {
    let mut extra = vec![
        (TASK_NAME_HEADER, headers.task.clone()),
        (HOPS_HEADER, headers.hops.to_string()),
    ];
    if let Some(server) = &headers.server_address {
        extra.push((SERVER_ADDRESS_HEADER, server.clone()));
    }

    let body = serde_json::to_vec(payload)
        .map_err(|e| DriverError::InvalidResponse(format!("unserializable payload: {e}")))?;
    let (status, bytes) = send("POST", address, "/", &extra, Bytes::from(body), timeout).await?;
    let uri = uri_for(address, "/");
    if !status.is_success() {
        return Err(DriverError::Status {
            uri,
            status: status.as_u16(),
            body: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    Ok(serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())))
}

/// GET a JSON document. `Ok(None)` on 404.
pub async fn get_json(address: &str, path: &str, timeout: Duration) -> DriverResult<Option<Value>> {
    let (status, bytes) = send("GET", address, path, &[], Bytes::new(), timeout).await?;
    let uri = uri_for(address, path);
    if status == http::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(DriverError::Status {
            uri,
            status: status.as_u16(),
            body: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| DriverError::InvalidResponse(format!("{uri}: {e}")))
}

/// Strip any scheme and trailing slash from an address.
pub fn host_port(address: &str) -> &str {
    let address = address.strip_prefix("http://").unwrap_or(address);
    address.trim_end_matches('/')
}

fn uri_for(address: &str, path: &str) -> String {
    format!("http://{}{path}", host_port(address))
}

async fn send(
    method: &str,
    address: &str,
    path: &str,
    headers: &[(&str, String)],
    body: Bytes,
    timeout: Duration,
) -> DriverResult<(http::StatusCode, Bytes)> {
    let host = host_port(address);
    let uri = uri_for(address, path);

    let exchange = async {
        let stream = tokio::net::TcpStream::connect(host)
            .await
            .map_err(|e| http_error(&uri, e))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| http_error(&uri, e))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method(method)
            .uri(path)
            .header("host", host)
            .header("user-agent", "fusegrid/0.1")
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        let req = builder.body(Full::new(body)).map_err(|e| http_error(&uri, e))?;

        let resp = sender.send_request(req).await.map_err(|e| http_error(&uri, e))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| http_error(&uri, e))?
            .to_bytes();
        debug!(%uri, %status, len = bytes.len(), "HTTP exchange complete");
        Ok::<_, DriverError>((status, bytes))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout { uri, timeout }),
    }
}

fn http_error(uri: &str, err: impl std::fmt::Display) -> DriverError {
    DriverError::Http {
        uri: uri.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr.to_string()
    }

    #[test]
    fn host_port_strips_scheme() {
        assert_eq!(host_port("http://10.0.0.1:8080/"), "10.0.0.1:8080");
        assert_eq!(host_port("svc.local:80"), "svc.local:80");
    }

    #[tokio::test]
    async fn invoke_sends_routing_headers() {
        let router = Router::new().route(
            "/",
            post(|headers: HeaderMap, body: String| async move {
                let task = headers[TASK_NAME_HEADER].to_str().unwrap().to_string();
                let hops = headers[HOPS_HEADER].to_str().unwrap().to_string();
                let server = headers[SERVER_ADDRESS_HEADER].to_str().unwrap().to_string();
                let payload: Value = serde_json::from_str(&body).unwrap();
                axum::Json(serde_json::json!({
                    "task": task, "hops": hops, "server": server, "payload": payload
                }))
            }),
        );
        let addr = serve(router).await;

        let headers = InvokeHeaders {
            task: "taska".into(),
            server_address: Some("api:8000".into()),
            hops: 1,
        };
        let out = invoke_group(
            &format!("http://{addr}"),
            &headers,
            &serde_json::json!({"x": 1}),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(out["task"], "taska");
        assert_eq!(out["hops"], "1");
        assert_eq!(out["server"], "api:8000");
        assert_eq!(out["payload"]["x"], 1);
    }

    #[tokio::test]
    async fn plain_text_answers_become_strings() {
        let router = Router::new().route("/", post(|| async { "hello" }));
        let addr = serve(router).await;
        let out = invoke_group(&addr, &InvokeHeaders::default(), &Value::Null, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, Value::String("hello".into()));
    }

    #[tokio::test]
    async fn get_json_maps_not_found_to_none() {
        let router = Router::new().route("/found", get(|| async { axum::Json(serde_json::json!({"ok": true})) }));
        let addr = serve(router).await;

        let found = get_json(&addr, "/found", Duration::from_secs(5)).await.unwrap();
        assert_eq!(found.unwrap()["ok"], true);
        assert!(get_json(&addr, "/missing", Duration::from_secs(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreachable_address_is_an_http_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = get_json(&addr, "/", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, DriverError::Http { .. }));
    }
}
