//! Host functions exposed to extension scripts.
//!
//! The only network capability a script gets is `fetch(url, options?)`. It
//! is backed by a blocking HTTP client owned by the sandbox thread, with a
//! per-request timeout and a response-size cap from [`crate::SandboxConfig`].
//! The native side never throws; it returns a JSON envelope that a small JS
//! shim turns into a resolved or rejected Promise with the familiar
//! `{ ok, status, headers, text(), json() }` surface.
//!
//! The request itself runs synchronously on the sandbox thread, bounded by
//! the fetch timeout; the host-side round-trip timeout covers the
//! caller-visible worst case.

use crate::config::SandboxConfig;
use rquickjs::{Ctx, Function};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

/// The JS half of the fetch primitive. `__sandbox_fetch` is the native
/// function installed below.
const FETCH_SHIM: &str = r#"
globalThis.fetch = function (url, options) {
    var raw = __sandbox_fetch(String(url), options ? JSON.stringify(options) : "{}");
    var parsed = JSON.parse(raw);
    if (parsed.error !== undefined) {
        return Promise.reject(new TypeError(parsed.error));
    }
    var r = parsed.response;
    return Promise.resolve({
        ok: r.status >= 200 && r.status < 300,
        status: r.status,
        headers: r.headers,
        text: function () { return Promise.resolve(r.body); },
        json: function () {
            try { return Promise.resolve(JSON.parse(r.body)); }
            catch (e) { return Promise.reject(e); }
        },
    });
};
Object.freeze(globalThis.fetch);
"#;

/// Options accepted by `fetch`, a subset of the WHATWG dictionary.
#[derive(Debug, Default, Deserialize)]
struct FetchOptions {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

/// Installs the fetch primitive into one script context.
pub(crate) fn install_fetch(
    ctx: &Ctx<'_>,
    client: Arc<reqwest::blocking::Client>,
    config: &SandboxConfig,
) -> rquickjs::Result<()> {
    let enabled = config.fetch_enabled();
    let max_bytes = config.fetch_max_response_bytes();

    let native = Function::new(ctx.clone(), move |url: String, options: String| -> String {
        if !enabled {
            return json!({"error": "fetch is disabled in this sandbox"}).to_string();
        }
        match perform_fetch(&client, max_bytes, &url, &options) {
            Ok(response) => json!({"response": response}).to_string(),
            Err(reason) => {
                tracing::debug!(%url, %reason, "plugin fetch failed");
                json!({"error": reason}).to_string()
            }
        }
    })?;

    ctx.globals().set("__sandbox_fetch", native)?;
    ctx.eval::<(), _>(FETCH_SHIM)
}

/// Runs one bounded HTTP request. All failures collapse to a string reason
/// that surfaces to the plugin as a rejected Promise.
fn perform_fetch(
    client: &reqwest::blocking::Client,
    max_bytes: usize,
    url: &str,
    options: &str,
) -> Result<serde_json::Value, String> {
    let options: FetchOptions =
        serde_json::from_str(options).map_err(|e| format!("invalid fetch options: {e}"))?;

    let method = options.method.as_deref().unwrap_or("GET");
    let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("invalid method '{method}'"))?;

    let mut request = client.request(method, url);
    for (name, value) in &options.headers {
        request = request.header(name, value);
    }
    if let Some(body) = options.body {
        request = request.body(body);
    }

    let response = request.send().map_err(|e| e.to_string())?;
    let status = response.status().as_u16();
    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    // Read at most one byte past the cap so an oversized body is detected
    // without ever being buffered whole.
    let mut bytes = Vec::new();
    let cap = u64::try_from(max_bytes).unwrap_or(u64::MAX).saturating_add(1);
    response
        .take(cap)
        .read_to_end(&mut bytes)
        .map_err(|e| e.to_string())?;
    if bytes.len() > max_bytes {
        return Err(format!(
            "response body exceeds the {max_bytes} byte limit"
        ));
    }
    let body = String::from_utf8_lossy(&bytes).into_owned();

    Ok(json!({
        "status": status,
        "headers": headers,
        "body": body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use std::time::Duration;

    fn client() -> Arc<reqwest::blocking::Client> {
        Arc::new(
            reqwest::blocking::Client::builder()
                .timeout(Duration::from_millis(500))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn fetch_is_defined_and_frozen() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            install_fetch(&ctx, client(), &SandboxConfig::default()).unwrap();
            let kind: String = ctx.eval("typeof fetch").unwrap();
            assert_eq!(kind, "function");
            let replaced: bool = ctx
                .eval("(function(){ try { fetch.x = 1; } catch (e) {} return fetch.x === 1; })()")
                .unwrap();
            assert!(!replaced, "fetch should be frozen");
        });
    }

    #[test]
    fn disabled_fetch_rejects() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let config = SandboxConfig::builder().fetch_enabled(false).build();
        context.with(|ctx| {
            install_fetch(&ctx, client(), &config).unwrap();
            ctx.eval::<(), _>(
                r#"
                globalThis.outcome = null;
                fetch("http://127.0.0.1:1/unreachable")
                    .then(function () { globalThis.outcome = "resolved"; })
                    .catch(function (e) { globalThis.outcome = String(e.message); });
                "#,
            )
            .unwrap();
        });
        while runtime.execute_pending_job().unwrap_or(false) {}
        context.with(|ctx| {
            let outcome: String = ctx.eval("String(globalThis.outcome)").unwrap();
            assert!(outcome.contains("disabled"), "got: {outcome}");
        });
    }

    #[test]
    fn connection_failure_rejects_with_reason() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            install_fetch(&ctx, client(), &SandboxConfig::default()).unwrap();
            ctx.eval::<(), _>(
                r#"
                globalThis.outcome = null;
                fetch("http://127.0.0.1:1/")
                    .then(function () { globalThis.outcome = "resolved"; })
                    .catch(function (e) { globalThis.outcome = "rejected"; });
                "#,
            )
            .unwrap();
        });
        while runtime.execute_pending_job().unwrap_or(false) {}
        context.with(|ctx| {
            let outcome: String = ctx.eval("String(globalThis.outcome)").unwrap();
            assert_eq!(outcome, "rejected");
        });
    }

    #[test]
    fn oversized_response_body_is_rejected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 1024];
            let _ = Read::read(&mut stream, &mut request);
            let body = vec![b'x'; 64 * 1024];
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            // The client may hang up once it hits its cap.
            let _ = std::io::Write::write_all(&mut stream, head.as_bytes());
            let _ = std::io::Write::write_all(&mut stream, &body);
        });

        let err = perform_fetch(&client(), 1024, &format!("http://{addr}/"), "{}").unwrap_err();
        assert!(err.contains("byte limit"), "got: {err}");
        server.join().unwrap();
    }

    #[test]
    fn body_within_the_cap_is_returned_whole() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 1024];
            let _ = Read::read(&mut stream, &mut request);
            let response =
                "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";
            std::io::Write::write_all(&mut stream, response.as_bytes()).unwrap();
        });

        let value = perform_fetch(&client(), 1024, &format!("http://{addr}/"), "{}").unwrap();
        assert_eq!(value["status"], 200);
        assert_eq!(value["body"], "hello");
        server.join().unwrap();
    }

    #[test]
    fn invalid_method_is_reported() {
        let err = perform_fetch(&client(), 1024, "http://example.invalid", r#"{"method":"NO PE"}"#)
            .unwrap_err();
        assert!(err.contains("invalid method"), "got: {err}");
    }
}
