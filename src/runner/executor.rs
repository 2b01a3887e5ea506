use super::context::{json_path, Environment};
use super::state::{RequestSnapshot, ResponseSnapshot, StepResult};
use crate::error::FlowError;
use crate::parser::types::{FlowConfig, TestStep};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Read;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Used when neither the flow config nor the caller sets a timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Realistic browser defaults, filled for any header not already set.
/// Target servers commonly sit behind bot-detection middleware that
/// rejects bare clients, so these are a functional requirement.
const DEFAULT_HEADERS: &[(&str, &str)] = &[
    ("Accept", "application/json, text/plain, */*"),
    ("Accept-Language", "en-US,en;q=0.9"),
    ("Accept-Encoding", "gzip, deflate"),
    ("Connection", "keep-alive"),
    ("Cache-Control", "no-cache"),
    (
        "sec-ch-ua",
        "\"Chromium\";v=\"122\", \"Not(A:Brand\";v=\"24\", \"Google Chrome\";v=\"122\"",
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"macOS\""),
    (
        "User-Agent",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    ),
];

/// A fully resolved request, ready to issue
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Executes one resolved step against its target
pub struct StepExecutor {
    client: reqwest::Client,
}

impl Default for StepExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl StepExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Run one action step: interpolate, request, decode, verify, extract.
    /// Mutates `env` through extraction; never touches file contents.
    pub async fn execute(
        &self,
        step: &TestStep,
        env: &mut Environment,
        config: &FlowConfig,
        depth: usize,
        file_id: &str,
        local_index: usize,
        cancel: &CancellationToken,
    ) -> StepResult {
        let mut result = StepResult::new(&step.display_name(), depth, file_id, local_index);
        if cancel.is_cancelled() {
            result.cancel();
            return result;
        }
        result.start();

        let prepared = match prepare_request(step, env, config) {
            Ok(p) => p,
            Err(e) => {
                result.fail(e.to_string());
                return result;
            }
        };

        result.request = Some(RequestSnapshot {
            url: prepared.url.clone(),
            method: prepared.method.clone(),
            headers: prepared.headers.iter().cloned().collect(),
            body: prepared.body.clone(),
        });

        let method: reqwest::Method = match prepared.method.parse() {
            Ok(m) => m,
            Err(_) => {
                result.fail(format!("invalid HTTP method '{}'", prepared.method));
                return result;
            }
        };

        let mut request = self.client.request(method, &prepared.url);
        for (name, value) in &prepared.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(ref body) = prepared.body {
            request = request.body(body.clone());
        }

        let timeout_ms = config.timeout.unwrap_or(DEFAULT_TIMEOUT_MS);
        let started = Instant::now();

        // Timeout and run cancellation race the in-flight request;
        // whichever fires first aborts the transport.
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(FlowError::Cancelled),
            sent = tokio::time::timeout(Duration::from_millis(timeout_ms), request.send()) => {
                match sent {
                    Err(_) => Err(FlowError::Timeout(timeout_ms)),
                    Ok(Err(e)) => Err(FlowError::Network(e.to_string())),
                    Ok(Ok(response)) => Ok(response),
                }
            }
        };

        let response = match outcome {
            Ok(r) => r,
            Err(e) if e.is_cancellation() => {
                result.cancel();
                return result;
            }
            Err(e) => {
                result.fail(e.to_string());
                return result;
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).to_string(),
                )
            })
            .collect();

        let raw = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                result.fail(FlowError::Network(e.to_string()).to_string());
                return result;
            }
        };

        let encoding = headers.get("content-encoding").map(|s| s.as_str());
        let content_type = headers.get("content-type").map(|s| s.as_str());
        let (display_body, body_value) = decode_body(&raw, encoding, content_type);

        result.response = Some(ResponseSnapshot {
            status,
            headers,
            body: Some(display_body),
        });

        if let Some(ref verify) = step.verify {
            if let Err(e) = verify_response(verify, status, elapsed_ms, body_value.as_ref(), env) {
                result.fail(e.to_string());
                return result;
            }
        }

        // Extraction runs after verification, against the same response
        if let Some(ref extract) = step.extract {
            if let Some(ref body) = body_value {
                env.extract(extract, body);
            }
        }

        result.pass();
        result
    }
}

/// Steps 1-4 of the execution cycle: interpolation, URL resolution,
/// header merging and the default-header fill. Pure, so the header rules
/// are testable without a network.
pub fn prepare_request(
    step: &TestStep,
    env: &Environment,
    config: &FlowConfig,
) -> Result<PreparedRequest, FlowError> {
    let method = env
        .interpolate(step.method.as_deref().unwrap_or("GET"))
        .to_uppercase();
    let url = env.interpolate(step.url.as_deref().ok_or_else(|| {
        FlowError::Load(format!("step '{}' has no url", step.name))
    })?);
    let base = config.base_url.as_ref().map(|b| env.interpolate(b));
    let full_url = resolve_url(base.as_deref(), &url);

    let mut headers = merge_headers(config.headers.as_ref(), step.headers.as_ref(), env);

    // GET/HEAD never carry a body or a Content-Type, regardless of what the
    // step declares. Not overridable.
    let bodyless = method == "GET" || method == "HEAD";
    let body = if bodyless {
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case("content-type"));
        None
    } else {
        match &step.body {
            Some(value) => {
                let interpolated = env.deep_interpolate(value);
                let serialized = match interpolated {
                    Value::String(s) => s,
                    other => serde_json::to_string(&other)
                        .map_err(|e| FlowError::Load(format!("unserializable body: {}", e)))?,
                };
                if !headers
                    .iter()
                    .any(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                {
                    headers.push(("Content-Type".to_string(), "application/json".to_string()));
                }
                Some(serialized)
            }
            None => None,
        }
    };

    fill_default_headers(&mut headers);

    Ok(PreparedRequest {
        method,
        url: full_url,
        headers,
        body,
    })
}

/// Resolve `url` against `base` unless already absolute
pub fn resolve_url(base: Option<&str>, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    match base {
        Some(base) => format!(
            "{}{}{}",
            base.trim_end_matches('/'),
            if url.starts_with('/') { "" } else { "/" },
            url
        ),
        None => url.to_string(),
    }
}

/// Config headers first, step headers over them, case-insensitively
pub fn merge_headers(
    config: Option<&HashMap<String, String>>,
    step: Option<&HashMap<String, String>>,
    env: &Environment,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for source in [config, step].into_iter().flatten() {
        for (name, value) in source {
            let value = env.interpolate(value);
            match out
                .iter_mut()
                .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            {
                Some(slot) => slot.1 = value,
                None => out.push((name.clone(), value)),
            }
        }
    }
    out
}

fn fill_default_headers(headers: &mut Vec<(String, String)>) {
    for (name, value) in DEFAULT_HEADERS {
        if !headers
            .iter()
            .any(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            headers.push((name.to_string(), value.to_string()));
        }
    }
}

/// Inflate gzip/deflate payloads and parse JSON for stable display.
/// Returns the display text plus the parsed body for verify/extract.
pub fn decode_body(
    raw: &[u8],
    encoding: Option<&str>,
    content_type: Option<&str>,
) -> (String, Option<Value>) {
    let bytes = match encoding {
        Some(e) if e.contains("gzip") => {
            let mut decoder = flate2::read::MultiGzDecoder::new(raw);
            let mut out = Vec::new();
            if decoder.read_to_end(&mut out).is_ok() {
                out
            } else {
                raw.to_vec()
            }
        }
        Some(e) if e.contains("deflate") => {
            let mut out = Vec::new();
            let mut zlib = flate2::read::ZlibDecoder::new(raw);
            if zlib.read_to_end(&mut out).is_ok() {
                out
            } else {
                out.clear();
                let mut deflate = flate2::read::DeflateDecoder::new(raw);
                if deflate.read_to_end(&mut out).is_ok() {
                    out
                } else {
                    raw.to_vec()
                }
            }
        }
        _ => raw.to_vec(),
    };

    let text = String::from_utf8_lossy(&bytes).to_string();
    let parsed: Option<Value> = serde_json::from_str(&text).ok();
    let is_json = content_type.map_or(false, |ct| ct.contains("json"));
    let display = match (&parsed, is_json) {
        (Some(value), true) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| text.clone())
        }
        _ => text.clone(),
    };
    (display, parsed)
}

/// Apply a step's `verify` block. Expected values are resolved against the
/// environment directly, so an object-valued variable compares
/// structurally rather than through a stringified round trip.
pub fn verify_response(
    verify: &HashMap<String, Value>,
    status: u16,
    elapsed_ms: u64,
    body: Option<&Value>,
    env: &Environment,
) -> Result<(), FlowError> {
    for (key, expected) in verify {
        match key.as_str() {
            "status" => {
                let want = resolve_expected(expected, env);
                let want = value_as_u64(&want).ok_or_else(|| {
                    FlowError::Verification(format!("invalid expected status: {}", fmt(expected)))
                })?;
                if want != status as u64 {
                    return Err(FlowError::Verification(format!(
                        "expected status {}, got {}",
                        want, status
                    )));
                }
            }
            "responseTime" => {
                let limit = value_as_u64(expected).ok_or_else(|| {
                    FlowError::Verification(format!(
                        "invalid responseTime bound: {}",
                        fmt(expected)
                    ))
                })?;
                if elapsed_ms > limit {
                    return Err(FlowError::Verification(format!(
                        "expected response time <= {}ms, got {}ms",
                        limit, elapsed_ms
                    )));
                }
            }
            path_key if path_key.starts_with("body.") => {
                let path = &path_key["body.".len()..];
                let expected = resolve_expected(expected, env);
                let actual = body.and_then(|b| json_path(b, path));
                match actual {
                    None => {
                        return Err(FlowError::Verification(format!(
                            "verify {}: expected {}, got undefined",
                            path_key,
                            fmt(&expected)
                        )))
                    }
                    Some(actual) if !loosely_equal(&expected, actual) => {
                        return Err(FlowError::Verification(format!(
                            "verify {}: expected {}, got {}",
                            path_key,
                            fmt(&expected),
                            fmt(actual)
                        )))
                    }
                    Some(_) => {}
                }
            }
            other => {
                return Err(FlowError::Verification(format!(
                    "unsupported verify key '{}'",
                    other
                )))
            }
        }
    }
    Ok(())
}

fn resolve_expected(expected: &Value, env: &Environment) -> Value {
    match expected {
        Value::String(s) => env.resolve_value(s),
        other => other.clone(),
    }
}

/// Coerced equality: structural match, or equal canonical string forms,
/// or numerically equal after parsing.
fn loosely_equal(expected: &Value, actual: &Value) -> bool {
    if expected == actual {
        return true;
    }
    let e = fmt(expected);
    let a = fmt(actual);
    if e == a {
        return true;
    }
    match (e.parse::<f64>(), a.parse::<f64>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn fmt(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> Environment {
        Environment::new()
    }

    #[test]
    fn test_resolve_url() {
        assert_eq!(
            resolve_url(Some("https://api.example.com/"), "/users"),
            "https://api.example.com/users"
        );
        assert_eq!(
            resolve_url(Some("https://api.example.com"), "users"),
            "https://api.example.com/users"
        );
        assert_eq!(
            resolve_url(Some("https://api.example.com"), "https://other.test/x"),
            "https://other.test/x"
        );
        assert_eq!(resolve_url(None, "/users"), "/users");
    }

    #[test]
    fn test_get_strips_body_and_content_type() {
        let step = TestStep {
            name: "fetch".to_string(),
            method: Some("GET".to_string()),
            url: Some("/x".to_string()),
            headers: Some(HashMap::from([(
                "Content-Type".to_string(),
                "application/json".to_string(),
            )])),
            body: Some(json!({"should": "vanish"})),
            ..Default::default()
        };
        let prepared = prepare_request(&step, &env(), &FlowConfig::default()).unwrap();
        assert!(prepared.body.is_none());
        assert!(!prepared
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-type")));
    }

    #[test]
    fn test_step_headers_override_config_case_insensitively() {
        let config = FlowConfig {
            headers: Some(HashMap::from([(
                "X-Token".to_string(),
                "from-config".to_string(),
            )])),
            ..Default::default()
        };
        let step = TestStep {
            name: "s".to_string(),
            method: Some("POST".to_string()),
            url: Some("/x".to_string()),
            headers: Some(HashMap::from([(
                "x-token".to_string(),
                "from-step".to_string(),
            )])),
            ..Default::default()
        };
        let prepared = prepare_request(&step, &env(), &config).unwrap();
        let tokens: Vec<_> = prepared
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("x-token"))
            .collect();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].1, "from-step");
    }

    #[test]
    fn test_default_headers_fill_but_never_override() {
        let step = TestStep {
            name: "s".to_string(),
            method: Some("GET".to_string()),
            url: Some("/x".to_string()),
            headers: Some(HashMap::from([(
                "accept".to_string(),
                "text/html".to_string(),
            )])),
            ..Default::default()
        };
        let prepared = prepare_request(&step, &env(), &FlowConfig::default()).unwrap();

        let accepts: Vec<_> = prepared
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("accept"))
            .collect();
        assert_eq!(accepts.len(), 1);
        assert_eq!(accepts[0].1, "text/html");

        assert!(prepared
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("user-agent")));
        assert!(prepared
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("accept-encoding")));
    }

    #[test]
    fn test_interpolation_reaches_url_headers_body() {
        let mut env = Environment::new();
        env.set("id", json!(7));
        env.set("token", json!("t-9"));
        let step = TestStep {
            name: "s".to_string(),
            method: Some("POST".to_string()),
            url: Some("/users/{{id}}".to_string()),
            headers: Some(HashMap::from([(
                "Authorization".to_string(),
                "Bearer {{token}}".to_string(),
            )])),
            body: Some(json!({"id": "{{id}}"})),
            ..Default::default()
        };
        let prepared = prepare_request(
            &step,
            &env,
            &FlowConfig {
                base_url: Some("https://api.example.com".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(prepared.url, "https://api.example.com/users/7");
        assert!(prepared
            .headers
            .iter()
            .any(|(_, v)| v == "Bearer t-9"));
        // whole-placeholder body values keep their JSON type
        assert_eq!(prepared.body.as_deref(), Some("{\"id\":7}"));
    }

    #[test]
    fn test_verify_status_mismatch_message() {
        let verify = HashMap::from([("status".to_string(), json!(200))]);
        let err = verify_response(&verify, 404, 10, None, &env()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("expected status 200"), "{}", msg);
        assert!(msg.contains("got 404"), "{}", msg);
    }

    #[test]
    fn test_verify_response_time_upper_bound() {
        let verify = HashMap::from([("responseTime".to_string(), json!(100))]);
        assert!(verify_response(&verify, 200, 99, None, &env()).is_ok());
        assert!(verify_response(&verify, 200, 101, None, &env()).is_err());
    }

    #[test]
    fn test_verify_body_path_loose_equality() {
        let body = json!({"data": {"count": 42, "name": "flow"}});
        let verify = HashMap::from([
            ("body.data.count".to_string(), json!("42")),
            ("body.data.name".to_string(), json!("flow")),
        ]);
        assert!(verify_response(&verify, 200, 1, Some(&body), &env()).is_ok());

        let verify = HashMap::from([("body.data.count".to_string(), json!(41))]);
        let err = verify_response(&verify, 200, 1, Some(&body), &env()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("body.data.count"), "{}", msg);
        assert!(msg.contains("expected 41"), "{}", msg);
        assert!(msg.contains("got 42"), "{}", msg);
    }

    #[test]
    fn test_verify_expected_resolves_against_environment() {
        let mut env = Environment::new();
        env.set("expected_user", json!({"id": 1}));
        env.set("code", json!("ok"));

        let body = json!({"user": {"id": 1}, "code": "ok"});
        let verify = HashMap::from([
            ("body.user".to_string(), json!("{{expected_user}}")),
            ("body.code".to_string(), json!("{{code}}")),
        ]);
        assert!(verify_response(&verify, 200, 1, Some(&body), &env).is_ok());
    }

    #[test]
    fn test_verify_missing_path_is_failure() {
        let body = json!({"a": 1});
        let verify = HashMap::from([("body.b".to_string(), json!(1))]);
        let err = verify_response(&verify, 200, 1, Some(&body), &env()).unwrap_err();
        assert!(err.to_string().contains("got undefined"));
    }

    #[test]
    fn test_decode_gzip_body() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"ok\":true}").unwrap();
        let compressed = encoder.finish().unwrap();

        let (display, parsed) =
            decode_body(&compressed, Some("gzip"), Some("application/json"));
        assert_eq!(parsed, Some(json!({"ok": true})));
        assert!(display.contains("\"ok\""));
    }

    #[test]
    fn test_decode_invalid_json_falls_back_to_text() {
        let (display, parsed) = decode_body(b"not json", None, Some("application/json"));
        assert_eq!(display, "not json");
        assert!(parsed.is_none());
    }

    async fn one_shot_server(status_line: &'static str, body: &'static str) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_execute_reports_status_verification_failure() {
        let addr = one_shot_server("404 Not Found", "{\"error\":\"missing\"}").await;
        let step = TestStep {
            name: "A".to_string(),
            url: Some(format!("http://{}/x", addr)),
            verify: Some(HashMap::from([("status".to_string(), json!(200))])),
            ..Default::default()
        };

        let mut env = Environment::new();
        let executor = StepExecutor::new();
        let result = executor
            .execute(
                &step,
                &mut env,
                &FlowConfig::default(),
                0,
                "file-1",
                0,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.status, crate::runner::state::StepStatus::Failed);
        let error = result.error.unwrap();
        assert!(error.contains("expected status 200"), "{}", error);
        assert!(error.contains("got 404"), "{}", error);
        assert_eq!(result.response.unwrap().status, 404);
    }

    #[tokio::test]
    async fn test_execute_extracts_after_passing_verify() {
        let addr = one_shot_server("200 OK", "{\"data\":{\"token\":\"t-1\"}}").await;
        let step = TestStep {
            name: "login".to_string(),
            url: Some(format!("http://{}/auth", addr)),
            verify: Some(HashMap::from([("status".to_string(), json!(200))])),
            extract: Some(HashMap::from([(
                "token".to_string(),
                "body.data.token".to_string(),
            )])),
            ..Default::default()
        };

        let mut env = Environment::new();
        let executor = StepExecutor::new();
        let result = executor
            .execute(
                &step,
                &mut env,
                &FlowConfig::default(),
                0,
                "file-1",
                0,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.status, crate::runner::state::StepStatus::Passed);
        assert_eq!(env.interpolate("{{token}}"), "t-1");
    }

    #[tokio::test]
    async fn test_pre_aborted_cancel_yields_cancelled_not_failed() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let step = TestStep {
            name: "never".to_string(),
            url: Some("http://127.0.0.1:9/x".to_string()),
            ..Default::default()
        };
        let mut env = Environment::new();
        let executor = StepExecutor::new();
        let result = executor
            .execute(
                &step,
                &mut env,
                &FlowConfig::default(),
                0,
                "file-1",
                0,
                &cancel,
            )
            .await;

        assert_eq!(result.status, crate::runner::state::StepStatus::Cancelled);
        assert!(result.error.is_none());
    }
}
