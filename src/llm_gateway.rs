use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use tracing::debug;

/// Named routes a prompt can be sent down. Cheap/fast routes are used for
/// high-frequency judgment calls (the Quality Gate, the Planning Critic);
/// the `Pro` route is reserved for low-frequency, high-value reasoning
/// (nightly strategist proposals, self-review).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Fast,
    Pro,
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("gateway returned {status}: {body}")]
    Gateway {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("response was not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Narrow seam over whatever model backend answers a prompt. Kept as a
/// trait so Gate/Critic/Council can be tested against a canned responder
/// without a network call.
#[async_trait::async_trait]
pub trait LlmGateway: Send + Sync {
    async fn route(&self, prompt: &str, route: Route) -> Result<String, GateError>;
}

#[derive(Serialize)]
struct RouteRequest<'a> {
    prompt: &'a str,
    route: &'a str,
}

/// `reqwest`-backed gateway talking to a generic completion endpoint.
/// Cheap to clone: the underlying `reqwest::Client` is reference-counted.
#[derive(Clone)]
pub struct HttpLlmGateway {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpLlmGateway {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    fn route_id(route: Route) -> &'static str {
        match route {
            Route::Fast => "fast",
            Route::Pro => "pro",
        }
    }
}

#[async_trait::async_trait]
impl LlmGateway for HttpLlmGateway {
    async fn route(&self, prompt: &str, route: Route) -> Result<String, GateError> {
        let body = RouteRequest {
            prompt,
            route: Self::route_id(route),
        };
        let resp = self.http.post(&self.endpoint).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(GateError::Gateway { status, body: text });
        }
        let text = resp.text().await?;
        Ok(text)
    }
}

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("static regex is valid")
});

/// Strip a surrounding ```json ... ``` markdown fence, if present, then
/// parse the remainder as JSON. Model responses to JSON-contract prompts
/// routinely arrive fenced even when told not to.
pub fn extract_json(text: &str) -> Result<serde_json::Value, GateError> {
    let unfenced = match FENCE_RE.captures(text) {
        Some(caps) => caps.get(1).map(|m| m.as_str().trim()).unwrap_or(text),
        None => text.trim(),
    };
    debug!(len = unfenced.len(), "parsing gateway response as json");
    Ok(serde_json::from_str(unfenced)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_plain() {
        let v = extract_json(r#"{"ok": true}"#).unwrap();
        assert_eq!(v["ok"], true);
    }

    #[test]
    fn extract_json_fenced() {
        let v = extract_json("```json\n{\"ok\": true}\n```").unwrap();
        assert_eq!(v["ok"], true);
    }

    #[test]
    fn extract_json_fenced_no_lang_tag() {
        let v = extract_json("```\n{\"n\": 5}\n```").unwrap();
        assert_eq!(v["n"], 5);
    }

    #[test]
    fn extract_json_invalid_errors() {
        assert!(extract_json("not json at all").is_err());
    }

    struct Canned(&'static str);

    #[async_trait::async_trait]
    impl LlmGateway for Canned {
        async fn route(&self, _prompt: &str, _route: Route) -> Result<String, GateError> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn canned_gateway_returns_fixed_response() {
        let gw = Canned(r#"{"confidence": 90}"#);
        let out = gw.route("anything", Route::Fast).await.unwrap();
        let parsed = extract_json(&out).unwrap();
        assert_eq!(parsed["confidence"], 90);
    }
}
