//! HTTP transport over ureq

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use declarative::{AdapterError, HttpAuth, HttpRequest, HttpResponse, HttpTransport};
use std::time::Duration;
use ureq::http;

/// Blocking HTTP client
///
/// Status codes never surface as errors; the engine classifies them.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self { agent }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl HttpTransport for UreqTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, AdapterError> {
        let mut builder = http::Request::builder()
            .method(request.method.as_str())
            .uri(request.url.as_str());

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(auth) = &request.auth {
            builder = builder.header("Authorization", authorization(auth));
        }

        let result = match &request.body {
            Some(body) => {
                let has_content_type = request
                    .headers
                    .keys()
                    .any(|k| k.eq_ignore_ascii_case("content-type"));
                if !has_content_type {
                    builder = builder.header("Content-Type", "application/json");
                }
                let built = builder.body(body.clone()).map_err(|e| invalid(request, &e))?;
                self.agent.run(built)
            }
            None => {
                let built = builder.body(()).map_err(|e| invalid(request, &e))?;
                self.agent.run(built)
            }
        };

        let mut response = result.map_err(|e| transport_error(&request.url, e))?;
        let status = response.status().as_u16();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| transport_error(&request.url, e))?;

        Ok(HttpResponse { status, body })
    }
}

fn authorization(auth: &HttpAuth) -> String {
    match auth {
        HttpAuth::Basic { user, password } => {
            format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
        }
        HttpAuth::Bearer(token) => format!("Bearer {token}"),
    }
}

fn invalid(request: &HttpRequest, error: &http::Error) -> AdapterError {
    AdapterError::permanent(format!(
        "invalid request {} {}: {error}",
        request.method, request.url
    ))
}

/// Malformed requests are permanent; anything on the wire may clear up
fn transport_error(url: &str, error: ureq::Error) -> AdapterError {
    match error {
        ureq::Error::BadUri(_) | ureq::Error::Http(_) => {
            AdapterError::permanent(format!("{url}: {error}"))
        }
        other => AdapterError::transient(format!("{url}: {other}")),
    }
}
