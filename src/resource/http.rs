//! HTTP resource - an object created through an API call
//!
//! Probed with a GET against `probe_url`; a status in `present_status` means
//! the object already exists. Creation sends `method` to `url` with an
//! optional JSON body, and may capture a value from the response into a
//! run secret.

use super::{Common, decode, invalid};
use declarative::{
    AdapterError, ApplyContext, Attributes, HttpAuth, HttpRequest, ReadinessSpec, Resource,
    ResourceDiff, ResourceSpec, ValidationError,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

const METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

fn default_method() -> String {
    "POST".to_string()
}

fn default_present_status() -> Vec<u16> {
    vec![200]
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CaptureSettings {
    secret: String,
    pointer: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpSettings {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    probe_url: Option<String>,
    #[serde(default = "default_present_status")]
    present_status: Vec<u16>,
    #[serde(default)]
    success_status: Vec<u16>,
    body: Option<Value>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    auth: Option<HttpAuth>,
    capture: Option<CaptureSettings>,
}

#[derive(Debug)]
pub struct HttpResource {
    common: Common,
    url: String,
    method: String,
    probe_url: String,
    present_status: Vec<u16>,
    /// Empty means any 2xx
    success_status: Vec<u16>,
    body: Option<Value>,
    headers: BTreeMap<String, String>,
    auth: Option<HttpAuth>,
    capture: Option<CaptureSettings>,
    /// Set once the call succeeded, for endpoints that cannot be probed
    ran: AtomicBool,
}

impl HttpResource {
    pub fn from_spec(spec: &ResourceSpec) -> Result<Self, ValidationError> {
        let common = Common::from_spec(spec)?;
        let s: HttpSettings = decode(spec)?;

        let method = s.method.to_ascii_uppercase();
        if !METHODS.contains(&method.as_str()) {
            return Err(invalid(
                &spec.id,
                "method",
                format!("unsupported method '{}'", s.method),
            ));
        }
        if !s.url.starts_with("http://") && !s.url.starts_with("https://") {
            return Err(invalid(&spec.id, "url", "url must start with http:// or https://"));
        }
        if let Some(capture) = &s.capture
            && !capture.pointer.is_empty()
            && !capture.pointer.starts_with('/')
        {
            return Err(invalid(
                &spec.id,
                "capture",
                format!("'{}' is not a JSON pointer", capture.pointer),
            ));
        }

        Ok(Self {
            common,
            probe_url: s.probe_url.unwrap_or_else(|| s.url.clone()),
            url: s.url,
            method,
            present_status: s.present_status,
            success_status: s.success_status,
            body: s.body,
            headers: s.headers,
            auth: s.auth,
            capture: s.capture,
            ran: AtomicBool::new(false),
        })
    }

    fn request(&self, method: &str, url: &str) -> HttpRequest {
        HttpRequest {
            method: method.to_string(),
            url: url.to_string(),
            headers: self.headers.clone(),
            body: None,
            auth: self.auth.clone(),
        }
    }

    fn succeeded(&self, status: u16) -> bool {
        if self.success_status.is_empty() {
            (200..300).contains(&status)
        } else {
            self.success_status.contains(&status)
        }
    }

    fn present(&self, ctx: &ApplyContext<'_>) -> Result<bool, AdapterError> {
        if self.present_status.is_empty() {
            return Ok(self.ran.load(Ordering::SeqCst));
        }

        let response = ctx.http(&self.request("GET", &self.probe_url))?;
        if self.present_status.contains(&response.status) {
            return Ok(true);
        }
        match response.status {
            408 | 429 | 500..=599 => Err(AdapterError::from_http_status(
                response.status,
                &self.probe_url,
                &ctx.redact(&response.body),
            )),
            _ => Ok(false),
        }
    }

    fn capture(
        &self,
        ctx: &ApplyContext<'_>,
        capture: &CaptureSettings,
        body: &str,
    ) -> Result<(), AdapterError> {
        let missing = || {
            AdapterError::permanent(format!(
                "response from {} has no value at '{}' for secret '{}'",
                self.url, capture.pointer, capture.secret
            ))
        };
        let document: Value = serde_json::from_str(body).map_err(|_| missing())?;
        let value = match document.pointer(&capture.pointer).ok_or_else(missing)? {
            Value::String(s) => s.clone(),
            Value::Null => return Err(missing()),
            other => other.to_string(),
        };
        ctx.secrets().capture(capture.secret.as_str(), value);
        ctx.debug(&format!("captured secret '{}'", capture.secret));
        Ok(())
    }
}

impl Resource for HttpResource {
    fn id(&self) -> &str {
        &self.common.id
    }

    fn dependencies(&self) -> &[String] {
        &self.common.depends_on
    }

    fn resource_type(&self) -> &'static str {
        "http_resource"
    }

    fn describe(&self) -> String {
        format!("{} {}", self.method, self.url)
    }

    fn desired(&self) -> Attributes {
        Attributes::from([("present".to_string(), json!(true))])
    }

    fn probe(&self, ctx: &ApplyContext<'_>) -> Result<Attributes, AdapterError> {
        Ok(Attributes::from([(
            "present".to_string(),
            json!(self.present(ctx)?),
        )]))
    }

    fn apply(&self, ctx: &ApplyContext<'_>, _diff: &ResourceDiff) -> Result<(), AdapterError> {
        let mut request = self.request(&self.method, &self.url);
        if let Some(body) = &self.body {
            request.body = Some(ctx.resolve_json(body)?.to_string());
        }

        let response = ctx.http(&request)?;
        if !self.succeeded(response.status) {
            return Err(AdapterError::from_http_status(
                response.status,
                &self.url,
                &ctx.redact(&response.body),
            ));
        }
        ctx.info(&format!("{} {} -> {}", self.method, self.url, response.status));

        if let Some(capture) = &self.capture {
            self.capture(ctx, capture, &response.body)?;
        }

        self.ran.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn readiness(&self) -> Option<&ReadinessSpec> {
        self.common.ready.as_ref()
    }
}
