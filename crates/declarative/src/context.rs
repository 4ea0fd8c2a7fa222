//! Apply context and callback traits
//!
//! [`ApplyContext`] is the redaction boundary: every adapter call a resource
//! makes goes through it, so placeholders are resolved only on the way out
//! and every log line is masked on the way in.

use crate::adapter::{
    CommandOutput, CommandRequest, CommandRunner, HttpAuth, HttpRequest, HttpResponse,
    HttpTransport,
};
use crate::clock::{CancellationToken, Clock};
use crate::error::{AdapterError, SecretError};
use crate::report::Outcome;
use crate::secrets::SecretBroker;

/// Progress callback for execution operations
///
/// Always invoked on the coordinating thread.
pub trait ProgressCallback: Send {
    /// Called once the plan is built
    fn on_run_start(&mut self, total: usize);

    /// Called when a resource is dispatched to a worker
    fn on_resource_start(&mut self, id: &str, description: &str);

    /// Called when a resource reaches a terminal outcome
    fn on_resource_complete(&mut self, id: &str, outcome: &Outcome);

    /// Called after the last resource settles
    fn on_run_complete(&mut self);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_run_start(&mut self, _total: usize) {}
    fn on_resource_start(&mut self, _id: &str, _description: &str) {}
    fn on_resource_complete(&mut self, _id: &str, _outcome: &Outcome) {}
    fn on_run_complete(&mut self) {}
}

/// Adapters shared by every resource in a run
#[derive(Clone, Copy)]
pub struct Adapters<'a> {
    pub commands: &'a dyn CommandRunner,
    pub http: &'a dyn HttpTransport,
    pub clock: &'a dyn Clock,
}

/// Context passed to probe and apply operations
pub struct ApplyContext<'a> {
    /// Whether this is a dry run (no actual changes)
    pub dry_run: bool,
    resource_id: &'a str,
    secrets: &'a SecretBroker,
    cancel: &'a CancellationToken,
    adapters: Adapters<'a>,
}

impl<'a> ApplyContext<'a> {
    pub fn new(
        resource_id: &'a str,
        dry_run: bool,
        secrets: &'a SecretBroker,
        cancel: &'a CancellationToken,
        adapters: Adapters<'a>,
    ) -> Self {
        Self {
            dry_run,
            resource_id,
            secrets,
            cancel,
            adapters,
        }
    }

    /// Identifier of the resource this context serves
    pub fn resource_id(&self) -> &str {
        self.resource_id
    }

    pub fn secrets(&self) -> &SecretBroker {
        self.secrets
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.cancel
    }

    pub fn clock(&self) -> &dyn Clock {
        self.adapters.clock
    }

    pub fn adapters(&self) -> Adapters<'a> {
        self.adapters
    }

    /// Mask secret values in text bound for output
    pub fn redact(&self, text: &str) -> String {
        self.secrets.redact(text)
    }

    /// Resolve placeholders for an adapter call
    pub fn resolve(&self, text: &str) -> Result<String, AdapterError> {
        self.secrets.resolve(text).map_err(secret_to_adapter)
    }

    /// Resolve placeholders inside every string of a JSON document
    pub fn resolve_json(&self, value: &serde_json::Value) -> Result<serde_json::Value, AdapterError> {
        self.secrets.resolve_value(value).map_err(secret_to_adapter)
    }

    /// Log at info level with secrets masked
    pub fn info(&self, message: &str) {
        log::info!("[{}] {}", self.resource_id, self.redact(message));
    }

    /// Log at debug level with secrets masked
    pub fn debug(&self, message: &str) {
        log::debug!("[{}] {}", self.resource_id, self.redact(message));
    }

    /// Run a command, resolving placeholders in program, args and env.
    ///
    /// A non-zero exit is returned as output, not as an error.
    pub fn exec(&self, request: &CommandRequest) -> Result<CommandOutput, AdapterError> {
        if self.cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }

        let resolved = CommandRequest {
            program: self.resolve(&request.program)?,
            args: request
                .args
                .iter()
                .map(|a| self.resolve(a))
                .collect::<Result<_, _>>()?,
            cwd: request.cwd.clone(),
            env: request
                .env
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve(v)?)))
                .collect::<Result<_, AdapterError>>()?,
        };

        self.debug(&format!("exec: {}", resolved.command_line()));

        self.adapters
            .commands
            .run(&resolved)
            .map_err(|e| self.redact_error(e))
    }

    /// Run a command and fail on non-zero exit, classifying the failure.
    pub fn exec_checked(&self, request: &CommandRequest) -> Result<CommandOutput, AdapterError> {
        let output = self.exec(request)?;
        if output.success {
            Ok(output)
        } else {
            Err(AdapterError::from_command_failure(
                &request.program,
                output.code,
                &self.redact(&output.stderr_str()),
            ))
        }
    }

    /// Send an HTTP request, resolving placeholders in url, headers and auth.
    ///
    /// The body is sent as given: only the caller knows its encoding, so it
    /// resolves placeholders itself (see [`Self::resolve_json`]). Every
    /// status code comes back as a response.
    pub fn http(&self, request: &HttpRequest) -> Result<HttpResponse, AdapterError> {
        if self.cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }

        let resolved = HttpRequest {
            method: request.method.clone(),
            url: self.resolve(&request.url)?,
            headers: request
                .headers
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve(v)?)))
                .collect::<Result<_, AdapterError>>()?,
            body: request.body.clone(),
            auth: match &request.auth {
                Some(HttpAuth::Basic { user, password }) => Some(HttpAuth::Basic {
                    user: self.resolve(user)?,
                    password: self.resolve(password)?,
                }),
                Some(HttpAuth::Bearer(token)) => Some(HttpAuth::Bearer(self.resolve(token)?)),
                None => None,
            },
        };

        self.debug(&format!("http: {} {}", resolved.method, resolved.url));

        let response = self
            .adapters
            .http
            .send(&resolved)
            .map_err(|e| self.redact_error(e))?;

        self.debug(&format!("http: {} -> {}", resolved.url, response.status));
        Ok(response)
    }

    /// Mask secret values inside an adapter error message
    pub fn redact_error(&self, error: AdapterError) -> AdapterError {
        match error {
            AdapterError::Transient { message } => AdapterError::Transient {
                message: self.redact(&message),
            },
            AdapterError::Permanent { message } => AdapterError::Permanent {
                message: self.redact(&message),
            },
            AdapterError::Cancelled => AdapterError::Cancelled,
        }
    }
}

fn secret_to_adapter(error: SecretError) -> AdapterError {
    AdapterError::permanent(error.to_string())
}
