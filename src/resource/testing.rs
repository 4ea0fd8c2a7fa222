//! Fakes for driving resource kinds without docker, systemctl or a network

use declarative::{
    AdapterError, Adapters, CancellationToken, CommandOutput, CommandRequest, CommandRunner,
    ExecuteOptions, Executor, HttpRequest, HttpResponse, HttpTransport, ManualClock, NoHttp,
    Resource, ResourceReport, RetryConfig, SecretBroker,
};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Runner that refuses every command
pub struct NoCommands;

impl CommandRunner for NoCommands {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, AdapterError> {
        Err(AdapterError::permanent(format!(
            "unexpected command {}",
            request.command_line()
        )))
    }
}

/// Replies queued per prefix; the last reply for a prefix repeats
struct Script<T> {
    rules: Vec<(String, VecDeque<T>)>,
}

impl<T: Clone> Script<T> {
    fn new() -> Self {
        Self { rules: Vec::new() }
    }

    fn push(&mut self, prefix: &str, reply: T) {
        match self.rules.iter_mut().find(|(p, _)| p == prefix) {
            Some((_, replies)) => replies.push_back(reply),
            None => self.rules.push((prefix.to_string(), VecDeque::from([reply]))),
        }
    }

    fn next(&mut self, line: &str) -> Option<T> {
        let (_, replies) = self
            .rules
            .iter_mut()
            .filter(|(p, _)| line.starts_with(p.as_str()))
            .max_by_key(|(p, _)| p.len())?;
        if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        }
    }
}

/// Records every command; unscripted commands succeed with empty output
pub struct FakeRunner {
    script: Mutex<Script<CommandOutput>>,
    calls: Mutex<Vec<CommandRequest>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply for command lines starting with `prefix`
    pub fn on(self, prefix: &str, output: CommandOutput) -> Self {
        self.script.lock().unwrap().push(prefix, output);
        self
    }

    /// Command lines run so far
    pub fn lines(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(CommandRequest::command_line)
            .collect()
    }

    pub fn calls(&self) -> Vec<CommandRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Command lines run so far that start with `prefix`
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|l| l.starts_with(prefix))
            .collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, AdapterError> {
        let line = request.command_line();
        self.calls.lock().unwrap().push(request.clone());
        Ok(self
            .script
            .lock()
            .unwrap()
            .next(&line)
            .unwrap_or_else(|| CommandOutput::ok("")))
    }
}

/// Records every request; replies are keyed by `"METHOD url"` prefixes
pub struct FakeHttp {
    script: Mutex<Script<Result<HttpResponse, AdapterError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeHttp {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn on(self, prefix: &str, status: u16, body: &str) -> Self {
        let response = HttpResponse {
            status,
            body: body.to_string(),
        };
        self.script.lock().unwrap().push(prefix, Ok(response));
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HttpTransport for FakeHttp {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, AdapterError> {
        let line = format!("{} {}", request.method, request.url);
        self.requests.lock().unwrap().push(request.clone());
        self.script
            .lock()
            .unwrap()
            .next(&line)
            .unwrap_or_else(|| Err(AdapterError::permanent(format!("unexpected request {line}"))))
    }
}

/// Runs single resources through the real executor on a manual clock
pub struct Harness<'a> {
    commands: &'a dyn CommandRunner,
    http: &'a dyn HttpTransport,
    secrets: &'a SecretBroker,
    clock: ManualClock,
    cancel: CancellationToken,
    dry_run: bool,
    retry: RetryConfig,
}

impl<'a> Harness<'a> {
    pub fn new(commands: &'a dyn CommandRunner, secrets: &'a SecretBroker) -> Self {
        Self {
            commands,
            http: &NoHttp,
            secrets,
            clock: ManualClock::new(),
            cancel: CancellationToken::new(),
            dry_run: false,
            retry: RetryConfig::no_retry(),
        }
    }

    pub fn with_http(mut self, http: &'a dyn HttpTransport) -> Self {
        self.http = http;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn execute<R: Resource>(&self, resource: &R) -> ResourceReport {
        let adapters = Adapters {
            commands: self.commands,
            http: self.http,
            clock: &self.clock,
        };
        let options = ExecuteOptions {
            dry_run: self.dry_run,
            retry: self.retry.clone(),
            ..ExecuteOptions::default()
        };
        Executor::new(adapters, self.secrets, &self.cancel, options).execute(resource)
    }
}
