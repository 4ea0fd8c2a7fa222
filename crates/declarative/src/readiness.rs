//! Readiness polling
//!
//! One wait-until-healthy primitive, [`Poller::await_ready`], parameterized
//! by a probe closure. [`ReadinessSpec`] supplies the built-in probes (TCP
//! connect, HTTP status, command exit) declared under a resource's `ready`
//! key.

use crate::adapter::{CommandLine, HttpRequest};
use crate::clock::{CancellationToken, Clock};
use crate::context::ApplyContext;
use crate::error::{ReadinessError, ValidationError};
use serde::{Deserialize, Serialize};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Shortest interval between probes, so a zero interval still lets time pass
const MIN_INTERVAL: Duration = Duration::from_millis(10);

const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of a single readiness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    Ready,
    /// Not ready yet, with the reason
    NotReady(String),
}

impl From<bool> for ProbeStatus {
    fn from(ready: bool) -> Self {
        if ready {
            Self::Ready
        } else {
            Self::NotReady("probe returned false".to_string())
        }
    }
}

/// Polls a probe at a fixed interval until it succeeds or time runs out
pub struct Poller<'a> {
    clock: &'a dyn Clock,
    cancel: &'a CancellationToken,
}

impl<'a> Poller<'a> {
    pub fn new(clock: &'a dyn Clock, cancel: &'a CancellationToken) -> Self {
        Self { clock, cancel }
    }

    /// Invoke `probe` every `interval` until it reports ready.
    ///
    /// Gives up with [`ReadinessError::Timeout`] once another interval would
    /// reach `timeout`, carrying the last failure reason. Returns
    /// [`ReadinessError::Cancelled`] as soon as the run is cancelled.
    pub fn await_ready<F, S>(
        &self,
        mut probe: F,
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), ReadinessError>
    where
        F: FnMut() -> S,
        S: Into<ProbeStatus>,
    {
        let interval = interval.max(MIN_INTERVAL);
        let start = self.clock.now();
        let mut attempts = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ReadinessError::Cancelled);
            }

            attempts += 1;
            let reason = match probe().into() {
                ProbeStatus::Ready => {
                    log::debug!("ready after {attempts} attempt(s)");
                    return Ok(());
                }
                ProbeStatus::NotReady(reason) => reason,
            };

            let elapsed = self.clock.now().saturating_duration_since(start);
            if elapsed.saturating_add(interval) >= timeout {
                return Err(ReadinessError::Timeout {
                    attempts,
                    elapsed,
                    last_failure: reason,
                });
            }

            log::trace!("not ready (attempt {attempts}): {reason}");
            if !self.cancel.sleep(self.clock, interval) {
                return Err(ReadinessError::Cancelled);
            }
        }
    }
}

/// The condition a resource must meet before dependents may start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessCheck {
    /// A TCP connection to `host:port` succeeds
    Tcp { address: String },
    /// GET returns one of the expected statuses
    Http { url: String, expect_status: Vec<u16> },
    /// The command exits zero
    Command { command: CommandLine },
}

/// A declared readiness gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessSpec {
    pub check: ReadinessCheck,
    /// Falls back to the run's default timeout when unset
    pub timeout: Option<Duration>,
    pub interval: Duration,
}

/// `ready` block as written in configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawReadiness {
    tcp: Option<String>,
    http: Option<String>,
    command: Option<CommandLine>,
    expect_status: Option<Vec<u16>>,
    timeout_secs: Option<u64>,
    interval_secs: Option<u64>,
}

impl ReadinessSpec {
    pub fn new(check: ReadinessCheck) -> Self {
        Self {
            check,
            timeout: None,
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Parse a resource's `ready` value
    pub fn from_value(id: &str, value: &serde_json::Value) -> Result<Self, ValidationError> {
        let invalid = |message: String| ValidationError::InvalidValue {
            id: id.to_string(),
            field: "ready".to_string(),
            message,
        };

        let raw: RawReadiness =
            serde_json::from_value(value.clone()).map_err(|e| invalid(e.to_string()))?;

        let check = match (raw.tcp, raw.http, raw.command) {
            (Some(address), None, None) => ReadinessCheck::Tcp { address },
            (None, Some(url), None) => ReadinessCheck::Http {
                url,
                expect_status: raw.expect_status.unwrap_or_else(|| vec![200, 302]),
            },
            (None, None, Some(command)) if !command.is_empty() => {
                ReadinessCheck::Command { command }
            }
            (None, None, Some(_)) => return Err(invalid("command is empty".to_string())),
            _ => {
                return Err(invalid(
                    "exactly one of 'tcp', 'http' or 'command' is required".to_string(),
                ));
            }
        };

        Ok(Self {
            check,
            timeout: raw.timeout_secs.map(Duration::from_secs),
            interval: raw
                .interval_secs
                .map_or(DEFAULT_INTERVAL, Duration::from_secs),
        })
    }

    /// Human-readable description of the check
    pub fn describe(&self) -> String {
        match &self.check {
            ReadinessCheck::Tcp { address } => format!("tcp {address}"),
            ReadinessCheck::Http { url, .. } => format!("http {url}"),
            ReadinessCheck::Command { command } => {
                format!("command {}", command.to_request().command_line())
            }
        }
    }

    /// Run the check once
    pub fn probe(&self, ctx: &ApplyContext<'_>) -> ProbeStatus {
        match &self.check {
            ReadinessCheck::Tcp { address } => match ctx.resolve(address) {
                Ok(address) => probe_tcp(&address),
                Err(e) => ProbeStatus::NotReady(e.to_string()),
            },
            ReadinessCheck::Http { url, expect_status } => {
                match ctx.http(&HttpRequest::get(url.clone())) {
                    Ok(response) if expect_status.contains(&response.status) => ProbeStatus::Ready,
                    Ok(response) => ProbeStatus::NotReady(format!("HTTP {}", response.status)),
                    Err(e) => ProbeStatus::NotReady(e.to_string()),
                }
            }
            ReadinessCheck::Command { command } => match ctx.exec(&command.to_request()) {
                Ok(output) if output.success => ProbeStatus::Ready,
                Ok(output) => ProbeStatus::NotReady(format!(
                    "exit {}: {}",
                    output.code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                    output.stderr_str().trim()
                )),
                Err(e) => ProbeStatus::NotReady(e.to_string()),
            },
        }
    }

    /// Poll until ready, using `default_timeout` when none is declared
    pub fn wait(
        &self,
        ctx: &ApplyContext<'_>,
        default_timeout: Duration,
    ) -> Result<(), ReadinessError> {
        ctx.info(&format!("waiting for {}", self.describe()));
        let poller = Poller::new(ctx.clock(), ctx.cancellation());
        poller
            .await_ready(
                || match self.probe(ctx) {
                    ProbeStatus::NotReady(reason) => ProbeStatus::NotReady(ctx.redact(&reason)),
                    ready => ready,
                },
                self.timeout.unwrap_or(default_timeout),
                self.interval,
            )
    }
}

fn probe_tcp(address: &str) -> ProbeStatus {
    let addrs = match address.to_socket_addrs() {
        Ok(addrs) => addrs.collect::<Vec<_>>(),
        Err(e) => return ProbeStatus::NotReady(format!("cannot resolve {address}: {e}")),
    };

    let mut last = format!("no addresses for {address}");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, TCP_CONNECT_TIMEOUT) {
            Ok(_) => return ProbeStatus::Ready,
            Err(e) => last = format!("connect {addr}: {e}"),
        }
    }
    ProbeStatus::NotReady(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{CommandOutput, CommandRequest, CommandRunner, NoHttp};
    use crate::clock::ManualClock;
    use crate::context::Adapters;
    use crate::error::AdapterError;
    use crate::secrets::SecretBroker;
    use serde_json::json;
    use std::cell::Cell;

    #[test]
    fn test_ready_on_third_probe() {
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        let calls = Cell::new(0);

        let result = Poller::new(&clock, &cancel).await_ready(
            || {
                calls.set(calls.get() + 1);
                calls.get() > 2
            },
            Duration::from_secs(10),
            Duration::from_secs(1),
        );

        assert_eq!(result, Ok(()));
        assert_eq!(calls.get(), 3);
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_timeout_when_never_ready() {
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        let calls = Cell::new(0);

        let result = Poller::new(&clock, &cancel).await_ready(
            || {
                calls.set(calls.get() + 1);
                ProbeStatus::NotReady(format!("connection refused ({})", calls.get()))
            },
            Duration::from_secs(5),
            Duration::from_secs(1),
        );

        assert_eq!(
            result,
            Err(ReadinessError::Timeout {
                attempts: 5,
                elapsed: Duration::from_secs(4),
                last_failure: "connection refused (5)".into(),
            })
        );
        assert!(clock.elapsed() <= Duration::from_secs(5));
    }

    #[test]
    fn test_interval_beyond_timeout_gives_up_without_sleeping() {
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();

        let result = Poller::new(&clock, &cancel).await_ready(
            || false,
            Duration::from_secs(5),
            Duration::from_secs(u64::MAX),
        );

        assert!(matches!(
            result,
            Err(ReadinessError::Timeout { attempts: 1, .. })
        ));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_cancelled_while_waiting() {
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();

        let result = Poller::new(&clock, &cancel).await_ready(
            || {
                cancel.cancel();
                false
            },
            Duration::from_secs(60),
            Duration::from_secs(1),
        );

        assert_eq!(result, Err(ReadinessError::Cancelled));
    }

    #[test]
    fn test_parse_http_defaults() {
        let spec = ReadinessSpec::from_value("chat", &json!({ "http": "http://localhost:3000" })).unwrap();
        assert_eq!(
            spec.check,
            ReadinessCheck::Http {
                url: "http://localhost:3000".into(),
                expect_status: vec![200, 302],
            }
        );
        assert_eq!(spec.timeout, None);
        assert_eq!(spec.interval, DEFAULT_INTERVAL);
    }

    #[test]
    fn test_parse_rejects_ambiguous_check() {
        let err = ReadinessSpec::from_value(
            "db",
            &json!({ "tcp": "127.0.0.1:5432", "http": "http://localhost" }),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { field, .. } if field == "ready"));

        assert!(ReadinessSpec::from_value("db", &json!({ "tcp": "x:1", "retries": 3 })).is_err());
    }

    #[test]
    fn test_tcp_probe_against_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        assert_eq!(probe_tcp(&address), ProbeStatus::Ready);

        drop(listener);
        assert!(matches!(probe_tcp("not a socket address"), ProbeStatus::NotReady(_)));
    }

    struct Health {
        calls: std::sync::Mutex<u32>,
    }

    impl CommandRunner for Health {
        fn run(&self, _request: &CommandRequest) -> Result<CommandOutput, AdapterError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls < 3 {
                Ok(CommandOutput::failed(2, "password s3cret rejected"))
            } else {
                Ok(CommandOutput::ok(""))
            }
        }
    }

    #[test]
    fn test_command_check_waits_with_context() {
        let runner = Health {
            calls: std::sync::Mutex::new(0),
        };
        let clock = ManualClock::new();
        let secrets = SecretBroker::from_values([("pw", "s3cret")]);
        let cancel = CancellationToken::new();
        let ctx = ApplyContext::new(
            "db",
            false,
            &secrets,
            &cancel,
            Adapters {
                commands: &runner,
                http: &NoHttp,
                clock: &clock,
            },
        );

        let spec = ReadinessSpec::from_value(
            "db",
            &json!({ "command": ["pg_isready"], "interval_secs": 1, "timeout_secs": 30 }),
        )
        .unwrap();
        assert_eq!(spec.wait(&ctx, Duration::from_secs(60)), Ok(()));
        assert_eq!(*runner.calls.lock().unwrap(), 3);

        let never = ReadinessSpec::from_value(
            "db",
            &json!({ "command": "false", "interval_secs": 1, "timeout_secs": 2 }),
        )
        .unwrap();
        *runner.calls.lock().unwrap() = 0;
        match never.wait(&ctx, Duration::from_secs(60)) {
            Err(ReadinessError::Timeout { last_failure, .. }) => {
                assert!(!last_failure.contains("s3cret"));
                assert!(last_failure.contains("********"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
