//! Local process execution

use declarative::{AdapterError, CommandOutput, CommandRequest, CommandRunner};
use std::io;
use std::process::{Command, Stdio};

/// Runs commands on the local host with `std::process`
///
/// Stdin is closed so a command waiting for input fails instead of hanging.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, AdapterError> {
        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .envs(&request.env)
            .stdin(Stdio::null());
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }

        command
            .output()
            .map(CommandOutput::from)
            .map_err(|e| spawn_error(&request.program, &e))
    }
}

/// A missing or non-executable program will not appear by retrying
fn spawn_error(program: &str, error: &io::Error) -> AdapterError {
    let message = format!("failed to execute {program}: {error}");
    match error.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            AdapterError::permanent(message)
        }
        _ => AdapterError::transient(message),
    }
}
