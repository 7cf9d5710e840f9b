//! Host command execution
//!
//! Every child is spawned in its own process group and registered with the
//! global [`ChildRegistry`], so a signal to archstage tears down an in-flight
//! `sgdisk` or `pacstrap` instead of orphaning it.
//!
//! Output is logged line by line as the child writes it, so a long
//! `pacstrap` shows up in the install log while it runs.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use super::{CommandOutput, CommandRunner};
use crate::process_guard::{ChildRegistry, CommandProcessGroup};

/// [`CommandRunner`] backed by `std::process::Command`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

/// Log each line of `pipe` under the `command` target and return everything read.
///
/// The reader thread logs through the caller's subscriber.
fn stream_lines<R>(pipe: R, prefix: &'static str) -> JoinHandle<String>
where
    R: Read + Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|d| d.clone());
    thread::spawn(move || {
        tracing::dispatcher::with_default(&dispatch, || {
            let mut reader = BufReader::new(pipe);
            let mut captured = String::new();
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let chunk = String::from_utf8_lossy(&buf);
                        info!(target: "command", "{}{}", prefix, chunk.trim_end_matches(['\n', '\r']));
                        captured.push_str(&chunk);
                    }
                    Err(e) => {
                        warn!(target: "command", "{}read error: {}", prefix, e);
                        break;
                    }
                }
            }
            captured
        })
    })
}

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    fn spawn_and_wait(&self, program: &str, args: &[&str], stdin: Option<&str>) -> CommandOutput {
        info!(target: "command", "run: {} {}", program, args.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(target: "command", "failed to spawn {}: {}", program, e);
                return CommandOutput {
                    exit_code: None,
                    output: String::new(),
                    error: format!("failed to spawn {}: {}", program, e),
                };
            }
        };
        let pid = child.id();
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }

        // Readers start before stdin is written so a chatty child never
        // blocks on a full pipe.
        let stdout = child.stdout.take().map(|pipe| stream_lines(pipe, ""));
        let stderr = child.stderr.take().map(|pipe| stream_lines(pipe, "stderr: "));

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            if let Err(e) = pipe.write_all(input.as_bytes()) {
                warn!(target: "command", "failed to write stdin of {}: {}", program, e);
            }
            // Dropping the pipe closes stdin so the child sees EOF.
        }

        let status = child.wait();

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(pid);
        }

        let collect = |handle: Option<JoinHandle<String>>| {
            handle
                .map(|h| h.join().unwrap_or_default())
                .unwrap_or_default()
        };
        let stdout = collect(stdout);
        let stderr = collect(stderr);

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return CommandOutput {
                    exit_code: None,
                    output: stdout,
                    error: format!("failed waiting for {}: {}", program, e),
                };
            }
        };

        let exit_code = status.code();
        if !status.success() {
            info!(
                target: "command",
                "{} exited with code {}",
                program,
                exit_code.unwrap_or(-1)
            );
        }

        CommandOutput {
            exit_code,
            output: stdout,
            error: stderr,
        }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> CommandOutput {
        self.spawn_and_wait(program, args, None)
    }

    fn run_with_stdin(&self, program: &str, args: &[&str], stdin: &str) -> CommandOutput {
        self.spawn_and_wait(program, args, Some(stdin))
    }
}
