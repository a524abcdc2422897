//! Spawn-poll-deadline-kill process execution (§4.3, §4.7).
//!
//! [`run_command_with_timeout`] captures output wholesale once the child
//! exits or the deadline passes. [`run_command_streaming`] additionally
//! forwards each stdout line to a callback as it arrives, which is how the
//! `process` agent backend turns raw stdout into [`wreckit_types::AgentEvent`]s
//! without buffering a whole run in memory first.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command.args(args).current_dir(working_dir);

    let (exit_code, stdout, stderr, timed_out) = if let Some(timeout_dur) = timeout {
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn command '{program}'"))?;

        let deadline = Instant::now() + timeout_dur;
        loop {
            match child.try_wait().context("failed to poll command")? {
                Some(status) => {
                    let (out, err) = drain_pipes(&mut child);
                    break (status.code().unwrap_or(-1), out, err, false);
                }
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        let (out, mut err) = drain_pipes(&mut child);
                        err.push_str(&format!(
                            "\ncommand timed out after {}",
                            humantime::format_duration(timeout_dur)
                        ));
                        break (-1, out, err, true);
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    } else {
        let output = command
            .output()
            .with_context(|| format!("failed to execute command '{program}'"))?;
        (
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            false,
        )
    };

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

fn drain_pipes(child: &mut Child) -> (String, String) {
    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }
    (
        String::from_utf8_lossy(&stdout_bytes).to_string(),
        String::from_utf8_lossy(&stderr_bytes).to_string(),
    )
}

/// Like [`run_command_with_timeout`], but calls `on_stdout_line` for each
/// line of stdout as it's produced rather than only returning the full
/// buffer at the end.
pub fn run_command_streaming<F>(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Option<Duration>,
    mut on_stdout_line: F,
) -> Result<CommandOutput>
where
    F: FnMut(&str),
{
    let start = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn command '{program}'"))?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let (tx, rx) = mpsc::channel::<String>();
    let stdout_reader = std::thread::spawn(move || {
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let stderr_buf = Arc::new(Mutex::new(String::new()));
    let stderr_writer = stderr_buf.clone();
    let stderr_reader = std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines().map_while(Result::ok) {
            let mut buf = stderr_writer.lock().expect("stderr buffer poisoned");
            buf.push_str(&line);
            buf.push('\n');
        }
    });

    let deadline = timeout.map(|d| Instant::now() + d);
    let mut stdout_full = String::new();
    let mut timed_out = false;

    let exit_code = loop {
        for line in rx.try_iter() {
            stdout_full.push_str(&line);
            stdout_full.push('\n');
            on_stdout_line(&line);
        }

        match child.try_wait().context("failed to poll command")? {
            Some(status) => {
                for line in rx.try_iter() {
                    stdout_full.push_str(&line);
                    stdout_full.push('\n');
                    on_stdout_line(&line);
                }
                break status.code().unwrap_or(-1);
            }
            None => {
                if let Some(deadline) = deadline
                    && Instant::now() >= deadline
                {
                    let _ = child.kill();
                    let _ = child.wait();
                    timed_out = true;
                    break -1;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    };

    let _ = stdout_reader.join();
    let _ = stderr_reader.join();
    let mut stderr_full = stderr_buf.lock().expect("stderr buffer poisoned").clone();
    if timed_out && let Some(timeout_dur) = timeout {
        stderr_full.push_str(&format!(
            "\ncommand timed out after {}",
            humantime::format_duration(timeout_dur)
        ));
    }

    Ok(CommandOutput {
        exit_code,
        stdout: stdout_full,
        stderr: stderr_full,
        timed_out,
        duration: start.elapsed(),
    })
}
