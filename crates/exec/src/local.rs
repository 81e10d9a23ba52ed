//! Local script runner mirroring the remote execution discipline.
//!
//! Scripts run through the same assembler and supervisor as remote ones;
//! the differences are the process transport (`/bin/bash -eu -` spawned
//! directly) and the control markers (`ADDRESS`/`FATAL`/`ERROR` instead of
//! `REBOOT`).

use std::io::{self, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, LazyLock};
use std::thread;

use crossbeam_channel::bounded;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use regex::bytes::Regex;
use tracing::{debug, warn};

use spread_core::output::{excerpt, trim_space};
use spread_core::{Environment, FatalError, SafeBuffer, TimeoutSetting, Timeouts};

use crate::error::Error;
use crate::script::{assemble_local, OutputMode};
use crate::supervisor::{supervise, Outcome};

/// Exit status reserved for in-band control markers.
const MARKER_STATUS: i32 = 213;

static COMMAND_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<([A-Z_]+)(?: (.*))?>$").expect("static marker expression"));

/// Runs `script` through a locally spawned `/bin/bash -eu -` under the
/// warn/kill timeout discipline.
///
/// Returns the captured `(stdout, stderr)` pair; combined and trace modes
/// fold stderr into stdout and leave the second element empty. A last-line
/// `<ERROR …>` marker with exit status 213 becomes [`Error::Task`], a
/// `<FATAL …>` marker becomes [`Error::Fatal`]. Shell mode is rejected.
pub fn run_script(
    mode: OutputMode,
    script: &str,
    dir: &str,
    env: &Environment,
    warn_timeout: TimeoutSetting,
    kill_timeout: TimeoutSetting,
) -> Result<(Vec<u8>, Vec<u8>), Error> {
    if mode == OutputMode::Shell {
        return Err(Error::ShellMode);
    }
    let assembled = assemble_local(script, env, mode);
    if assembled.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    debug!(
        "Running local script:\n-----\n{}\n-----",
        String::from_utf8_lossy(&assembled)
    );

    let mut command = Command::new("/bin/bash");
    command
        .arg("-eu")
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if !dir.is_empty() {
        command.current_dir(dir);
    }
    let mut child = command.spawn().map_err(Error::StartCommand)?;
    let pid = Pid::from_raw(child.id() as i32);

    let Some(mut stdin) = child.stdin.take() else {
        return Err(Error::StartCommand(io::Error::other("stdin not piped")));
    };
    let Some(mut stdout_pipe) = child.stdout.take() else {
        return Err(Error::StartCommand(io::Error::other("stdout not piped")));
    };
    let Some(mut stderr_pipe) = child.stderr.take() else {
        return Err(Error::StartCommand(io::Error::other("stderr not piped")));
    };

    let outbuf = Arc::new(SafeBuffer::new());
    let errbuf = Arc::new(SafeBuffer::new());

    let (werr_tx, werr_rx) = bounded::<io::Result<()>>(2);
    let _writer = thread::spawn(move || {
        if let Err(err) = stdin.write_all(&assembled) {
            let _ = werr_tx.send(Err(err));
        }
        let _ = werr_tx.send(stdin.flush());
        // Dropping stdin closes the pipe and signals end-of-script.
    });

    let out_sink = Arc::clone(&outbuf);
    let out_reader = thread::spawn(move || {
        let _ = io::copy(&mut stdout_pipe, &mut &*out_sink);
    });
    let err_sink = match mode {
        OutputMode::Split => Arc::clone(&errbuf),
        _ => Arc::clone(&outbuf),
    };
    let err_reader = thread::spawn(move || {
        let _ = io::copy(&mut stderr_pipe, &mut &*err_sink);
    });

    // The waiter joins the readers so a completion signal implies the
    // captured output is whole.
    let (done_tx, done_rx) = bounded::<io::Result<ExitStatus>>(1);
    let _waiter = thread::spawn(move || {
        let status = child.wait();
        let _ = out_reader.join();
        let _ = err_reader.join();
        let _ = done_tx.send(status);
    });

    let timeouts = Timeouts::new(warn_timeout, kill_timeout);
    let outcome = supervise(
        &done_rx,
        || {
            let _ = kill(pid, Signal::SIGKILL);
        },
        Some(&outbuf),
        Some(&errbuf),
        timeouts,
        &"local script",
    );

    let (status, mut error) = match outcome {
        Outcome::Finished(Ok(status)) => (Some(status), None),
        Outcome::Finished(Err(err)) => (None, Some(Error::Wait(err))),
        Outcome::KillTimeout => (None, Some(Error::KillTimeout)),
        Outcome::Lost => (None, Some(Error::Monitor)),
    };

    if !outbuf.is_empty() {
        debug!(
            "Output from running local script:\n-----\n{}\n-----",
            String::from_utf8_lossy(&outbuf.bytes())
        );
    }
    if !errbuf.is_empty() {
        debug!(
            "Error output from running local script:\n-----\n{}\n-----",
            String::from_utf8_lossy(&errbuf.bytes())
        );
    }

    if let Some(status) = status {
        if status.code() == Some(MARKER_STATUS) {
            if let Some((name, message)) = command_marker(&outbuf.bytes()) {
                match name.as_str() {
                    "ERROR" => return Err(Error::Task(message)),
                    "FATAL" => return Err(FatalError(message).into()),
                    _ => {}
                }
            }
        }
        if !status.success() {
            error = Some(Error::ExitStatus(status.code().unwrap_or(1)));
        }
    }

    if let Some(error) = error {
        let decorated = excerpt(&errbuf.bytes()).or_else(|| excerpt(&outbuf.bytes()));
        return Err(match decorated {
            Some(text) => Error::Output(text),
            None => error,
        });
    }

    // Script delivery errors do not fail the run; the exit status is the
    // authoritative signal.
    if let Ok(Err(err)) = werr_rx.recv() {
        warn!("cannot write script to local bash: {err}");
    }

    Ok((outbuf.bytes(), errbuf.bytes()))
}

/// Parses the `<NAME …>` control marker off the last line of `stdout`.
fn command_marker(stdout: &[u8]) -> Option<(String, String)> {
    let trimmed = trim_space(stdout);
    let last = trimmed.rsplit(|&b| b == b'\n').next()?;
    let captures = COMMAND_MARKER.captures(last)?;
    let name = String::from_utf8_lossy(captures.get(1)?.as_bytes()).into_owned();
    let message = captures
        .get(2)
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
        .unwrap_or_default();
    Some((name, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn no_env() -> Environment {
        Environment::new()
    }

    fn fast(ms: u64) -> TimeoutSetting {
        TimeoutSetting::After(Duration::from_millis(ms))
    }

    #[test]
    fn empty_scripts_are_a_no_op() {
        let (out, err) = run_script(
            OutputMode::Combined,
            "   ",
            "",
            &no_env(),
            TimeoutSetting::Default,
            TimeoutSetting::Default,
        )
        .expect("no-op run");
        assert!(out.is_empty());
        assert!(err.is_empty());
    }

    #[test]
    fn combined_mode_captures_stdout() {
        let (out, err) = run_script(
            OutputMode::Combined,
            "echo hello",
            "",
            &no_env(),
            TimeoutSetting::Default,
            TimeoutSetting::Default,
        )
        .expect("script runs");
        assert_eq!(trim_space(&out), b"hello");
        assert!(err.is_empty());
    }

    #[test]
    fn combined_mode_folds_stderr_into_stdout() {
        let (out, err) = run_script(
            OutputMode::Combined,
            "echo oops >&2",
            "",
            &no_env(),
            TimeoutSetting::Default,
            TimeoutSetting::Default,
        )
        .expect("script runs");
        assert_eq!(trim_space(&out), b"oops");
        assert!(err.is_empty());
    }

    #[test]
    fn split_mode_separates_the_streams() {
        let (out, err) = run_script(
            OutputMode::Split,
            "echo out\necho err >&2",
            "",
            &no_env(),
            TimeoutSetting::Default,
            TimeoutSetting::Default,
        )
        .expect("script runs");
        assert_eq!(trim_space(&out), b"out");
        assert_eq!(trim_space(&err), b"err");
    }

    #[test]
    fn working_directory_is_honoured() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().canonicalize().expect("canonical path");
        let (out, _) = run_script(
            OutputMode::Combined,
            "pwd",
            path.to_str().expect("utf-8 path"),
            &no_env(),
            TimeoutSetting::Default,
            TimeoutSetting::Default,
        )
        .expect("script runs");
        assert_eq!(trim_space(&out), path.as_os_str().as_encoded_bytes());
    }

    #[test]
    fn environment_reaches_the_script() {
        let env: Environment = [("GREETING", "y z")].into_iter().collect();
        let (out, _) = run_script(
            OutputMode::Combined,
            "echo \"$GREETING\"",
            "",
            &env,
            TimeoutSetting::Default,
            TimeoutSetting::Default,
        )
        .expect("script runs");
        assert_eq!(trim_space(&out), b"y z");
    }

    #[test]
    fn fatal_marker_aborts_with_a_fatal_error() {
        let err = run_script(
            OutputMode::Combined,
            "FATAL oops",
            "",
            &no_env(),
            TimeoutSetting::Default,
            TimeoutSetting::Default,
        )
        .expect_err("fatal marker fails the run");
        assert!(err.is_fatal());
        match err {
            Error::Fatal(FatalError(message)) => assert_eq!(message, "oops"),
            other => panic!("expected a fatal error, got {other:?}"),
        }
    }

    #[test]
    fn error_marker_becomes_a_task_error() {
        let err = run_script(
            OutputMode::Combined,
            "ERROR broken setup",
            "",
            &no_env(),
            TimeoutSetting::Default,
            TimeoutSetting::Default,
        )
        .expect_err("error marker fails the run");
        match err {
            Error::Task(message) => assert_eq!(message, "broken setup"),
            other => panic!("expected a task error, got {other:?}"),
        }
    }

    #[test]
    fn address_marker_does_not_fail_the_script() {
        let (out, _) = run_script(
            OutputMode::Combined,
            "ADDRESS 10.0.0.7\necho done",
            "",
            &no_env(),
            TimeoutSetting::Default,
            TimeoutSetting::Default,
        )
        .expect("address is informational");
        assert!(out.starts_with(b"<ADDRESS 10.0.0.7>"));
    }

    #[test]
    fn failures_carry_the_output_excerpt() {
        let err = run_script(
            OutputMode::Combined,
            "echo bad\nexit 7",
            "",
            &no_env(),
            TimeoutSetting::Default,
            TimeoutSetting::Default,
        )
        .expect_err("non-zero exit fails");
        match err {
            Error::Output(text) => assert_eq!(text, "bad"),
            other => panic!("expected an output excerpt, got {other:?}"),
        }
    }

    #[test]
    fn kill_timeout_interrupts_a_stuck_script() {
        let started = Instant::now();
        let err = run_script(
            OutputMode::Combined,
            "echo ready\nsleep 10",
            "",
            &no_env(),
            fast(50),
            fast(150),
        )
        .expect_err("kill deadline fires");
        assert!(started.elapsed() < Duration::from_secs(5));
        let text = err.to_string();
        assert!(
            text.contains("kill-timeout reached"),
            "unexpected error: {text}"
        );
    }

    #[test]
    fn shell_mode_is_rejected() {
        let err = run_script(
            OutputMode::Shell,
            "true",
            "",
            &no_env(),
            TimeoutSetting::Default,
            TimeoutSetting::Default,
        )
        .expect_err("shell mode is remote-only");
        assert!(matches!(err, Error::ShellMode));
    }

    #[test]
    fn command_marker_parses_name_and_message() {
        assert_eq!(
            command_marker(b"noise\n<ERROR something broke>\n"),
            Some(("ERROR".to_string(), "something broke".to_string()))
        );
        assert_eq!(
            command_marker(b"<FATAL>"),
            Some(("FATAL".to_string(), String::new()))
        );
        assert_eq!(command_marker(b"<ERROR mid> trailing"), None);
        assert_eq!(command_marker(b"no markers here"), None);
    }
}
