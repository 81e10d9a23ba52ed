//! Four-mode remote execution with the reboot protocol.
//!
//! Every call opens a fresh channel on the cached transport. A session pump
//! thread interleaves stdin delivery with output capture over the
//! non-blocking channel, reporting completion on a `done` channel; the
//! calling thread runs the shared supervisor over it. When a script exits
//! with status 213 and a trailing `<REBOOT …>` marker, the outer loop
//! reboots the target, re-dials, and re-enters with the round-tripped key.

use std::io::{self, Read, Write};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{after, bounded, Receiver, Sender, TryRecvError};
use regex::bytes::Regex;
use ssh2::{Channel, DisconnectCode, Session};
use tracing::{debug, info};

use spread_core::output::{excerpt, trim_space};
use spread_core::{Environment, SafeBuffer};
use spread_exec::script::assemble_remote;
use spread_exec::supervisor::{supervise, Outcome};
use spread_exec::OutputMode;

use crate::client::Client;
use crate::error::Error;

/// Attempt ceiling for in-script reboot requests.
const MAX_REBOOTS: u32 = 10;

/// Exit status reserved for in-band control markers.
const MARKER_STATUS: i32 = 213;

/// Benign noise printed when login profiles run without a tty.
const TTY_NOISE: &[u8] = b"mesg: ttyname failed: Inappropriate ioctl for device";

/// Pause between pump rounds when no byte moved in either direction.
pub(crate) const PUMP_IDLE: Duration = Duration::from_millis(10);

const CHUNK: usize = 8192;

/// LIBSSH2_ERROR_EAGAIN: the non-blocking call would have blocked.
const ERR_EAGAIN: i32 = -37;

static REBOOT_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<REBOOT(?: (.*))?>$").expect("static marker expression"));

impl Client {
    /// Runs `script` on the target, discarding output on success.
    pub fn run(
        &mut self,
        script: &str,
        dir: &str,
        env: Option<&Environment>,
    ) -> Result<(), Error> {
        self.run_mode(script, dir, env, OutputMode::Combined)
            .map(drop)
    }

    /// Runs `script` and returns its stdout; failures carry stderr instead.
    pub fn output(
        &mut self,
        script: &str,
        dir: &str,
        env: Option<&Environment>,
    ) -> Result<Vec<u8>, Error> {
        self.run_mode(script, dir, env, OutputMode::Split)
    }

    /// Runs `script` and returns its combined stdout and stderr.
    pub fn combined_output(
        &mut self,
        script: &str,
        dir: &str,
        env: Option<&Environment>,
    ) -> Result<Vec<u8>, Error> {
        self.run_mode(script, dir, env, OutputMode::Combined)
    }

    /// Runs `script` with `set -x` tracing and returns the combined output.
    pub fn trace(
        &mut self,
        script: &str,
        dir: &str,
        env: Option<&Environment>,
    ) -> Result<Vec<u8>, Error> {
        self.run_mode(script, dir, env, OutputMode::Trace)
    }

    /// Runs `script` interactively on the caller's terminal.
    pub fn shell(
        &mut self,
        script: &str,
        dir: &str,
        env: Option<&Environment>,
    ) -> Result<(), Error> {
        self.run_mode(script, dir, env, OutputMode::Shell).map(drop)
    }

    /// The reboot loop around [`run_part`](Self::run_part).
    fn run_mode(
        &mut self,
        script: &str,
        dir: &str,
        env: Option<&Environment>,
        mode: OutputMode,
    ) -> Result<Vec<u8>, Error> {
        let mut env = env.cloned().unwrap_or_default();
        let mut reboot_key = String::new();
        let mut previous = Vec::new();
        let mut attempt: u32 = 0;
        loop {
            if reboot_key.is_empty() {
                reboot_key = attempt.to_string();
            }
            env.set("SPREAD_REBOOT", reboot_key.clone());
            match self.run_part(script, dir, &env, mode, previous) {
                Ok(output) => return Ok(output),
                Err(PartError::Failed(err)) => return Err(err),
                Err(PartError::Reboot { key, output }) => {
                    if attempt > MAX_REBOOTS {
                        return Err(Error::TooManyReboots {
                            server: self.server.clone(),
                            limit: MAX_REBOOTS,
                        });
                    }
                    info!("Rebooting {} as requested...", self.server);
                    reboot_key = key;
                    previous = output;
                    previous.push(b'\n');
                    self.issue_reboot()?;
                    self.dial_on_reboot()?;
                }
            }
            attempt += 1;
        }
    }

    /// Asks the target to reboot and verifies the link actually died.
    fn issue_reboot(&mut self) -> Result<(), Error> {
        let deadline = after(self.timeouts.kill());
        let script = format!("reboot &\nsleep {}", self.timeouts.kill().as_secs());
        // The link should die mid-sleep, so a clean return means the
        // request did not take.
        let mut result = self.run(&script, "", None);
        if result.is_ok() {
            result = self.run("echo should-have-disconnected", "", None);
        }
        if result.is_ok() {
            if deadline.try_recv().is_ok() {
                return Err(Error::RebootWait {
                    server: self.server.clone(),
                });
            }
            return Err(Error::RebootFailed {
                server: self.server.clone(),
            });
        }
        Ok(())
    }

    /// One attempt: a fresh channel, the assembled script, the supervisor.
    fn run_part(
        &mut self,
        script: &str,
        dir: &str,
        env: &Environment,
        mode: OutputMode,
        previous: Vec<u8>,
    ) -> Result<Vec<u8>, PartError> {
        let assembled = assemble_remote(script, dir, env, mode);
        if assembled.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            "Sending script to {}:\n-----\n{}\n------",
            self.server,
            String::from_utf8_lossy(&assembled)
        );

        if mode == OutputMode::Shell {
            return match self.run_shell(&assembled) {
                Ok(()) => Ok(previous),
                Err(err) => Err(PartError::Failed(match excerpt(&previous) {
                    Some(text) => Error::Output(text),
                    None => err,
                })),
            };
        }

        let mut channel = self
            .session
            .channel_session()
            .map_err(|err| PartError::Failed(err.into()))?;
        let cmd = command_line(mode, self.sudo());
        channel
            .exec(&cmd)
            .map_err(|err| PartError::Failed(err.into()))?;

        let stdout = Arc::new(SafeBuffer::new());
        let stderr = Arc::new(SafeBuffer::new());
        let stderr_sink = (mode == OutputMode::Split).then(|| Arc::clone(&stderr));
        let task = spawn_pump(
            Arc::clone(&self.session),
            channel,
            StdinSource::Bytes(assembled),
            Some(Arc::clone(&stdout)),
            stderr_sink,
        );

        let session = Arc::clone(&self.session);
        let outcome = supervise(
            &task.done,
            move || disconnect_transport(&session),
            Some(&stdout),
            Some(&stderr),
            self.timeouts,
            &self.server,
        );

        let (status, mut error): (Option<i32>, Option<Error>) = match outcome {
            Outcome::Finished(Ok(status)) => (Some(status), None),
            Outcome::Finished(Err(err)) => (None, Some(Error::Io(err))),
            Outcome::KillTimeout => (None, Some(Error::KillTimeout)),
            Outcome::Lost => (
                None,
                Some(Error::Monitor {
                    server: self.server.clone(),
                }),
            ),
        };

        if !stdout.is_empty() {
            debug!(
                "Output from running script on {}:\n-----\n{}\n-----",
                self.server,
                String::from_utf8_lossy(&stdout.bytes())
            );
        }
        if !stderr.is_empty() {
            debug!(
                "Error output from running script on {}:\n-----\n{}\n-----",
                self.server,
                String::from_utf8_lossy(&stderr.bytes())
            );
        }

        if status == Some(MARKER_STATUS) {
            let bytes = stdout.bytes();
            if let Some(key) = reboot_marker(&bytes) {
                let mut output = previous;
                output.extend_from_slice(&bytes);
                return Err(PartError::Reboot { key, output });
            }
        }
        if let Some(code) = status {
            if code != 0 {
                error = Some(Error::ExitStatus(code));
            }
        }

        // On failure in split mode the interesting stream is stderr.
        let raw = if error.is_none() || mode != OutputMode::Split {
            stdout.bytes()
        } else {
            stderr.bytes()
        };
        let mut output = previous;
        output.extend_from_slice(&strip_tty_noise(&raw));

        if let Some(error) = error {
            return Err(PartError::Failed(match excerpt(&output) {
                Some(text) => Error::Output(text),
                None => error,
            }));
        }
        if let Ok(Err(err)) = task.write_errors.recv() {
            info!("Error writing script to {}: {}", self.server, err);
        }
        Ok(output)
    }

    /// Starts `cmd` on a prepared channel and supervises it to completion,
    /// returning the exit status and the write-side error channel.
    pub(crate) fn run_command(
        &self,
        mut channel: Channel,
        cmd: &str,
        stdin: StdinSource,
        stdout: Option<Arc<SafeBuffer>>,
        stderr: Option<Arc<SafeBuffer>>,
    ) -> Result<(i32, Receiver<io::Result<()>>), Error> {
        channel.exec(cmd)?;
        let task = spawn_pump(
            Arc::clone(&self.session),
            channel,
            stdin,
            stdout.clone(),
            stderr.clone(),
        );
        let session = Arc::clone(&self.session);
        let outcome = supervise(
            &task.done,
            move || disconnect_transport(&session),
            stdout.as_deref(),
            stderr.as_deref(),
            self.timeouts,
            &self.server,
        );
        match outcome {
            Outcome::Finished(Ok(status)) => Ok((status, task.write_errors)),
            Outcome::Finished(Err(err)) => Err(Error::Io(err)),
            Outcome::KillTimeout => Err(Error::KillTimeout),
            Outcome::Lost => Err(Error::Monitor {
                server: self.server.clone(),
            }),
        }
    }
}

/// Internal per-attempt result; the reboot variant never escapes the
/// executor.
pub(crate) enum PartError {
    Reboot { key: String, output: Vec<u8> },
    Failed(Error),
}

/// Bytes fed to a remote command's stdin by the session pump.
pub(crate) enum StdinSource {
    /// Nothing; EOF is signalled immediately.
    Empty,
    /// An owned script or payload.
    Bytes(Vec<u8>),
    /// Chunks streamed from another thread (archive uploads).
    Stream(Receiver<Vec<u8>>),
}

/// Handles to a running session pump.
pub(crate) struct SessionTask {
    /// Exit status of the remote command, or the I/O error that ended it.
    pub(crate) done: Receiver<io::Result<i32>>,
    /// Write error (if any) followed by the stdin close result.
    pub(crate) write_errors: Receiver<io::Result<()>>,
}

/// Drives one started channel to completion on a dedicated thread.
///
/// The session is switched to non-blocking so no single stalled direction
/// can hold the libssh2 lock; stdin delivery, stdout/stderr capture, and
/// EOF detection interleave in one loop.
pub(crate) fn spawn_pump(
    session: Arc<Session>,
    mut channel: Channel,
    stdin: StdinSource,
    stdout: Option<Arc<SafeBuffer>>,
    stderr: Option<Arc<SafeBuffer>>,
) -> SessionTask {
    let (done_tx, done_rx) = bounded(1);
    let (werr_tx, werr_rx) = bounded(2);
    let _pump = thread::spawn(move || {
        session.set_blocking(false);
        let mut writer = ScriptWriter::new(stdin);
        let pumped = pump(
            &mut channel,
            &mut writer,
            stdout.as_deref(),
            stderr.as_deref(),
            &werr_tx,
        );
        session.set_blocking(true);
        let closed = channel.close().and_then(|()| channel.wait_close());
        let result = match (pumped, closed) {
            (Err(err), _) => Err(err),
            (Ok(()), Err(err)) => Err(io::Error::other(err)),
            (Ok(()), Ok(())) => channel.exit_status().map_err(io::Error::other),
        };
        let _ = done_tx.send(result);
    });
    SessionTask {
        done: done_rx,
        write_errors: werr_rx,
    }
}

fn pump(
    channel: &mut Channel,
    writer: &mut ScriptWriter,
    stdout: Option<&SafeBuffer>,
    stderr: Option<&SafeBuffer>,
    werr: &Sender<io::Result<()>>,
) -> io::Result<()> {
    let mut err_stream = channel.stderr();
    let mut buf = [0u8; CHUNK];
    loop {
        let mut progressed = writer.step(channel, werr);

        match channel.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if let Some(sink) = stdout {
                    sink.append(&buf[..n]);
                }
                progressed = true;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                writer.finish(channel, werr);
                return Err(err);
            }
        }
        match err_stream.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if let Some(sink) = stderr {
                    sink.append(&buf[..n]);
                }
                progressed = true;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                writer.finish(channel, werr);
                return Err(err);
            }
        }

        if channel.eof() {
            writer.finish(channel, werr);
            return Ok(());
        }
        if !progressed {
            thread::sleep(PUMP_IDLE);
        }
    }
}

/// Write-side state of the pump: source bytes, then EOF, then the close
/// result deposited exactly once.
struct ScriptWriter {
    stream: Option<Receiver<Vec<u8>>>,
    pending: Vec<u8>,
    offset: usize,
    failed: bool,
    done: bool,
}

impl ScriptWriter {
    fn new(source: StdinSource) -> Self {
        let (stream, pending) = match source {
            StdinSource::Empty => (None, Vec::new()),
            StdinSource::Bytes(bytes) => (None, bytes),
            StdinSource::Stream(rx) => (Some(rx), Vec::new()),
        };
        Self {
            stream,
            pending,
            offset: 0,
            failed: false,
            done: false,
        }
    }

    /// Advances the write side by at most one operation; returns `true`
    /// when a byte moved or a state transition happened.
    fn step(&mut self, channel: &mut Channel, werr: &Sender<io::Result<()>>) -> bool {
        if self.done {
            return false;
        }
        if !self.failed {
            if self.offset >= self.pending.len() {
                if let Some(rx) = &self.stream {
                    match rx.try_recv() {
                        Ok(chunk) => {
                            self.pending = chunk;
                            self.offset = 0;
                        }
                        Err(TryRecvError::Empty) => return false,
                        Err(TryRecvError::Disconnected) => self.stream = None,
                    }
                }
            }
            if self.offset < self.pending.len() {
                return match channel.write(&self.pending[self.offset..]) {
                    Ok(0) => false,
                    Ok(n) => {
                        self.offset += n;
                        true
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => false,
                    Err(err) => {
                        let _ = werr.send(Err(err));
                        self.failed = true;
                        false
                    }
                };
            }
            if self.stream.is_some() {
                // Drained for now; the producer has more coming.
                return false;
            }
        }
        // Everything is out (or the write side failed): signal EOF and
        // deposit the close result.
        match channel.send_eof() {
            Err(err) if is_again(&err) => false,
            result => {
                let _ = werr.send(result.map_err(io::Error::other));
                self.done = true;
                true
            }
        }
    }

    /// Forces the close result out, for pump exit paths.
    fn finish(&mut self, channel: &mut Channel, werr: &Sender<io::Result<()>>) {
        if !self.done {
            let _ = werr.send(channel.send_eof().map_err(io::Error::other));
            self.done = true;
        }
    }
}

fn is_again(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(ERR_EAGAIN))
}

fn disconnect_transport(session: &Session) {
    // libssh2 cannot deliver a signal on the channel; dropping the
    // transport is the forceful stop.
    let _ = session.disconnect(
        Some(DisconnectCode::ByApplication),
        "kill-timeout reached",
        None,
    );
}

fn command_line(mode: OutputMode, sudo: &str) -> String {
    match mode {
        OutputMode::Trace | OutputMode::Combined => format!("{sudo}/bin/bash -eu - 2>&1"),
        OutputMode::Split => format!("{sudo}/bin/bash -eu -"),
        OutputMode::Shell => unreachable!("shell mode runs through a heredoc command"),
    }
}

/// Extracts the reboot key when the last line of `stdout` is a
/// `<REBOOT …>` marker.
fn reboot_marker(stdout: &[u8]) -> Option<String> {
    let trimmed = trim_space(stdout);
    let last = trimmed.rsplit(|&b| b == b'\n').next()?;
    let captures = REBOOT_MARKER.captures(last)?;
    Some(
        captures
            .get(1)
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
            .unwrap_or_default(),
    )
}

/// Drops the tty noise prefix and surrounding whitespace.
fn strip_tty_noise(output: &[u8]) -> Vec<u8> {
    let rest = output.strip_prefix(TTY_NOISE).unwrap_or(output);
    trim_space(rest).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_modes_merge_stderr_remotely() {
        assert_eq!(
            command_line(OutputMode::Combined, "sudo -i "),
            "sudo -i /bin/bash -eu - 2>&1"
        );
        assert_eq!(
            command_line(OutputMode::Trace, ""),
            "/bin/bash -eu - 2>&1"
        );
        assert_eq!(command_line(OutputMode::Split, ""), "/bin/bash -eu -");
    }

    #[test]
    fn reboot_marker_matches_only_the_last_line() {
        assert_eq!(
            reboot_marker(b"before\n<REBOOT token1>\n"),
            Some("token1".to_string())
        );
        assert_eq!(reboot_marker(b"<REBOOT>\n"), Some(String::new()));
        assert_eq!(reboot_marker(b"<REBOOT abc>\nafter"), None);
        assert_eq!(reboot_marker(b"plain output"), None);
    }

    #[test]
    fn reboot_marker_keys_round_trip() {
        let key = reboot_marker(b"before\n<REBOOT token1>").expect("marker matches");
        let mut env = Environment::new();
        env.set("SPREAD_REBOOT", key);
        assert_eq!(env.get("SPREAD_REBOOT"), Some("token1"));
    }

    #[test]
    fn tty_noise_is_stripped_from_the_head_only() {
        assert_eq!(
            strip_tty_noise(b"mesg: ttyname failed: Inappropriate ioctl for device\nreal output\n"),
            b"real output".to_vec()
        );
        assert_eq!(
            strip_tty_noise(b"kept\nmesg: ttyname failed: Inappropriate ioctl for device"),
            b"kept\nmesg: ttyname failed: Inappropriate ioctl for device".to_vec()
        );
    }
}
