//! Watchdog for a started command: completion, warn ticks, kill deadline.

use std::fmt;

use crossbeam_channel::{after, tick, Receiver};
use tracing::warn;

use spread_core::{SafeBuffer, Timeouts, UNCHANGED_MARKER};

/// Result of supervising a running command.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The command completed and delivered its result.
    Finished(T),
    /// The kill deadline fired and the command was forcibly terminated.
    KillTimeout,
    /// The worker delivering the completion signal died without a result.
    Lost,
}

/// Blocks until a started command completes, warning periodically and
/// killing it at the deadline.
///
/// `done` carries the command's completion value; the sinks, when present,
/// feed the incremental excerpts reported on each warn tick. On the kill
/// deadline the `kill` closure runs, the literal `\n<kill-timeout reached>`
/// is appended to the stdout sink (stderr when there is no stdout sink),
/// and the function returns without waiting for the completion signal — the
/// waiter is abandoned, not joined.
pub fn supervise<T>(
    done: &Receiver<T>,
    kill: impl FnOnce(),
    stdout: Option<&SafeBuffer>,
    stderr: Option<&SafeBuffer>,
    timeouts: Timeouts,
    subject: &dyn fmt::Display,
) -> Outcome<T> {
    let deadline = after(timeouts.kill());
    let ticker = tick(timeouts.warn());
    let mut last_out = 0;
    let mut last_err = 0;

    loop {
        crossbeam_channel::select! {
            recv(done) -> message => {
                return match message {
                    Ok(value) => Outcome::Finished(value),
                    Err(_) => Outcome::Lost,
                };
            }
            recv(deadline) -> _ => {
                kill();
                if let Some(sink) = stdout.or(stderr) {
                    sink.append(b"\n<kill-timeout reached>");
                }
                return Outcome::KillTimeout;
            }
            recv(ticker) -> _ => {
                let mut output = Vec::new();
                if let Some(buffer) = stdout {
                    let (view, offset) = buffer.since(last_out);
                    output = view;
                    last_out = offset;
                }
                if let Some(buffer) = stderr {
                    let (errput, offset) = buffer.since(last_err);
                    last_err = offset;
                    output = merge_views(output, errput);
                }
                if output == UNCHANGED_MARKER {
                    warn!("{} running late. Output unchanged.", subject);
                } else if output.is_empty() {
                    warn!("{} running late. Output still empty.", subject);
                } else {
                    warn!(
                        "{} running late. Current output:\n-----\n{}\n-----",
                        subject,
                        String::from_utf8_lossy(&output),
                    );
                }
            }
        }
    }
}

/// Folds the stderr view into the stdout view for one warn report.
///
/// When stdout has nothing new, or stderr opens with exactly the stdout
/// view, stderr alone is reported; this also avoids a doubled
/// unchanged-marker. Otherwise the views are joined with a blank line.
fn merge_views(output: Vec<u8>, errput: Vec<u8>) -> Vec<u8> {
    if output.is_empty() || errput.starts_with(&output) {
        return errput;
    }
    if errput.is_empty() {
        return output;
    }
    let mut merged = output;
    merged.extend_from_slice(b"\n\n");
    merged.extend_from_slice(&errput);
    merged
}
