//! Interactive shell sessions on the caller's terminal.
//!
//! Shell mode bypasses the capture buffers entirely: the remote side gets a
//! pty sized from the controlling terminal, the local terminal goes raw,
//! and bytes stream directly between the two until the remote bash exits.
//! There are no warn/kill timers; an interactive session is as long as its
//! user wants it to be.

use std::io::{self, Read, Write};
use std::sync::{Mutex, PoisonError};
use std::thread;

use crossbeam_channel::bounded;
use crossterm::terminal;
use ssh2::Channel;

use crate::client::Client;
use crate::error::Error;
use crate::run::PUMP_IDLE;

/// The controlling terminal is a process-wide resource; only one shell
/// session may drive it at a time.
static TERMINAL: Mutex<()> = Mutex::new(());

/// Raw mode guard so terminal state is restored on any return path.
struct RawModeGuard;

impl RawModeGuard {
    fn acquire() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

impl Client {
    /// Runs the assembled script on a remote pty wired to the caller's
    /// terminal.
    pub(crate) fn run_shell(&mut self, assembled: &[u8]) -> Result<(), Error> {
        let (cols, rows) = terminal::size().map_err(Error::TerminalSize)?;
        let mut channel = self.session.channel_session()?;
        let term = std::env::var("TERM")
            .ok()
            .filter(|term| !term.is_empty())
            .unwrap_or_else(|| "vt100".to_string());
        channel
            .request_pty(&term, None, Some((u32::from(cols), u32::from(rows), 0, 0)))
            .map_err(Error::Pty)?;
        let cmd = heredoc_command(&String::from_utf8_lossy(assembled), self.sudo());

        let guard = TERMINAL.lock().unwrap_or_else(PoisonError::into_inner);
        let raw = RawModeGuard::acquire().map_err(Error::RawMode)?;
        let result = self.drive_shell(&mut channel, &cmd);
        drop(raw);
        drop(guard);
        result
    }

    fn drive_shell(&self, channel: &mut Channel, cmd: &str) -> Result<(), Error> {
        channel.exec(cmd)?;
        self.session.set_blocking(false);

        // Keystrokes come in over a channel from a dedicated reader; its
        // blocking read may outlive the session, so the thread is left
        // detached.
        let (keys_tx, keys_rx) = bounded::<Vec<u8>>(16);
        let _forwarder = thread::spawn(move || {
            let mut stdin = io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if keys_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut host_out = io::stdout();
        let mut host_err = io::stderr();
        let mut err_stream = channel.stderr();
        let mut pending: Vec<u8> = Vec::new();
        let mut offset = 0;
        let mut buf = [0u8; 8192];
        let streamed = loop {
            let mut progressed = false;

            if offset >= pending.len() {
                if let Ok(keys) = keys_rx.try_recv() {
                    pending = keys;
                    offset = 0;
                }
            }
            if offset < pending.len() {
                match channel.write(&pending[offset..]) {
                    Ok(n) => {
                        offset += n;
                        progressed = n > 0;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    // A dead remote surfaces on the read side.
                    Err(_) => {}
                }
            }

            match forward(channel, &mut buf, &mut host_out) {
                Ok(moved) => progressed |= moved,
                Err(err) => break Err(err),
            }
            match forward(&mut err_stream, &mut buf, &mut host_err) {
                Ok(moved) => progressed |= moved,
                Err(err) => break Err(err),
            }

            if channel.eof() {
                break Ok(());
            }
            if !progressed {
                thread::sleep(PUMP_IDLE);
            }
        };

        self.session.set_blocking(true);
        let _ = channel.close();
        let _ = channel.wait_close();
        streamed?;
        let status = channel.exit_status()?;
        if status != 0 {
            return Err(Error::ExitStatus(status));
        }
        Ok(())
    }
}

/// Copies whatever the remote has ready onto a host stream.
fn forward(
    remote: &mut dyn Read,
    buf: &mut [u8],
    host: &mut dyn Write,
) -> Result<bool, Error> {
    match remote.read(buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            host.write_all(&buf[..n]).map_err(Error::Io)?;
            host.flush().map_err(Error::Io)?;
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(err) => Err(Error::Io(err)),
    }
}

/// Wraps the assembled script so it lands in a temp file the remote shell
/// removes on exit; the pty runs bash against that file, keeping the pty
/// stream free for the user.
fn heredoc_command(assembled: &str, sudo: &str) -> String {
    format!(
        "{{\nf=$(mktemp)\ntrap 'rm '$f EXIT\ncat > $f <<SCRIPT_END\n{assembled}\nSCRIPT_END\n{sudo}/bin/bash $f\n}}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heredoc_wraps_the_script_in_a_cleaned_up_temp_file() {
        let cmd = heredoc_command("echo hi\n", "sudo -i ");
        assert!(cmd.starts_with("{\nf=$(mktemp)\ntrap 'rm '$f EXIT\ncat > $f <<SCRIPT_END\n"));
        assert!(cmd.contains("echo hi\n"));
        assert!(cmd.ends_with("\nSCRIPT_END\nsudo -i /bin/bash $f\n}"));
    }
}
