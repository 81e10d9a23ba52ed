//! Compressed directory uploads.

use std::io::{self, Read};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;
use tracing::debug;

use spread_core::output::{excerpt, trim_space};
use spread_core::SafeBuffer;

use crate::client::Client;
use crate::error::Error;
use crate::run::StdinSource;

impl Client {
    /// Returns `true` when `dir` is missing or holds only `.` and `..`.
    pub fn missing_or_empty(&mut self, dir: &str) -> Result<bool, Error> {
        let output = self
            .output(&format!("! test -e \"{dir}\" || ls -a \"{dir}\""), "", None)
            .map_err(|err| Error::DirCheck {
                server: self.server.clone(),
                dir: dir.to_string(),
                source: Box::new(err),
            })?;
        if let Some(entry) = first_real_entry(&output) {
            debug!(
                "Found {:?} inside {:?}, considering non-empty.",
                String::from_utf8_lossy(entry),
                dir
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Streams `from` (filtered by `include`/`exclude` patterns handed to
    /// tar verbatim) as a gzip archive into the remote directory `to`,
    /// which must be missing or empty.
    ///
    /// The remote session's stdin carries the archive stream; its stdout
    /// carries only the extractor's diagnostics, which is the buffer that
    /// decorates a remote failure.
    pub fn send(
        &mut self,
        from: &str,
        to: &str,
        include: &[String],
        exclude: &[String],
    ) -> Result<(), Error> {
        if !self.missing_or_empty(to)? {
            return Err(Error::NotEmpty { dir: to.to_string() });
        }

        let channel = self.session.channel_session()?;

        let mut tar = Command::new("tar")
            .args(tar_args(include, exclude))
            .current_dir(from)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Error::TarStart)?;
        let Some(mut archive) = tar.stdout.take() else {
            return Err(Error::TarStart(io::Error::other("stdout not piped")));
        };
        let Some(mut tar_err) = tar.stderr.take() else {
            return Err(Error::TarStart(io::Error::other("stderr not piped")));
        };

        let tar_stderr = Arc::new(SafeBuffer::new());
        let stderr_sink = Arc::clone(&tar_stderr);
        let stderr_reader = thread::spawn(move || {
            let _ = io::copy(&mut tar_err, &mut &*stderr_sink);
        });

        // Archive chunks flow through a bounded channel into the session
        // pump, which owns the only writer on the channel.
        let (chunk_tx, chunk_rx) = bounded::<Vec<u8>>(16);
        let _chunker = thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match archive.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if chunk_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let (tar_done_tx, tar_done_rx) = bounded(1);
        let _tar_waiter = thread::spawn(move || {
            let status = tar.wait();
            let _ = stderr_reader.join();
            let _ = tar_done_tx.send(status);
        });

        let diagnostics = Arc::new(SafeBuffer::new());
        let cmd = format!(
            "{}/bin/bash -c \"mkdir -p '{to}' && cd '{to}' && /bin/tar -xz 2>&1\"",
            self.sudo()
        );
        let remote = match self.run_command(
            channel,
            &cmd,
            StdinSource::Stream(chunk_rx),
            Some(Arc::clone(&diagnostics)),
            None,
        ) {
            Ok((0, _)) => Ok(()),
            Ok((status, _)) => Err(Error::ExitStatus(status)),
            Err(err) => Err(err),
        };
        if let Err(err) = remote {
            return Err(match excerpt(&diagnostics.bytes()) {
                Some(text) => Error::Output(text),
                None => err,
            });
        }

        match tar_done_rx.recv() {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(self.local_tar_error(
                &tar_stderr,
                format!("tar exited with status {}", status.code().unwrap_or(1)),
            )),
            Ok(Err(err)) => Err(self.local_tar_error(&tar_stderr, err.to_string())),
            Err(_) => Err(Error::LocalTar(
                "archiver monitor exited unexpectedly".to_string(),
            )),
        }
    }

    fn local_tar_error(&self, stderr: &SafeBuffer, fallback: String) -> Error {
        Error::LocalTar(excerpt(&stderr.bytes()).unwrap_or(fallback))
    }
}

/// First listing entry that is not `.` or `..`, if any.
fn first_real_entry(listing: &[u8]) -> Option<&[u8]> {
    let trimmed = trim_space(listing);
    if trimmed.is_empty() {
        return None;
    }
    for line in trimmed.split(|&b| b == b'\n') {
        if line != b".".as_slice() && line != b"..".as_slice() {
            return Some(line);
        }
    }
    None
}

fn tar_args(include: &[String], exclude: &[String]) -> Vec<String> {
    let mut args = vec!["-cz".to_string(), "--exclude=.spread-reuse*".to_string()];
    for pattern in exclude {
        args.push(format!("--exclude={pattern}"));
    }
    args.extend(include.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_entries_count_as_empty() {
        assert_eq!(first_real_entry(b""), None);
        assert_eq!(first_real_entry(b"  \n"), None);
        assert_eq!(first_real_entry(b".\n..\n"), None);
    }

    #[test]
    fn any_other_entry_counts_as_content() {
        assert_eq!(first_real_entry(b".\n..\nx\n"), Some(b"x".as_slice()));
        assert_eq!(first_real_entry(b"data"), Some(b"data".as_slice()));
    }

    #[test]
    fn tar_arguments_compress_and_skip_reuse_state() {
        let args = tar_args(
            &["src".to_string(), "tests".to_string()],
            &["*.log".to_string()],
        );
        assert_eq!(
            args,
            [
                "-cz",
                "--exclude=.spread-reuse*",
                "--exclude=*.log",
                "src",
                "tests",
            ]
        );
    }
}
