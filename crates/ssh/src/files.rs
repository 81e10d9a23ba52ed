//! File helpers built from one-shot sessions.

use std::sync::Arc;

use tracing::{debug, warn};

use spread_core::output::excerpt;
use spread_core::SafeBuffer;

use crate::client::Client;
use crate::error::Error;
use crate::run::StdinSource;

impl Client {
    /// Writes `data` to `path` on the target, creating or truncating it.
    pub fn write_file(&mut self, path: &str, data: Vec<u8>) -> Result<(), Error> {
        let channel = self.session.channel_session()?;
        debug!(
            "Writing to {} at {}:\n-----\n{}\n-----",
            self.server,
            path,
            String::from_utf8_lossy(&data)
        );
        let stderr = Arc::new(SafeBuffer::new());
        let cmd = format!("{}/bin/bash -c \"cat >'{}'\"", self.sudo(), path);
        match self.run_command(
            channel,
            &cmd,
            StdinSource::Bytes(data),
            None,
            Some(Arc::clone(&stderr)),
        ) {
            Ok((0, write_errors)) => {
                // The exit status is authoritative; delivery errors only log.
                if let Ok(Err(err)) = write_errors.recv() {
                    warn!("Error writing to {} at {}: {}", self.server, path, err);
                }
                Ok(())
            }
            Ok((status, _)) => Err(self.write_file_error(path, &stderr, Error::ExitStatus(status))),
            Err(err) => Err(self.write_file_error(path, &stderr, err)),
        }
    }

    fn write_file_error(&self, path: &str, stderr: &SafeBuffer, err: Error) -> Error {
        let cause = match excerpt(&stderr.bytes()) {
            Some(text) => Error::Output(text),
            None => err,
        };
        Error::WriteFile {
            server: self.server.clone(),
            path: path.to_string(),
            source: Box::new(cause),
        }
    }

    /// Reads `path` from the target.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, Error> {
        let channel = self.session.channel_session()?;
        debug!("Reading from {} at {}...", self.server, path);
        let stdout = Arc::new(SafeBuffer::new());
        let stderr = Arc::new(SafeBuffer::new());
        let cmd = format!("{}cat \"{}\"", self.sudo(), path);
        let failure = match self.run_command(
            channel,
            &cmd,
            StdinSource::Empty,
            Some(Arc::clone(&stdout)),
            Some(Arc::clone(&stderr)),
        ) {
            Ok((0, _)) => None,
            Ok((status, _)) => Some(Error::ExitStatus(status)),
            Err(err) => Some(err),
        };
        if let Some(err) = failure {
            let cause = match excerpt(&stderr.bytes()) {
                Some(text) => Error::Output(text),
                None => err,
            };
            let err = Error::ReadFile {
                server: self.server.clone(),
                path: path.to_string(),
                source: Box::new(cause),
            };
            warn!("{err}");
            return Err(err);
        }
        let output = stdout.bytes();
        debug!(
            "Got data from {} at {}:\n-----\n{}\n-----",
            self.server,
            path,
            String::from_utf8_lossy(&output)
        );
        Ok(output)
    }

    /// Removes `path` recursively on the target.
    pub fn remove_all(&mut self, path: &str) -> Result<(), Error> {
        self.combined_output(&format!("rm -rf \"{path}\""), "", None)
            .map(drop)
    }

    /// Enables root logins with `password`, rewriting sshd's configuration
    /// when connected as an unprivileged user.
    pub fn setup_root_access(&mut self, password: &str) -> Result<(), Error> {
        let script = if self.config.user == "root" {
            format!("echo root:'{password}' | chpasswd")
        } else {
            [
                r"sudo sed -i 's/\(PermitRootLogin\|PasswordAuthentication\)\>.*/\1 yes/' /etc/ssh/sshd_config".to_string(),
                format!("echo root:'{password}' | sudo chpasswd"),
                "sudo pkill -o -HUP sshd || true".to_string(),
            ]
            .join("\n")
        };
        if let Err(err) = self.combined_output(&script, "", None) {
            return Err(Error::RootAccess(Box::new(err)));
        }
        if self.config.user == "root" {
            // Later dials must present the new credential.
            self.config.password = password.to_string();
        }
        Ok(())
    }
}
