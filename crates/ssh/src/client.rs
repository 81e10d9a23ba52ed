//! Client lifecycle: dial, timeouts, reboot reconnection.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, select, tick};
use ssh2::Session;
use tracing::info;

use spread_core::{TimeoutSetting, Timeouts};

use crate::error::{DialError, Error};
use crate::net::{default_port, resolve_addr};

/// Connect timeout for the initial dial and post-reboot reconnects.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect timeout for the link-down probes during a reboot.
const REBOOT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between reconnect attempts.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Connection settings reused for every dial against one target.
#[derive(Clone, Debug)]
pub struct Config {
    /// Remote username.
    pub user: String,
    /// Password presented for authentication.
    pub password: String,
    /// TCP connect plus handshake budget.
    pub timeout: Duration,
}

/// SSH client for one test target.
///
/// Owns the authenticated transport; each operation opens a dedicated
/// channel on it. The reboot loop replaces the transport in place while the
/// identity and timeouts persist.
pub struct Client {
    pub(crate) server: String,
    pub(crate) session: Arc<Session>,
    pub(crate) config: Config,
    pub(crate) addr: String,
    pub(crate) timeouts: Timeouts,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.server)
            .field("config", &self.config)
            .field("addr", &self.addr)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connects to `address` and authenticates with a password.
    ///
    /// `server` is the target identity used in logs and error messages.
    /// `:22` is appended when the address carries no port.
    pub fn dial(
        server: impl Into<String>,
        address: &str,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, Error> {
        let server = server.into();
        let config = Config {
            user: user.into(),
            password: password.into(),
            timeout: DIAL_TIMEOUT,
        };
        let addr = default_port(address);
        let session = dial_transport(&addr, &config).map_err(|source| Error::Connect {
            server: server.clone(),
            source,
        })?;
        Ok(Self {
            server,
            session: Arc::new(session),
            config,
            addr,
            timeouts: Timeouts::default(),
        })
    }

    /// Target identity as used in logs and error messages.
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Shuts down the transport.
    pub fn close(&self) -> Result<(), Error> {
        self.session.disconnect(None, "closing", None)?;
        Ok(())
    }

    /// Replaces the period between liveness warnings.
    pub fn set_warn_timeout(&mut self, setting: TimeoutSetting) {
        self.timeouts.set_warn(setting);
    }

    /// Replaces the deadline after which running commands are killed.
    pub fn set_kill_timeout(&mut self, setting: TimeoutSetting) {
        self.timeouts.set_kill(setting);
    }

    /// Prefix forcing remote commands to run as root.
    pub(crate) fn sudo(&self) -> &'static str {
        if self.config.user == "root" {
            ""
        } else {
            "sudo -i "
        }
    }

    /// Waits out a reboot: first for the link to drop, then for the target
    /// to accept a fresh transport, which replaces the cached one.
    ///
    /// Both phases share one retry ticker, one relog ticker, and one kill
    /// deadline; exceeding the deadline in either phase is a hard failure.
    pub(crate) fn dial_on_reboot(&mut self) -> Result<(), Error> {
        let deadline = after(self.timeouts.kill());
        let relog = tick(self.timeouts.warn());
        let retry = tick(RETRY_INTERVAL);

        // First wait until SSH isn't working anymore.
        let mut probe_config = self.config.clone();
        probe_config.timeout = REBOOT_PROBE_TIMEOUT;
        loop {
            let before = Instant::now();
            match dial_transport(&self.addr, &probe_config) {
                Err(_) => break, // It's gone.
                Ok(session) => {
                    let _ = session.disconnect(None, "probe", None);
                    // Connects have been observed to overrun their budget by
                    // a wide margin; an overdue success counts as down.
                    if before.elapsed() > probe_config.timeout {
                        break;
                    }
                }
            }
            select! {
                recv(retry) -> _ => {}
                recv(relog) -> _ => info!("Reboot of {} is taking a while...", self.server),
                recv(deadline) -> _ => {
                    return Err(Error::RebootDown { server: self.server.clone() });
                }
            }
        }

        // Then wait for it to come back up.
        loop {
            match dial_transport(&self.addr, &self.config) {
                Ok(session) => {
                    let _ = self.close();
                    self.session = Arc::new(session);
                    return Ok(());
                }
                Err(err) => select! {
                    recv(retry) -> _ => {}
                    recv(relog) -> _ => info!("Reboot of {} is taking a while...", self.server),
                    recv(deadline) -> _ => {
                        return Err(Error::Reconnect {
                            server: self.server.clone(),
                            source: err,
                        });
                    }
                },
            }
        }
    }
}

/// Opens and authenticates one SSH transport.
fn dial_transport(addr: &str, config: &Config) -> Result<Session, DialError> {
    let target = resolve_addr(addr)?;
    let tcp = TcpStream::connect_timeout(&target, config.timeout)?;
    let mut session = Session::new()?;
    session.set_timeout(timeout_ms(config.timeout));
    session.set_tcp_stream(tcp);
    session.handshake()?;
    session.userauth_password(&config.user, &config.password)?;
    if !session.authenticated() {
        return Err(DialError::Auth {
            user: config.user.clone(),
        });
    }
    // Long-running commands own their pacing from here on.
    session.set_timeout(0);
    Ok(session)
}

fn timeout_ms(duration: Duration) -> u32 {
    duration.as_millis().min(u128::from(u32::MAX)) as u32
}
