//! TCP port availability probing.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crossbeam_channel::{after, select, tick};
use tracing::info;

use crate::error::Error;

/// Hard deadline for a target's port to come up.
const PORT_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Period between "still waiting" log lines.
const PORT_RELOG: Duration = Duration::from_secs(15);

/// Pause between connect attempts.
const PORT_RETRY: Duration = Duration::from_secs(1);

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Resolves `addr` to its first socket address.
pub(crate) fn resolve_addr(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::other(format!("no addresses for {addr}")))
}

/// Appends the SSH default port when `address` has none.
pub(crate) fn default_port(address: &str) -> String {
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:22")
    }
}

/// Blocks until a TCP connect to `address` succeeds.
///
/// `what` names the waited-on target in logs and in the timeout error.
/// `:22` is appended when the address carries no port; connects retry every
/// second, relog every fifteen, and give up after five minutes.
pub fn wait_port_up(what: &dyn fmt::Display, address: &str) -> Result<(), Error> {
    wait_up_for(what, address, PORT_DEADLINE)
}

fn wait_up_for(what: &dyn fmt::Display, address: &str, deadline: Duration) -> Result<(), Error> {
    let address = default_port(address);
    let timeout = after(deadline);
    let relog = tick(PORT_RELOG);
    let retry = tick(PORT_RETRY);
    loop {
        let err = match probe(&address) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        select! {
            recv(retry) -> _ => {}
            recv(relog) -> _ => info!("Cannot connect to {}: {}", what, err),
            recv(timeout) -> _ => {
                return Err(Error::PortTimeout {
                    what: what.to_string(),
                    source: err,
                });
            }
        }
    }
}

fn probe(address: &str) -> io::Result<()> {
    let target = resolve_addr(address)?;
    TcpStream::connect_timeout(&target, PROBE_TIMEOUT)?;
    Ok(())
}
