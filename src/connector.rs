//! TLS connector: opens one connection and returns the chain the server presents.
//!
//! Certificates are not verified: the chain is returned whatever its trust
//! status. The whole fetch is bounded by [`CheckOptions::timeout`]: name
//! resolution runs on a helper thread that is abandoned at the deadline,
//! socket timeouts are clamped to the remaining budget and a watchdog thread
//! shuts the socket down once the deadline passes.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use openssl::ssl::{HandshakeError, Ssl, SslContext, SslMethod, SslVerifyMode};
use openssl::x509::X509Ref;
use tracing::{debug, warn};

use crate::certificate::RawCertificateChain;
use crate::error::{CertCheckError, Result};
use crate::{CheckOptions, Target};

/// Fetches the certificate chain of `target`.
///
/// The chain is returned in server order, leaf first, without deduplication.
pub fn fetch_chain(target: &Target, options: &CheckOptions) -> Result<RawCertificateChain> {
    let deadline = Instant::now().checked_add(options.timeout).ok_or_else(|| {
        CertCheckError::InvalidInput {
            field: "timeout".to_string(),
            reason: format!("{:?} is out of range", options.timeout),
        }
    })?;
    let addresses = resolve(target, deadline)?;

    let tcp_stream = connect_any(target, &addresses, deadline)?;
    debug!(host = %target, peer = ?tcp_stream.peer_addr().ok(), "tcp connection established");

    handshake(target, tcp_stream, options.use_sni, deadline)
}

/// Resolves `target` on a helper thread. The system resolver cannot be
/// interrupted, so a lookup still running at `deadline` is left behind and
/// reported as a timeout.
fn resolve(target: &Target, deadline: Instant) -> Result<Vec<SocketAddr>> {
    let remaining = remaining_budget(deadline).ok_or_else(|| timed_out(target, "resolve"))?;

    let (done, result) = mpsc::channel();
    let host = target.host.clone();
    let port = target.port;
    thread::Builder::new()
        .name("tls-resolver".to_string())
        .spawn(move || {
            let addresses = (host.as_str(), port)
                .to_socket_addrs()
                .map(|addresses| addresses.collect::<Vec<SocketAddr>>());
            // The receiver is gone when the lookup outlived the deadline.
            let _ = done.send(addresses);
        })?;

    let addresses = match result.recv_timeout(remaining) {
        Ok(Ok(addresses)) => addresses,
        Ok(Err(e)) => {
            return Err(CertCheckError::DnsResolution {
                hostname: target.host.clone(),
                source: e,
            })
        }
        Err(RecvTimeoutError::Timeout) => return Err(timed_out(target, "resolve")),
        Err(RecvTimeoutError::Disconnected) => {
            return Err(CertCheckError::Other {
                message: format!("resolver thread for {} exited without a result", target),
            })
        }
    };

    if addresses.is_empty() {
        return Err(CertCheckError::DnsResolution {
            hostname: target.host.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
        });
    }
    debug!(host = %target, count = addresses.len(), "resolved addresses");
    Ok(addresses)
}

fn connect_any(target: &Target, addresses: &[SocketAddr], deadline: Instant) -> Result<TcpStream> {
    let mut last_error = None;

    for address in addresses {
        let remaining = remaining_budget(deadline).ok_or_else(|| timed_out(target, "connect"))?;
        match TcpStream::connect_timeout(address, remaining) {
            Ok(stream) => return Ok(stream),
            Err(e) if is_timeout(&e) => {
                debug!(%address, "connect timed out");
                last_error = Some(e);
            }
            Err(e) => {
                debug!(%address, error = %e, "connect failed");
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) if is_timeout(&e) || remaining_budget(deadline).is_none() => {
            Err(timed_out(target, "connect"))
        }
        Some(e) => Err(CertCheckError::ConnectionFailed {
            address: target.to_string(),
            source: e,
        }),
        None => Err(timed_out(target, "connect")),
    }
}

fn handshake(
    target: &Target,
    tcp_stream: TcpStream,
    use_sni: bool,
    deadline: Instant,
) -> Result<RawCertificateChain> {
    let mut context = SslContext::builder(SslMethod::tls())?;
    context.set_verify(SslVerifyMode::NONE);
    let context = context.build();

    let mut connector = Ssl::new(&context)?;
    if use_sni {
        connector.set_hostname(&target.host)?;
    }

    let remaining = remaining_budget(deadline).ok_or_else(|| timed_out(target, "handshake"))?;
    tcp_stream.set_read_timeout(Some(remaining))?;
    tcp_stream.set_write_timeout(Some(remaining))?;

    let watchdog = Watchdog::arm(&tcp_stream, deadline)?;

    let mut stream = match connector.connect(tcp_stream) {
        Ok(stream) => stream,
        Err(HandshakeError::WouldBlock(_)) => return Err(timed_out(target, "handshake")),
        Err(_) if watchdog.fired() || remaining_budget(deadline).is_none() => {
            return Err(timed_out(target, "handshake"))
        }
        Err(e) => return Err(e.into()),
    };
    debug!(
        host = %target,
        version = stream.ssl().version_str(),
        cipher = ?stream.ssl().current_cipher().map(|c| c.name()),
        "tls handshake complete"
    );

    let pems = match stream.ssl().peer_cert_chain() {
        Some(stack) if !stack.is_empty() => stack.iter().map(to_pem).collect::<Result<Vec<_>>>()?,
        _ => match stream.ssl().peer_certificate() {
            Some(cert) => vec![to_pem(&cert)?],
            None => Vec::new(),
        },
    };

    if let Err(e) = stream.shutdown() {
        debug!(error = %e, "tls shutdown failed");
    }
    drop(stream);
    drop(watchdog);

    if pems.is_empty() {
        return Err(CertCheckError::HandshakeFailed {
            details: "server presented no certificates".to_string(),
        });
    }
    debug!(host = %target, certificates = pems.len(), "retrieved certificate chain");
    Ok(RawCertificateChain::new(pems))
}

fn to_pem(cert: &X509Ref) -> Result<String> {
    let pem = cert.to_pem()?;
    String::from_utf8(pem).map_err(|e| CertCheckError::Other {
        message: format!("certificate PEM is not valid UTF-8: {}", e),
    })
}

fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        None
    } else {
        Some(remaining)
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

fn timed_out(target: &Target, phase: &str) -> CertCheckError {
    CertCheckError::Timeout {
        operation: format!("{} to {}", phase, target),
    }
}

/// Shuts a socket down when a deadline passes.
///
/// Dropping the watchdog cancels it and joins the timer thread, so the cloned
/// socket handle is always released before the fetch returns.
struct Watchdog {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    fn arm(socket: &TcpStream, deadline: Instant) -> Result<Self> {
        let socket = socket.try_clone()?;
        let (cancel, cancelled) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        let handle = thread::Builder::new()
            .name("tls-watchdog".to_string())
            .spawn(move || {
                let wait = deadline.saturating_duration_since(Instant::now());
                if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(wait) {
                    flag.store(true, Ordering::SeqCst);
                    warn!("deadline reached, aborting tls connection");
                    if let Err(e) = socket.shutdown(Shutdown::Both) {
                        debug!(error = %e, "watchdog shutdown failed");
                    }
                }
            })?;

        Ok(Watchdog {
            cancel: Some(cancel),
            handle: Some(handle),
            fired,
        })
    }

    fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the timer thread.
        drop(self.cancel.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
