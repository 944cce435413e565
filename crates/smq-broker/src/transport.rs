//! Per-connection byte-stream transport: a non-blocking mio TCP socket,
//! optionally wrapped in a rustls server session.
//!
//! Reads drain until the kernel blocks; writes report how much was taken so
//! the connection can backlog the remainder and arm WRITABLE interest.

use std::{
    fs::File,
    io::{self, BufReader, Read, Write},
    net::SocketAddr,
    path::Path,
    sync::Arc,
};

use bytes::BytesMut;
use mio::{Interest, Registry, Token, net::TcpStream};
use rustls::{RootCertStore, ServerConfig, ServerConnection, server::WebPkiClientVerifier};
use tracing::debug;

use crate::{BrokerError, config::{TlsConfig, VerifyMode}};

const READ_CHUNK: usize = 16 * 1024;

/// Outcome of draining the socket's readable side.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum ReadOutcome {
    /// Bytes (possibly zero, e.g. pure TLS handshake traffic) were consumed
    /// and the kernel would now block.
    Drained,
    /// The peer closed the stream.
    Closed,
}

pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

pub(crate) struct TlsStream {
    sock: TcpStream,
    session: ServerConnection,
}

impl Transport {
    pub(crate) fn plain(sock: TcpStream) -> Self {
        let _ = sock.set_nodelay(true);
        Self::Plain(sock)
    }

    pub(crate) fn tls(sock: TcpStream, config: Arc<ServerConfig>) -> Result<Self, BrokerError> {
        let _ = sock.set_nodelay(true);
        let session = ServerConnection::new(config)?;
        Ok(Self::Tls(Box::new(TlsStream { sock, session })))
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Plain(sock) => sock.peer_addr().ok(),
            Self::Tls(tls) => tls.sock.peer_addr().ok(),
        }
    }

    pub(crate) fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Plain(sock) => registry.register(sock, token, interests),
            Self::Tls(tls) => registry.register(&mut tls.sock, token, interests),
        }
    }

    pub(crate) fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Plain(sock) => registry.reregister(sock, token, interests),
            Self::Tls(tls) => registry.reregister(&mut tls.sock, token, interests),
        }
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) {
        let result = match self {
            Self::Plain(sock) => registry.deregister(sock),
            Self::Tls(tls) => registry.deregister(&mut tls.sock),
        };
        if let Err(e) = result {
            debug!("transport deregister: {e}");
        }
    }

    /// Appends everything currently readable to `buf`.
    pub(crate) fn read_into(&mut self, buf: &mut BytesMut) -> io::Result<ReadOutcome> {
        match self {
            Self::Plain(sock) => {
                let mut chunk = [0u8; READ_CHUNK];
                loop {
                    match sock.read(&mut chunk) {
                        Ok(0) => return Ok(ReadOutcome::Closed),
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(ReadOutcome::Drained);
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            Self::Tls(tls) => tls.read_into(buf),
        }
    }

    /// Writes as much of `bytes` as the socket takes; the caller backlogs
    /// the rest. TLS accepts everything into the session and reports how
    /// much of its outgoing buffer reached the kernel separately.
    pub(crate) fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(sock) => match sock.write(bytes) {
                Ok(n) => Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(e),
            },
            Self::Tls(tls) => {
                tls.session.writer().write_all(bytes)?;
                tls.flush_session()?;
                Ok(bytes.len())
            }
        }
    }

    /// True while the transport itself holds unflushed outgoing bytes.
    pub(crate) fn wants_write(&self) -> bool {
        match self {
            Self::Plain(_) => false,
            Self::Tls(tls) => tls.session.wants_write(),
        }
    }

    /// Pushes transport-buffered bytes towards the kernel (TLS only).
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(_) => Ok(()),
            Self::Tls(tls) => tls.flush_session(),
        }
    }

    pub(crate) fn close(&mut self) {
        let sock = match self {
            Self::Plain(sock) => sock,
            Self::Tls(tls) => {
                tls.session.send_close_notify();
                let _ = tls.flush_session();
                &mut tls.sock
            }
        };
        let _ = sock.shutdown(std::net::Shutdown::Both);
    }
}

impl TlsStream {
    fn read_into(&mut self, buf: &mut BytesMut) -> io::Result<ReadOutcome> {
        loop {
            match self.session.read_tls(&mut self.sock) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(_) => {
                    let state = self
                        .session
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    let mut plaintext = vec![0u8; state.plaintext_bytes_to_read()];
                    if !plaintext.is_empty() {
                        self.session.reader().read_exact(&mut plaintext)?;
                        buf.extend_from_slice(&plaintext);
                    }
                    // handshake and close_notify responses
                    self.flush_session()?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::Drained);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn flush_session(&mut self) -> io::Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.sock) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Builds the listener-side TLS configuration from cert, key and the
/// configured peer-verification mode.
pub(crate) fn server_tls_config(tls: &TlsConfig) -> Result<Arc<ServerConfig>, BrokerError> {
    let certs = load_certs(tls.cert.as_deref().ok_or_else(|| {
        BrokerError::Config("listen.tls.cert is required".into())
    })?)?;
    let key = load_key(tls.key.as_deref().ok_or_else(|| {
        BrokerError::Config("listen.tls.key is required".into())
    })?)?;

    let builder = match tls.verify {
        VerifyMode::None => ServerConfig::builder().with_no_client_auth(),
        mode => {
            let ca_path = tls.ca.as_deref().ok_or_else(|| {
                BrokerError::Config("listen.tls.ca is required for peer verification".into())
            })?;
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| BrokerError::Config(format!("bad CA certificate: {e}")))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots));
            let verifier = if mode == VerifyMode::Optional {
                verifier.allow_unauthenticated()
            } else {
                verifier
            };
            let verifier = verifier
                .build()
                .map_err(|e| BrokerError::Config(format!("client verifier: {e}")))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| BrokerError::Config(format!("bad certificate/key pair: {e}")))?;
    Ok(Arc::new(config))
}

pub(crate) fn load_certs(
    path: &Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, BrokerError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BrokerError::Config(format!("bad certificate {}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, BrokerError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| BrokerError::Config(format!("bad private key {}: {e}", path.display())))?
        .ok_or_else(|| BrokerError::Config(format!("no private key in {}", path.display())))
}
