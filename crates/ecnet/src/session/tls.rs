// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! TLS session wrapper.
//!
//! Translates the encrypted record stream to and from the plaintext
//! application stream for one connection. The handshake and record
//! machinery is rustls, pinned to TLS 1.2; this module only moves bytes
//! between the socket-facing buffers and the rustls connection.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::{ServerConfig, ServerConnection};

use crate::error::{Error, Result};

/// Immutable server credential bundle, shared by all TLS sessions.
#[derive(Clone, Debug)]
pub struct TlsCredentials {
    config: Arc<ServerConfig>,
}

impl TlsCredentials {
    /// Load (cert chain PEM, optional root PEM, private key PEM) and
    /// build a TLS 1.2-only server configuration.
    pub fn load(cert_pem: &Path, root_pem: Option<&Path>, key_pem: &Path) -> Result<Self> {
        let mut certs = read_certs(cert_pem)?;
        if let Some(root) = root_pem {
            certs.extend(read_certs(root)?);
        }
        if certs.is_empty() {
            return Err(Error::CertLoad(format!(
                "no certificates in {}",
                cert_pem.display()
            )));
        }
        let key = {
            let file = std::fs::File::open(key_pem)
                .map_err(|e| Error::CertLoad(format!("{}: {}", key_pem.display(), e)))?;
            rustls_pemfile::private_key(&mut io::BufReader::new(file))
                .map_err(|e| Error::CertLoad(format!("{}: {}", key_pem.display(), e)))?
                .ok_or_else(|| {
                    Error::CertLoad(format!("no private key in {}", key_pem.display()))
                })?
        };
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS12])
            .map_err(|e| Error::CertLoad(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::CertLoad(e.to_string()))?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Wrap an existing rustls config (tests, custom setups).
    pub fn from_config(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

fn read_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::CertLoad(format!("{}: {}", path.display(), e)))?;
    rustls_pemfile::certs(&mut io::BufReader::new(file))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| Error::CertLoad(format!("{}: {}", path.display(), e)))
}

/// Server-side TLS record translator for one session.
pub struct TlsStream {
    conn: ServerConnection,
    handshake_done: bool,
}

impl TlsStream {
    pub fn new(creds: &TlsCredentials) -> Result<Self> {
        let conn = ServerConnection::new(creds.config())
            .map_err(|e| Error::CertLoad(e.to_string()))?;
        Ok(Self {
            conn,
            handshake_done: false,
        })
    }

    /// Whether the handshake has completed at least once.
    pub fn handshake_done(&self) -> bool {
        self.handshake_done
    }

    /// Feed ciphertext from the wire.
    ///
    /// Decrypted application bytes are appended to `app_out`; records to
    /// send back (handshake flights, alerts) to `wire_out`. Returns true
    /// once the handshake is complete. A TLS-level error is fatal for
    /// the session.
    pub fn on_tcp_read(
        &mut self,
        input: &[u8],
        wire_out: &mut Vec<u8>,
        app_out: &mut Vec<u8>,
    ) -> Result<bool> {
        let mut cursor = io::Cursor::new(input);
        while (cursor.position() as usize) < input.len() {
            let n = self
                .conn
                .read_tls(&mut cursor)
                .map_err(|e| Error::Protocol(format!("tls read: {}", e)))?;
            if n == 0 {
                break;
            }
            let state = self
                .conn
                .process_new_packets()
                .map_err(|e| Error::Protocol(format!("tls: {}", e)))?;
            if state.plaintext_bytes_to_read() > 0 {
                let mut chunk = [0u8; 16 * 1024];
                loop {
                    match self.conn.reader().read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => app_out.extend_from_slice(&chunk[..n]),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                        Err(e) => return Err(Error::Protocol(format!("tls plaintext: {}", e))),
                    }
                }
            }
        }
        self.flush_wire(wire_out)?;
        if !self.handshake_done && !self.conn.is_handshaking() {
            self.handshake_done = true;
        }
        Ok(self.handshake_done)
    }

    /// Encrypt application bytes into records appended to `wire_out`.
    pub fn encode_app(&mut self, data: &[u8], wire_out: &mut Vec<u8>) -> Result<()> {
        self.conn
            .writer()
            .write_all(data)
            .map_err(|e| Error::Protocol(format!("tls write: {}", e)))?;
        self.flush_wire(wire_out)
    }

    fn flush_wire(&mut self, wire_out: &mut Vec<u8>) -> Result<()> {
        while self.conn.wants_write() {
            self.conn
                .write_tls(wire_out)
                .map_err(|e| Error::Protocol(format!("tls flush: {}", e)))?;
        }
        Ok(())
    }
}

/// The TLS record-prefix sniff: `22 03 00..03`.
///
/// Versions down to SSLv3 are accepted here; anything below TLS 1.2 is
/// then refused by the handshake itself.
pub fn looks_like_client_hello(prefix: &[u8]) -> bool {
    prefix.len() >= 3 && prefix[0] == 22 && prefix[1] == 3 && prefix[2] <= 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_hello_sniff() {
        assert!(looks_like_client_hello(&[22, 3, 1, 0, 0]));
        assert!(looks_like_client_hello(&[22, 3, 0]));
        assert!(looks_like_client_hello(&[22, 3, 3]));
        assert!(!looks_like_client_hello(&[22, 3]));
        assert!(!looks_like_client_hello(&[22, 2, 1]));
        assert!(!looks_like_client_hello(b"GET"));
        assert!(!looks_like_client_hello(&[22, 3, 4]));
    }

    #[test]
    fn test_missing_cert_files_error() {
        let err = TlsCredentials::load(
            Path::new("/nonexistent/cert.pem"),
            None,
            Path::new("/nonexistent/key.pem"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::CertLoad(_)));
    }
}
