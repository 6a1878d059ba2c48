// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! Static-file HTTP/WS server: an [`EventServer`] with the document
//! root wired in. HTTP requests are answered internally; WebSocket
//! messages and everything else pass through to the application.

use std::net::IpAddr;
use std::time::Duration;

use crate::config::{HttpConfig, ServerConfig};
use crate::error::Result;
use crate::http::files::FileService;
use crate::poller::Key;
use crate::server::{EventServer, ServerEvent};

pub struct HttpServer {
    srv: EventServer,
    files: FileService,
}

impl HttpServer {
    pub fn new(server_cfg: ServerConfig, http_cfg: HttpConfig) -> Result<Self> {
        Ok(Self {
            srv: EventServer::new(server_cfg)?,
            files: FileService::new(http_cfg),
        })
    }

    /// The wrapped event server, for sends, closes and UCP wiring.
    pub fn server(&mut self) -> &mut EventServer {
        &mut self.srv
    }

    #[cfg(feature = "tls")]
    pub fn init_ca(
        &mut self,
        cert_pem: &std::path::Path,
        root_pem: Option<&std::path::Path>,
        key_pem: &std::path::Path,
    ) -> Result<()> {
        self.srv.init_ca(cert_pem, root_pem, key_pem)
    }

    pub fn listen(&mut self, port: u16, ip: Option<IpAddr>, v6only: bool) -> Result<Key> {
        self.srv.tcp_listen(port, ip, v6only)
    }

    /// One pass; HTTP requests are consumed and answered, the remaining
    /// events are returned to the application.
    pub fn runtime(&mut self, timeout: Duration) -> Vec<ServerEvent> {
        let events = self.srv.runtime(timeout);
        let mut out = Vec::with_capacity(events.len());
        for ev in events {
            match ev {
                ServerEvent::Http { key, request } => self.handle_http(key, &request),
                other => out.push(other),
            }
        }
        out
    }

    fn handle_http(&mut self, key: Key, request: &crate::http::Request) {
        log::debug!(
            "[HTTP] ucid({}) {} {}",
            key,
            request.method,
            request.url
        );
        let reply = self.files.handle(request);
        // The job must be in place before the first drain so an
        // immediately-emptied buffer refills from it.
        if let Some(job) = reply.job {
            self.srv.set_send_job(key, job);
        }
        if self.srv.send_direct(key, &reply.bytes).is_err() {
            self.srv.close_key(key);
            return;
        }
        if !reply.keep_alive {
            self.srv.close_after_send(key);
        }
    }
}
