// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! Static-file request handling: URL-to-path mapping, HEAD, whole-file
//! GET with optional gzip, and range GET with rolled send jobs.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use percent_encoding::percent_decode_str;

use crate::config::{HttpConfig, HTTP_SENDJOB_CHUNK};
use crate::http::{status_response, Request, ResponseBuilder};

/// Range responses above this size roll through a send job instead of
/// being buffered whole.
const INLINE_RANGE_MAX: usize = 1024 * 1024;

/// Remaining file window to stream as the send buffer drains.
#[derive(Debug, Clone)]
pub struct SendJob {
    pub path: PathBuf,
    pub pos: u64,
    pub end: u64,
}

impl SendJob {
    /// Read the next chunk (at most 30 KiB), advancing the window.
    /// Returns None when the window is exhausted or unreadable.
    pub fn next_chunk(&mut self) -> Option<Vec<u8>> {
        if self.pos >= self.end {
            return None;
        }
        let want = ((self.end - self.pos) as usize).min(HTTP_SENDJOB_CHUNK);
        match read_at(&self.path, self.pos, want) {
            Ok(data) if !data.is_empty() => {
                self.pos += data.len() as u64;
                Some(data)
            }
            _ => None,
        }
    }

    pub fn done(&self) -> bool {
        self.pos >= self.end
    }
}

/// One answered request.
pub struct HttpReply {
    pub bytes: Vec<u8>,
    pub keep_alive: bool,
    pub job: Option<SendJob>,
}

impl HttpReply {
    fn simple(status: u16, keep_alive: bool) -> Self {
        Self {
            bytes: status_response(status, keep_alive),
            keep_alive,
            job: None,
        }
    }
}

/// Document-root file service.
pub struct FileService {
    cfg: HttpConfig,
}

impl FileService {
    pub fn new(cfg: HttpConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.cfg
    }

    /// Answer one parsed request.
    pub fn handle(&self, req: &Request) -> HttpReply {
        let keep = req.keep_alive();

        if let Some(expected) = &self.cfg.basic_auth {
            if !auth_ok(req, expected) {
                let bytes = ResponseBuilder::new(401, keep)
                    .header("WWW-Authenticate", "Basic")
                    .body(&[]);
                return HttpReply {
                    bytes,
                    keep_alive: keep,
                    job: None,
                };
            }
        }

        if !req.is_method("GET") && !req.is_method("HEAD") {
            log::debug!("[HTTP] method {} rejected", req.method);
            return HttpReply::simple(400, keep);
        }

        let path = match self.map_url(&req.url) {
            Some(p) => p,
            None => return HttpReply::simple(404, keep),
        };
        let meta = match fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            _ => {
                log::debug!("[HTTP] 404 {}", path.display());
                return HttpReply::simple(404, keep);
            }
        };
        let file_len = meta.len();

        if req.is_method("HEAD") {
            let bytes = ResponseBuilder::new(200, keep)
                .header("Accept-Ranges", "bytes")
                .content_length_only(file_len);
            return HttpReply {
                bytes,
                keep_alive: keep,
                job: None,
            };
        }

        if let Some(range) = req.header("Range") {
            return self.get_range(&path, file_len, range, keep);
        }
        self.get_whole(&path, file_len, req, keep)
    }

    /// Percent-decode and map the URL beneath the document root.
    /// `..` anywhere or a leading `.` refuses the path.
    fn map_url(&self, url: &str) -> Option<PathBuf> {
        let raw = url.split(['?', '#']).next().unwrap_or("");
        let decoded = percent_decode_str(raw).decode_utf8().ok()?;
        let decoded = decoded.as_ref();
        if decoded.is_empty() {
            return None;
        }
        let rel = decoded.strip_prefix('/').unwrap_or(decoded);
        if rel.is_empty() {
            return Some(self.cfg.doc_root.join("index.html"));
        }
        if rel.starts_with('.') || rel.contains("..") {
            return None;
        }
        Some(self.cfg.doc_root.join(rel))
    }

    fn get_whole(&self, path: &Path, file_len: u64, req: &Request, keep: bool) -> HttpReply {
        if file_len > self.cfg.downfile_max as u64 {
            log::debug!("[HTTP] 413 {} ({} bytes)", path.display(), file_len);
            return HttpReply::simple(413, keep);
        }
        let data = match read_at(path, 0, file_len as usize) {
            Ok(d) => d,
            Err(_) => return HttpReply::simple(404, keep),
        };
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let mut rb = ResponseBuilder::new(200, keep)
            .header("Accept-Ranges", "bytes")
            .header("Content-Type", mime.essence_str());
        let body = if compressible(path, mime.essence_str()) && req.accepts_gzip() {
            match gzip(&data) {
                Some(z) if z.len() < data.len() => {
                    rb = rb.header("Content-Encoding", "gzip");
                    z
                }
                _ => data,
            }
        } else {
            data
        };
        HttpReply {
            bytes: rb.body(&body),
            keep_alive: keep,
            job: None,
        }
    }

    fn get_range(&self, path: &Path, file_len: u64, range: &str, keep: bool) -> HttpReply {
        let (start, end_incl) = match parse_range(range) {
            Some(r) => r,
            None => return HttpReply::simple(413, keep),
        };
        if start >= file_len {
            // Start beyond EOF is treated like a malformed range.
            return HttpReply::simple(413, keep);
        }
        let end_excl = match end_incl {
            Some(e) => (e + 1).min(file_len),
            None => file_len,
        };
        if end_excl <= start {
            return HttpReply::simple(413, keep);
        }
        let len = (end_excl - start).min(self.cfg.range_max as u64);
        let end_excl = start + len;

        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let head = ResponseBuilder::new(206, keep)
            .header("Accept-Ranges", "bytes")
            .header("Content-Type", mime.essence_str())
            .header(
                "Content-Range",
                &format!("bytes {}-{}/{}", start, end_excl - 1, file_len),
            )
            .content_length_only(len);

        if len as usize <= INLINE_RANGE_MAX {
            let mut bytes = head;
            match read_at(path, start, len as usize) {
                Ok(body) => bytes.extend_from_slice(&body),
                Err(_) => return HttpReply::simple(404, keep),
            }
            HttpReply {
                bytes,
                keep_alive: keep,
                job: None,
            }
        } else {
            // Headers now; the body rolls through the send job as the
            // send buffer drains.
            HttpReply {
                bytes: head,
                keep_alive: keep,
                job: Some(SendJob {
                    path: path.to_path_buf(),
                    pos: start,
                    end: end_excl,
                }),
            }
        }
    }
}

fn auth_ok(req: &Request, expected: &str) -> bool {
    let Some(value) = req.header("Authorization") else {
        return false;
    };
    let Some(b64) = value.trim().strip_prefix("Basic ") else {
        return false;
    };
    base64::engine::general_purpose::STANDARD
        .decode(b64.trim())
        .ok()
        .map(|raw| raw == expected.as_bytes())
        .unwrap_or(false)
}

/// Parse `bytes=a-b` / `bytes=a-`. Suffix and multi-range forms are
/// rejected.
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes=")?;
    let mut parts = rest.splitn(2, '-');
    let start: u64 = parts.next()?.trim().parse().ok()?;
    let end = parts.next()?.trim();
    if end.is_empty() {
        return Some((start, None));
    }
    if end.contains(',') {
        return None;
    }
    let end: u64 = end.parse().ok()?;
    if end < start {
        return None;
    }
    Some((start, Some(end)))
}

/// Blocking positioned read of up to `len` bytes.
fn read_at(path: &Path, pos: u64, len: usize) -> std::io::Result<Vec<u8>> {
    let mut f = fs::File::open(path)?;
    f.seek(SeekFrom::Start(pos))?;
    let mut out = vec![0u8; len];
    let mut filled = 0usize;
    while filled < len {
        let n = f.read(&mut out[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    out.truncate(filled);
    Ok(out)
}

fn gzip(data: &[u8]) -> Option<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Compression::default());
    enc.write_all(data).ok()?;
    enc.finish().ok()
}

/// MIME policy: text-like types compress; already-compressed container
/// formats do not.
fn compressible(path: &Path, mime: &str) -> bool {
    const PRECOMPRESSED: &[&str] = &[
        "jpg", "jpeg", "png", "gif", "webp", "zip", "gz", "bz2", "xz", "7z", "rar", "mp3", "mp4",
        "mkv", "avi", "ogg", "woff", "woff2",
    ];
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if PRECOMPRESSED.iter().any(|p| ext.eq_ignore_ascii_case(p)) {
            return false;
        }
    }
    mime.starts_with("text/")
        || mime == "application/json"
        || mime == "application/javascript"
        || mime.ends_with("+xml")
        || mime == "application/xml"
        || mime == "image/svg+xml"
}
