//! HTTP responses with timing, redirect history and explicit
//! decompression.

use std::io::Read;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::version::HttpVersion;

/// Per-phase timing of a completed request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timing {
    pub dns: Duration,
    pub connect: Duration,
    pub tls: Duration,
    pub first_byte: Duration,
    pub total: Duration,
}

/// Response body: fully materialized, or a lazy chunk sequence when the
/// caller asked for streaming (or the buffered size cap was exceeded).
#[derive(Debug)]
pub enum ResponseBody {
    Buffered(Bytes),
    Streaming(mpsc::Receiver<Result<Bytes>>),
}

impl ResponseBody {
    /// Soft cap on materialized bodies; larger responses switch to
    /// streaming so the buffer pool stays bounded.
    pub const BUFFER_SOFT_CAP: usize = 16 * 1024 * 1024;
}

/// An HTTP response.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    /// Headers in the order the server sent them.
    pub headers: Vec<(String, String)>,
    /// Protocol that actually served this response.
    pub protocol: HttpVersion,
    /// URL after redirects.
    pub final_url: String,
    /// Every URL visited before `final_url`, in order.
    pub redirect_history: Vec<String>,
    pub timing: Timing,
    body: ResponseBody,
}

impl Response {
    pub fn new(
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
        protocol: HttpVersion,
        url: impl Into<String>,
    ) -> Self {
        Self {
            status,
            headers,
            protocol,
            final_url: url.into(),
            redirect_history: Vec::new(),
            timing: Timing::default(),
            body: ResponseBody::Buffered(body),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a 4xx/5xx response into [`Error::HttpStatus`], passing
    /// everything else through. The error carries the engine's
    /// retriability classification for callers running their own retry
    /// loops.
    pub fn error_for_status(self) -> Result<Response> {
        if self.status >= 400 {
            Err(Error::HttpStatus {
                status: self.status,
            })
        } else {
            Ok(self)
        }
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// First header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for a header name (Set-Cookie notably repeats).
    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn redirect_location(&self) -> Option<&str> {
        self.header("location")
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.header("content-encoding")
    }

    /// Raw body bytes. For a streaming body this drains the channel.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        match &mut self.body {
            ResponseBody::Buffered(b) => Ok(b.clone()),
            ResponseBody::Streaming(rx) => {
                let mut out = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    out.extend_from_slice(&chunk?);
                }
                let bytes = Bytes::from(out);
                self.body = ResponseBody::Buffered(bytes.clone());
                Ok(bytes)
            }
        }
    }

    /// Body bytes when already materialized (all non-streaming paths).
    pub fn body(&self) -> Option<&Bytes> {
        match &self.body {
            ResponseBody::Buffered(b) => Some(b),
            ResponseBody::Streaming(_) => None,
        }
    }

    /// Take the body for streaming consumption.
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Decode the body per Content-Encoding. When the header is absent,
    /// sniff gzip/zstd magic bytes (some servers mislabel).
    pub async fn decoded(&mut self) -> Result<Bytes> {
        let raw = self.bytes().await?;
        match self
            .content_encoding()
            .map(|s| s.to_ascii_lowercase())
            .as_deref()
        {
            Some("gzip") | Some("x-gzip") => decode_gzip(&raw),
            Some("deflate") => decode_deflate(&raw),
            Some("br") => decode_brotli(&raw),
            Some("zstd") => decode_zstd(&raw),
            Some("identity") | None | Some("") => {
                if raw.len() >= 4 && raw[..4] == [0x28, 0xB5, 0x2F, 0xFD] {
                    return decode_zstd(&raw);
                }
                if raw.len() >= 2 && raw[..2] == [0x1f, 0x8b] {
                    return decode_gzip(&raw);
                }
                Ok(raw)
            }
            Some(other) => Err(Error::Decompression(format!(
                "unsupported Content-Encoding: {other}"
            ))),
        }
    }

    pub async fn text(&mut self) -> Result<String> {
        let decoded = self.decoded().await?;
        String::from_utf8(decoded.to_vec())
            .map_err(|e| Error::Decompression(format!("UTF-8 decode error: {e}")))
    }

    pub async fn json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let text = self.text().await?;
        serde_json::from_str(&text).map_err(Error::from)
    }
}

fn decode_gzip(data: &[u8]) -> Result<Bytes> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(|e| Error::Decompression(format!("gzip: {e}")))?;
    Ok(Bytes::from(decoded))
}

fn decode_deflate(data: &[u8]) -> Result<Bytes> {
    // Servers disagree about whether "deflate" means zlib-wrapped or raw.
    let mut decoded = Vec::new();
    if flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut decoded)
        .is_ok()
    {
        return Ok(Bytes::from(decoded));
    }
    decoded.clear();
    flate2::read::DeflateDecoder::new(data)
        .read_to_end(&mut decoded)
        .map_err(|e| Error::Decompression(format!("deflate: {e}")))?;
    Ok(Bytes::from(decoded))
}

fn decode_brotli(data: &[u8]) -> Result<Bytes> {
    let mut decoder = brotli::Decompressor::new(data, 4096);
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(|e| Error::Decompression(format!("brotli: {e}")))?;
    Ok(Bytes::from(decoded))
}

fn decode_zstd(data: &[u8]) -> Result<Bytes> {
    zstd::stream::decode_all(data)
        .map(Bytes::from)
        .map_err(|e| Error::Decompression(format!("zstd: {e}")))
}
