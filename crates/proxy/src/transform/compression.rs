//! Response compression.
//!
//! Encoding selection: brotli when the client accepts `br` and brotli is
//! enabled, else gzip when accepted and enabled, else identity. A response
//! is only compressed when it is not already encoded, meets the configured
//! minimum length, and carries a compressible content type.

use bytes::Bytes;
use flate2::write::GzEncoder;
use http::{header, HeaderMap};
use std::io::Write;
use tracing::trace;

use portico_config::Compression;

use crate::errors::ProxyError;

/// Selected content encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Brotli,
}

impl ContentEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncoding::Identity => "identity",
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Brotli => "br",
        }
    }
}

/// Content types worth compressing: textual formats plus the textual
/// application/image types. Everything else ships as-is.
pub fn is_compressible(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();

    essence.starts_with("text/")
        || essence == "application/json"
        || essence == "application/javascript"
        || essence == "application/xml"
        || essence == "image/svg+xml"
}

/// Pick an encoding from the client's `Accept-Encoding` and the policy.
pub fn negotiate(accept_encoding: Option<&str>, config: &Compression) -> ContentEncoding {
    if !config.enabled {
        return ContentEncoding::Identity;
    }
    let Some(accept) = accept_encoding else {
        return ContentEncoding::Identity;
    };

    if config.brotli.on && accepts(accept, "br") {
        return ContentEncoding::Brotli;
    }
    if config.gzip.on && accepts(accept, "gzip") {
        return ContentEncoding::Gzip;
    }
    ContentEncoding::Identity
}

fn accepts(accept: &str, token: &str) -> bool {
    accept
        .split(',')
        .map(|part| part.split(';').next().unwrap_or("").trim())
        .any(|t| t.eq_ignore_ascii_case(token) || t == "*")
}

/// Whether this response should be compressed at all.
pub fn should_compress(config: &Compression, headers: &HeaderMap, body_len: usize) -> bool {
    if !config.enabled || body_len < config.min_length {
        return false;
    }

    // Already encoded responses pass through untouched.
    if let Some(existing) = headers.get(header::CONTENT_ENCODING) {
        if let Ok(v) = existing.to_str() {
            if !v.trim().is_empty() && !v.trim().eq_ignore_ascii_case("identity") {
                return false;
            }
        }
    }

    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(is_compressible)
        .unwrap_or(false)
}

/// Compress `content` with `encoding` at the configured levels.
pub fn compress(
    content: &Bytes,
    encoding: ContentEncoding,
    config: &Compression,
) -> Result<Bytes, ProxyError> {
    match encoding {
        ContentEncoding::Identity => Ok(content.clone()),
        ContentEncoding::Gzip => {
            let level = config.gzip.level.clamp(1, 9);
            let mut encoder =
                GzEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder.write_all(content).map_err(ProxyError::Io)?;
            let compressed = encoder.finish().map_err(ProxyError::Io)?;

            trace!(
                original = content.len(),
                compressed = compressed.len(),
                "gzip applied"
            );
            Ok(Bytes::from(compressed))
        }
        ContentEncoding::Brotli => {
            let level = config.brotli.level.clamp(0, 11);
            let mut compressed = Vec::new();
            {
                let mut encoder =
                    brotli::CompressorWriter::new(&mut compressed, 4096, level, 22);
                encoder.write_all(content).map_err(ProxyError::Io)?;
            }

            trace!(
                original = content.len(),
                compressed = compressed.len(),
                "brotli applied"
            );
            Ok(Bytes::from(compressed))
        }
    }
}

/// Rewrite response headers after compressing the body.
pub fn mark_compressed(headers: &mut HeaderMap, encoding: ContentEncoding, new_len: usize) {
    headers.insert(
        header::CONTENT_ENCODING,
        http::HeaderValue::from_static(match encoding {
            ContentEncoding::Identity => "identity",
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Brotli => "br",
        }),
    );
    headers.insert(header::CONTENT_LENGTH, http::HeaderValue::from(new_len));
    headers.append(header::VARY, http::HeaderValue::from_static("accept-encoding"));
}
