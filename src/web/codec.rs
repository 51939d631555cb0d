//! Response codecs and content negotiation.

use super::response::ApiResponse;
use crate::error::ApiError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Unsupported(String),
}

/// A `type/subtype` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    pub kind: String,
    pub subtype: String,
}

impl MediaType {
    pub fn new(kind: &str, subtype: &str) -> Self {
        Self {
            kind: kind.to_string(),
            subtype: subtype.to_string(),
        }
    }

    /// Whether this concrete type is acceptable for `clause`, honouring
    /// `*/*` and `type/*` wildcards.
    pub fn satisfies(&self, clause: &AcceptClause) -> bool {
        if clause.kind == "*" && clause.subtype == "*" {
            return true;
        }
        if !clause.kind.eq_ignore_ascii_case(&self.kind) {
            return false;
        }
        clause.subtype == "*" || clause.subtype.eq_ignore_ascii_case(&self.subtype)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.subtype)
    }
}

/// Encodes successful responses. Error responses are always JSON and never
/// go through a codec.
pub trait Codec: Send + Sync {
    fn content_type(&self) -> MediaType;

    /// Whether this codec can represent `resp` at all.
    fn can_encode(&self, resp: &ApiResponse) -> bool;

    fn encode(&self, resp: &ApiResponse) -> Result<Vec<u8>, CodecError>;
}

pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> MediaType {
        MediaType::new("application", "json")
    }

    fn can_encode(&self, _resp: &ApiResponse) -> bool {
        true
    }

    fn encode(&self, resp: &ApiResponse) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(resp)?)
    }
}

/// One media range from an `Accept` header.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptClause {
    pub kind: String,
    pub subtype: String,
    pub q: f32,
}

/// Parse an `Accept` header into clauses, best first. Ties keep header
/// order. Clauses with `q=0` are dropped.
pub fn parse_accept(header: &str) -> Vec<AcceptClause> {
    let mut clauses = Vec::new();
    for part in header.split(',') {
        let mut pieces = part.split(';');
        let range = pieces.next().unwrap_or_default().trim();
        if range.is_empty() {
            continue;
        }
        let (kind, subtype) = match range.split_once('/') {
            Some((k, s)) => (k.trim(), s.trim()),
            // A bare "*" is sent by some clients.
            None if range == "*" => ("*", "*"),
            None => continue,
        };

        let mut q = 1.0f32;
        for param in pieces {
            if let Some((k, v)) = param.split_once('=') {
                if k.trim().eq_ignore_ascii_case("q") {
                    q = v.trim().parse().unwrap_or(0.0);
                }
            }
        }
        if q <= 0.0 {
            continue;
        }
        clauses.push(AcceptClause {
            kind: kind.to_string(),
            subtype: subtype.to_string(),
            q,
        });
    }
    clauses.sort_by(|a, b| b.q.partial_cmp(&a.q).unwrap_or(std::cmp::Ordering::Equal));
    clauses
}

/// Codecs in priority order; the first one is the fallback.
///
/// Mutate only while setting the server up.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// A registry holding only the JSON codec.
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.install(Arc::new(JsonCodec));
        registry
    }

    pub fn install(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.push(codec);
    }

    /// Remove every codec, including the default JSON one.
    pub fn clear(&mut self) {
        self.codecs.clear();
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Pick a codec for `resp`. The first registered codec that satisfies
    /// the best matching clause and can encode the response wins. Without a
    /// match the default codec is used, if it can encode the response.
    pub fn negotiate(&self, accept: &str, resp: &ApiResponse) -> Result<Arc<dyn Codec>, ApiError> {
        for clause in parse_accept(accept) {
            for codec in &self.codecs {
                if codec.content_type().satisfies(&clause) && codec.can_encode(resp) {
                    return Ok(codec.clone());
                }
            }
        }

        let default = self
            .codecs
            .first()
            .ok_or_else(|| ApiError::not_acceptable("no codecs installed"))?;
        if !default.can_encode(resp) {
            return Err(ApiError::not_acceptable(format!(
                "cannot encode response as {}",
                default.content_type()
            )));
        }
        Ok(default.clone())
    }
}
