//! Binary cache request handlers.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use futures::stream;
use nixfleet_core::{CacheInfo, CoreError, NarInfo, SecretKey};
use nixfleet_state::{AccessMarker, KeyValue, KvEntry, ObjectInfo, ObjectStore, StateError};
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};
use crate::upstream::Upstream;

pub const CONTENT_TYPE_NAR: &str = "application/x-nix-nar";
pub const CONTENT_TYPE_NARINFO: &str = "text/x-nix-narinfo";

/// Reads that lose the compare-and-swap race this many times give up.
const SIGN_ATTEMPTS: u32 = 3;

/// Shared state for cache handlers.
#[derive(Clone)]
pub struct CacheState {
    pub narinfo: KeyValue,
    pub access: KeyValue,
    pub nar: ObjectStore,
    pub key: Arc<SecretKey>,
    pub info: CacheInfo,
    pub upstream: Option<Upstream>,
}

/// Store hashes are lowercase base32, so anything else can't be in the cache.
fn valid_hash(hash: &str) -> bool {
    !hash.is_empty()
        && hash
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// `<hash>.narinfo` -> `<hash>`
fn narinfo_hash(file: &str) -> CacheResult<&str> {
    match file.strip_suffix(".narinfo") {
        Some(hash) if valid_hash(hash) => Ok(hash),
        _ => Err(CacheError::NotFound),
    }
}

/// `<hash>.nar.<compression>` -> `<hash>-<compression>`. A bare
/// `<hash>.nar` is stored with compression `none`.
fn nar_key(file: &str) -> CacheResult<String> {
    let (hash, compression) = match file.split_once(".nar.") {
        Some((hash, compression)) if !compression.is_empty() => (hash, compression),
        Some(_) => return Err(CacheError::NotFound),
        None => match file.strip_suffix(".nar") {
            Some(hash) => (hash, "none"),
            None => return Err(CacheError::NotFound),
        },
    };
    if !valid_hash(hash) {
        return Err(CacheError::NotFound);
    }
    Ok(format!("{hash}-{compression}"))
}

fn typed_headers(content_type: &'static str, length: u64) -> [(header::HeaderName, HeaderValue); 2] {
    [
        (header::CONTENT_TYPE, HeaderValue::from_static(content_type)),
        (header::CONTENT_LENGTH, HeaderValue::from(length)),
    ]
}

fn record_access(state: &CacheState, hash: &str) -> CacheResult<()> {
    state.access.put_json(hash, &AccessMarker::now())?;
    Ok(())
}

// ── Cache info ─────────────────────────────────────────────────────

/// GET /nix-cache-info
pub async fn cache_info(State(state): State<CacheState>) -> impl IntoResponse {
    let body = state.info.to_string();
    (
        typed_headers("text/x-nix-cache-info", body.len() as u64),
        body,
    )
}

// ── Narinfo ────────────────────────────────────────────────────────

/// GET|HEAD /{hash}.narinfo
///
/// Signs the document with this cache's key the first time it is served.
pub async fn get_narinfo(
    State(state): State<CacheState>,
    Path(file): Path<String>,
) -> CacheResult<Response> {
    let hash = narinfo_hash(&file)?;
    if state.narinfo.get(hash)?.is_none() {
        pull_narinfo(&state, hash).await?;
    }

    let mut accessed = false;
    for attempt in 1..=SIGN_ATTEMPTS {
        let Some(entry) = state.narinfo.get(hash)? else {
            return Err(CacheError::NotFound);
        };
        if !accessed {
            record_access(&state, hash)?;
            accessed = true;
        }

        match sign_entry(&state, hash, entry)? {
            Signing::Done(body) => return Ok(narinfo_response(body)),
            Signing::Conflict => {
                warn!(%hash, attempt, "narinfo changed while signing, retrying");
            }
        }
    }

    Err(CacheError::SignContention {
        hash: hash.to_string(),
        attempts: SIGN_ATTEMPTS,
    })
}

/// Result of one signing attempt.
#[derive(Debug, PartialEq, Eq)]
enum Signing {
    /// The document to serve, signed by this cache.
    Done(String),
    /// `entry` was no longer the stored revision.
    Conflict,
}

/// Sign `entry` unless this cache already did, writing the signed
/// document back only if nothing changed since `entry` was read.
fn sign_entry(state: &CacheState, hash: &str, entry: KvEntry) -> CacheResult<Signing> {
    let text = String::from_utf8(entry.value).map_err(|e| CoreError::NarInfo(e.to_string()))?;
    let mut info = NarInfo::parse(&text)?;
    if info.is_signed_by(state.key.name()) {
        return Ok(Signing::Done(info.to_string()));
    }

    info.add_signature(state.key.sign(info.fingerprint().as_bytes()));
    let body = info.to_string();
    match state.narinfo.update(hash, body.as_bytes(), entry.revision) {
        Ok(_) => {
            debug!(%hash, signer = state.key.name(), "narinfo signed");
            Ok(Signing::Done(body))
        }
        Err(StateError::Conflict { .. }) => Ok(Signing::Conflict),
        Err(e) => Err(e.into()),
    }
}

/// Copy a narinfo from upstream, if there is one and it has the hash.
async fn pull_narinfo(state: &CacheState, hash: &str) -> CacheResult<()> {
    let Some(upstream) = &state.upstream else {
        return Ok(());
    };
    let Some(body) = upstream.narinfo(hash).await? else {
        return Ok(());
    };
    match state.narinfo.create(hash, &body) {
        Ok(_) => {
            debug!(%hash, upstream = upstream.url(), "narinfo pulled");
            Ok(())
        }
        // Someone else stored it first.
        Err(StateError::Conflict { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn narinfo_response(body: String) -> Response {
    (typed_headers(CONTENT_TYPE_NARINFO, body.len() as u64), body).into_response()
}

/// PUT /{hash}.narinfo
///
/// Stored as-is. Validation happens when the document is first served.
pub async fn put_narinfo(
    State(state): State<CacheState>,
    Path(file): Path<String>,
    body: Bytes,
) -> CacheResult<StatusCode> {
    let hash = narinfo_hash(&file)?;
    state.narinfo.put(hash, &body)?;
    record_access(&state, hash)?;
    debug!(%hash, size = body.len(), "narinfo stored");
    Ok(StatusCode::OK)
}

// ── Nar ────────────────────────────────────────────────────────────

/// HEAD /nar/{hash}.nar.{compression}
pub async fn head_nar(
    State(state): State<CacheState>,
    Path(file): Path<String>,
) -> CacheResult<Response> {
    let key = nar_key(&file)?;
    let info = nar_info(&state, &file, &key).await?;
    Ok(typed_headers(CONTENT_TYPE_NAR, info.size).into_response())
}

/// GET /nar/{hash}.nar.{compression}
///
/// Streams the blob chunk by chunk. A chunk that can't be read aborts the
/// body after the headers went out; the client sees a short, failed read.
pub async fn get_nar(
    State(state): State<CacheState>,
    Path(file): Path<String>,
) -> CacheResult<Response> {
    let key = nar_key(&file)?;
    let info = nar_info(&state, &file, &key).await?;

    let nar = state.nar.clone();
    let chunks = stream::iter(0..info.chunks).map(move |index| {
        match nar.chunk(&key, index) {
            Ok(Some(chunk)) => Ok(Bytes::from(chunk)),
            Ok(None) => Err(StateError::NotFound(format!("chunk {index} of '{key}'"))),
            Err(e) => Err(e),
        }
    });

    Ok((
        typed_headers(CONTENT_TYPE_NAR, info.size),
        Body::from_stream(chunks),
    )
        .into_response())
}

/// Metadata of the nar stored under `key`, pulled from upstream on a miss.
async fn nar_info(state: &CacheState, file: &str, key: &str) -> CacheResult<ObjectInfo> {
    if let Some(info) = state.nar.info(key)? {
        return Ok(info);
    }
    let Some(upstream) = &state.upstream else {
        return Err(CacheError::NotFound);
    };
    let body = upstream.nar(file).await?.ok_or(CacheError::NotFound)?;
    let info = state.nar.put(key, &body)?;
    debug!(%key, size = info.size, upstream = upstream.url(), "nar pulled");
    Ok(info)
}

/// PUT /nar/{hash}.nar.{compression}
pub async fn put_nar(
    State(state): State<CacheState>,
    Path(file): Path<String>,
    body: Bytes,
) -> CacheResult<StatusCode> {
    let key = nar_key(&file)?;
    let info = state.nar.put(&key, &body)?;
    debug!(%key, size = info.size, chunks = info.chunks, "nar stored");
    Ok(StatusCode::OK)
}
