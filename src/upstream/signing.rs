//! # Signed-URL Builder
//!
//! Both upstream services authenticate the WebSocket handshake through query
//! parameters carrying an HMAC signature over a time-stamped canonical string.
//! Timestamps are single-use on the upstream side, so a URL must be built for
//! every connection attempt; nothing here is cached.
//!
//! ## Schemes:
//! - **Recognition**: `signa = base64(HMAC-SHA1(api_key, hex(MD5(appid + ts))))`,
//!   sent as `?appid=..&ts=..&signa=..`
//! - **Synthesis**: `signature = base64(HMAC-SHA256(api_secret, "host: ..\ndate: ..\nGET <path> HTTP/1.1"))`,
//!   wrapped in a base64 `authorization` parameter next to `date` and `host`
//!
//! Both builders are deterministic for a given instant, which is what the tests rely on.

use crate::config::UpstreamConfig;
use crate::error::SessionError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use url::Url;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Signers for both upstream services, built once from validated configuration.
#[derive(Debug, Clone)]
pub struct UrlSigners {
    pub recognition: RecognitionSigner,
    pub synthesis: SynthesisSigner,
}

impl UrlSigners {
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, SessionError> {
        Ok(Self {
            recognition: RecognitionSigner::new(
                &config.recognition.url,
                &config.recognition.app_id,
                &config.recognition.api_key,
            )?,
            synthesis: SynthesisSigner::new(
                &config.synthesis.url,
                &config.synthesis.app_id,
                &config.synthesis.api_key,
                &config.synthesis.api_secret,
            )?,
        })
    }
}

/// Signs real-time transcription connections.
#[derive(Debug, Clone)]
pub struct RecognitionSigner {
    base: Url,
    app_id: String,
    api_key: String,
}

impl RecognitionSigner {
    pub fn new(base_url: &str, app_id: &str, api_key: &str) -> Result<Self, SessionError> {
        Ok(Self {
            base: parse_base_url(base_url)?,
            app_id: required("recognition app_id", app_id)?,
            api_key: required("recognition api_key", api_key)?,
        })
    }

    /// Build the connection URL for a handshake happening at `at`.
    pub fn signed_url(&self, at: DateTime<Utc>) -> Result<String, SessionError> {
        let ts = at.timestamp().to_string();
        let signa = self.signature(&ts)?;

        let mut url = self.base.clone();
        url.query_pairs_mut()
            .append_pair("appid", &self.app_id)
            .append_pair("ts", &ts)
            .append_pair("signa", &signa);
        Ok(url.into())
    }

    fn signature(&self, ts: &str) -> Result<String, SessionError> {
        let base_string = md5_hex(format!("{}{}", self.app_id, ts).as_bytes());
        let digest = hmac_sha1(self.api_key.as_bytes(), base_string.as_bytes())?;
        Ok(BASE64.encode(digest))
    }
}

/// Signs streaming synthesis connections.
#[derive(Debug, Clone)]
pub struct SynthesisSigner {
    base: Url,
    host: String,
    path: String,
    app_id: String,
    api_key: String,
    api_secret: String,
}

impl SynthesisSigner {
    pub fn new(base_url: &str, app_id: &str, api_key: &str, api_secret: &str) -> Result<Self, SessionError> {
        let base = parse_base_url(base_url)?;
        let host = match (base.host_str(), base.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(SessionError::Configuration(format!("upstream URL has no host: {}", base_url)))
            }
        };
        let path = base.path().to_string();

        Ok(Self {
            base,
            host,
            path,
            app_id: required("synthesis app_id", app_id)?,
            api_key: required("synthesis api_key", api_key)?,
            api_secret: required("synthesis api_secret", api_secret)?,
        })
    }

    /// The app id also travels inside every synthesis request frame.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Build the connection URL for a handshake happening at `at`.
    pub fn signed_url(&self, at: DateTime<Utc>) -> Result<String, SessionError> {
        let date = rfc1123(at);
        let canonical = canonical_request(&self.host, &date, &self.path);
        let signature = BASE64.encode(hmac_sha256(self.api_secret.as_bytes(), canonical.as_bytes())?);

        let authorization_origin = format!(
            "api_key=\"{}\", algorithm=\"hmac-sha256\", headers=\"host date request-line\", signature=\"{}\"",
            self.api_key, signature
        );
        let authorization = BASE64.encode(authorization_origin.as_bytes());

        let mut url = self.base.clone();
        url.query_pairs_mut()
            .append_pair("authorization", &authorization)
            .append_pair("date", &date)
            .append_pair("host", &self.host);
        Ok(url.into())
    }
}

/// The string the synthesis signature covers: host, date and request-line.
pub fn canonical_request(host: &str, date: &str, path: &str) -> String {
    format!("host: {}\ndate: {}\nGET {} HTTP/1.1", host, date, path)
}

/// HTTP-date as used in the `date` header, e.g. `Wed, 01 May 2024 08:30:00 GMT`.
pub fn rfc1123(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn parse_base_url(raw: &str) -> Result<Url, SessionError> {
    let url = Url::parse(raw).map_err(|e| SessionError::Configuration(format!("invalid upstream URL {}: {}", raw, e)))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(SessionError::Configuration(format!(
            "upstream URL must use ws:// or wss://: {}",
            raw
        )));
    }
    Ok(url)
}

fn required(name: &str, value: &str) -> Result<String, SessionError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(SessionError::Configuration(format!("missing {}", name)));
    }
    Ok(value.to_string())
}

fn md5_hex(data: &[u8]) -> String {
    use md5::{Digest, Md5};
    hex::encode(Md5::digest(data))
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SessionError> {
    let mut mac = HmacSha1::new_from_slice(key).map_err(|e| SessionError::Configuration(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SessionError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| SessionError::Configuration(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
