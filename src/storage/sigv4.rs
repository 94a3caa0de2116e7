//! AWS Signature Version 4
//!
//! Header signing for backend API calls and query signing for presigned URLs.
//! See <https://docs.aws.amazon.com/general/latest/gr/signature-version-4.html>.

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

/// Payload hash used when the body is not covered by the signature
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Static access key pair
#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Request pieces that go into the canonical request
#[derive(Debug, Clone)]
pub struct SignableRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    /// Unencoded absolute path, e.g. `/bucket/some key`
    pub path: &'a str,
    pub query: &'a [(String, String)],
    /// Additional headers to cover with the signature
    pub headers: &'a [(String, String)],
    pub payload_hash: &'a str,
}

/// SigV4 signer bound to one credential pair and region
#[derive(Debug, Clone)]
pub struct Signer {
    credentials: Credentials,
    region: String,
}

impl Signer {
    pub fn new(credentials: Credentials, region: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
        }
    }

    /// Produce the headers to attach to a request: `x-amz-date`,
    /// `x-amz-content-sha256` and `authorization`.
    pub fn sign(&self, request: &SignableRequest<'_>, now: DateTime<Utc>) -> Result<Vec<(String, String)>> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        headers.insert("host".into(), request.host.to_string());
        headers.insert("x-amz-date".into(), amz_date.clone());
        headers.insert("x-amz-content-sha256".into(), request.payload_hash.to_string());
        for (name, value) in request.headers {
            headers.insert(name.to_ascii_lowercase(), value.trim().to_string());
        }

        let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{}:{}\n", name, value))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            request.method,
            uri_encode(request.path, false),
            canonical_query_string(request.query),
            canonical_headers,
            signed_headers,
            request.payload_hash
        );

        let scope = self.credential_scope(&date);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signature = self.signature(&date, &string_to_sign)?;

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.credentials.access_key, scope, signed_headers, signature
        );

        Ok(vec![
            ("x-amz-date".to_string(), amz_date),
            ("x-amz-content-sha256".to_string(), request.payload_hash.to_string()),
            ("authorization".to_string(), authorization),
        ])
    }

    /// Build a presigned URL. Only the `host` header is signed and the
    /// payload is unsigned, so any client can use the URL as-is.
    pub fn presign_url(
        &self,
        method: &str,
        endpoint: &str,
        path: &str,
        expires_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let host = extract_host(endpoint)?;
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = self.credential_scope(&date);

        let query = vec![
            ("X-Amz-Algorithm".to_string(), ALGORITHM.to_string()),
            (
                "X-Amz-Credential".to_string(),
                format!("{}/{}", self.credentials.access_key, scope),
            ),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-Expires".to_string(), expires_secs.to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        let canonical_query = canonical_query_string(&query);
        let encoded_path = uri_encode(path, false);

        let canonical_request = format!(
            "{}\n{}\n{}\nhost:{}\n\nhost\n{}",
            method, encoded_path, canonical_query, host, UNSIGNED_PAYLOAD
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signature = self.signature(&date, &string_to_sign)?;

        Ok(format!(
            "{}{}?{}&X-Amz-Signature={}",
            endpoint.trim_end_matches('/'),
            encoded_path,
            canonical_query,
            signature
        ))
    }

    fn credential_scope(&self, date: &str) -> String {
        format!("{}/{}/{}/aws4_request", date, self.region, SERVICE)
    }

    fn signature(&self, date: &str, string_to_sign: &str) -> Result<String> {
        let secret = format!("AWS4{}", self.credentials.secret_key);
        let k_date = hmac_sha256(secret.as_bytes(), date.as_bytes())?;
        let k_region = hmac_sha256(&k_date, self.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, SERVICE.as_bytes())?;
        let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
        Ok(hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?))
    }
}

/// Hex-encoded SHA-256 of a payload
pub fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| Error::Signing(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Percent-encode everything outside the unreserved set, optionally keeping `/`
pub fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => {
                let _ = write!(out, "%{:02X}", byte);
            }
        }
    }
    out
}

/// Sorted, encoded `k=v` pairs joined with `&`
pub fn canonical_query_string(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
        .collect();
    encoded.sort();
    encoded
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// `host[:port]` part of an endpoint URL
pub fn extract_host(endpoint: &str) -> Result<String> {
    let host = endpoint
        .strip_prefix("http://")
        .or_else(|| endpoint.strip_prefix("https://"))
        .unwrap_or(endpoint);
    let host = host.split('/').next().unwrap_or(host);

    if host.is_empty() {
        return Err(Error::Config(format!("invalid endpoint: {:?}", endpoint)));
    }
    Ok(host.to_string())
}
