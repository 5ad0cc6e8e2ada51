use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use photo3d_contracts::{GenerationError, GenerationResult};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "TC3-HMAC-SHA256";
const SIGNED_HEADERS: &str = "content-type;host";
pub(crate) const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// The parts of an outgoing call a signer may bind into its signature.
#[derive(Debug, Clone, Copy)]
pub struct SignableRequest<'a> {
    pub host: &'a str,
    pub service: &'a str,
    pub payload: &'a [u8],
    pub timestamp: i64,
}

/// Produces the authentication headers for a vendor call. Adapters treat
/// the result as opaque and attach it verbatim.
pub trait RequestSigner: Send + Sync {
    fn sign(&self, request: &SignableRequest<'_>) -> GenerationResult<Vec<(String, String)>>;
}

/// Tencent Cloud API v3 signature over a JSON POST to `/`.
pub struct Tc3Signer {
    secret_id: String,
    secret_key: String,
}

impl Tc3Signer {
    pub fn new(secret_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            secret_id: secret_id.into(),
            secret_key: secret_key.into(),
        }
    }

    fn signature(&self, request: &SignableRequest<'_>, date: &str) -> GenerationResult<String> {
        let canonical_request = format!(
            "POST\n/\n\ncontent-type:{JSON_CONTENT_TYPE}\nhost:{}\n\n{SIGNED_HEADERS}\n{}",
            request.host,
            sha256_hex(request.payload)
        );
        let scope = format!("{date}/{}/tc3_request", request.service);
        let string_to_sign = format!(
            "{ALGORITHM}\n{}\n{scope}\n{}",
            request.timestamp,
            sha256_hex(canonical_request.as_bytes())
        );
        let secret_date = hmac_sha256(format!("TC3{}", self.secret_key).as_bytes(), date.as_bytes())?;
        let secret_service = hmac_sha256(&secret_date, request.service.as_bytes())?;
        let secret_signing = hmac_sha256(&secret_service, b"tc3_request")?;
        Ok(hex::encode(hmac_sha256(&secret_signing, string_to_sign.as_bytes())?))
    }
}

impl RequestSigner for Tc3Signer {
    fn sign(&self, request: &SignableRequest<'_>) -> GenerationResult<Vec<(String, String)>> {
        let date = Utc
            .timestamp_opt(request.timestamp, 0)
            .single()
            .ok_or_else(|| {
                GenerationError::InvalidRequest(format!("invalid signing timestamp {}", request.timestamp))
            })?
            .format("%Y-%m-%d")
            .to_string();
        let signature = self.signature(request, &date)?;
        let authorization = format!(
            "{ALGORITHM} Credential={}/{date}/{}/tc3_request, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
            self.secret_id, request.service
        );
        Ok(vec![
            ("Authorization".to_string(), authorization),
            ("X-TC-Timestamp".to_string(), request.timestamp.to_string()),
        ])
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> GenerationResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| GenerationError::Configuration(format!("invalid signing key: {err}")))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}
