use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::config::Credentials;
use crate::error::ExchangeError;

type HmacSha256 = Hmac<Sha256>;

const WS_LOGIN_PATH: &str = "/users/self/verify";

/// Sign a request: base64(HMAC-SHA256(secret, timestamp + METHOD + path + body))
///
/// `path` includes the `/api/v5` prefix and any query string.
pub fn sign(
    secret: &str,
    timestamp: &str,
    method: &str,
    path: &str,
    body: &str,
) -> Result<String, ExchangeError> {
    let prehash = format!(
        "{}{}{}{}",
        timestamp,
        method.to_ascii_uppercase(),
        path,
        body
    );

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Signature(e.to_string()))?;
    mac.update(prehash.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// REST timestamp: ISO 8601 UTC with milliseconds, e.g. `2020-12-08T09:08:57.715Z`
pub fn rest_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Login frame for the private WebSocket channel
pub fn ws_login_frame(credentials: &Credentials, unix_secs: i64) -> Result<Value, ExchangeError> {
    let timestamp = unix_secs.to_string();
    let signature = sign(&credentials.secret_key, &timestamp, "GET", WS_LOGIN_PATH, "")?;

    Ok(json!({
        "op": "login",
        "args": [{
            "apiKey": credentials.api_key,
            "passphrase": credentials.passphrase,
            "timestamp": timestamp,
            "sign": signature,
        }]
    }))
}
