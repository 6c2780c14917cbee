// Gateway — QR payloads
// The gateway returns QR images as base64, sometimes wrapped in a data URI
// (`data:image/png;base64,…`) and sometimes bare. Both normalise to QrImage.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{info, warn};
use serde::Serialize;

const DEFAULT_MIME: &str = "image/png";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QrImage {
    pub mime: String,
    /// Bare base64, no data-URI prefix.
    pub base64: String,
}

impl QrImage {
    /// Accepts prefixed or bare payloads. Returns `None` for empty input or
    /// anything that does not decode as base64.
    pub fn parse(payload: &str) -> Option<QrImage> {
        let payload = payload.trim();
        let (mime, data) = match payload.strip_prefix("data:") {
            Some(rest) => {
                let (header, data) = rest.split_once(',')?;
                let mime = header.strip_suffix(";base64")?;
                let mime = if mime.is_empty() { DEFAULT_MIME } else { mime };
                (mime.to_string(), data)
            }
            None => (DEFAULT_MIME.to_string(), payload),
        };
        if data.is_empty() || STANDARD.decode(data).is_err() {
            return None;
        }
        Some(QrImage { mime, base64: data.to_string() })
    }

    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.base64)
    }

    pub fn bytes(&self) -> Vec<u8> {
        // `parse` already proved the payload decodes.
        STANDARD.decode(&self.base64).unwrap_or_default()
    }
}

/// Extract the QR image from the various login response shapes:
///   { "base64": "data:image/..." }
///   { "qrcode": { "base64": "..." } }
///   { "qrcode": "data:image/..." }
///   { "image": "iVBOR..." }
pub fn extract_qr(resp: &serde_json::Value) -> Option<QrImage> {
    let candidate = resp["base64"]
        .as_str()
        .or_else(|| resp["qrcode"]["base64"].as_str())
        .or_else(|| resp["qrcode"].as_str())
        .or_else(|| resp["image"].as_str());

    match candidate.and_then(QrImage::parse) {
        Some(qr) => {
            info!("[gateway] QR extracted ({} bytes, {})", qr.base64.len(), qr.mime);
            Some(qr)
        }
        None => {
            let keys = resp.as_object().map(|o| o.keys().cloned().collect::<Vec<_>>());
            warn!("[gateway] QR extraction found no usable payload, keys: {:?}", keys);
            None
        }
    }
}
