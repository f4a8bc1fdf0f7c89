use base64::{engine::general_purpose::STANDARD, Engine as _};

const DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Fallback served whenever a server exposes no favicon of its own.
pub static DEFAULT_ICON: &[u8] = include_bytes!("../../assets/icon.png");

/// Decode a status favicon data URL into PNG bytes, falling back to the
/// default icon when the field is missing or unreadable.
pub fn icon_bytes(favicon: Option<&str>) -> Vec<u8> {
    let Some(favicon) = favicon else {
        return DEFAULT_ICON.to_vec();
    };

    let b64 = favicon.strip_prefix(DATA_URL_PREFIX).unwrap_or(favicon);
    match STANDARD.decode(b64.trim()) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::debug!(err = %err, "icon: favicon decode failed, using default");
            DEFAULT_ICON.to_vec()
        }
    }
}
