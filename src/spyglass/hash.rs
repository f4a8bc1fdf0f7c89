use sha1::{Digest, Sha1};

/// Lowercase SHA-1 hex digest. Mojang's blocklist and the cache fingerprints
/// are both keyed on SHA-1, so this is the only digest the service carries.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Cache fingerprint for a status request.
///
/// Only options that affect the returned bytes participate: hostname, port,
/// and (for Java) whether the UDP query probe runs. Timeout is deliberately
/// excluded. The canonical form is URL-encoded with keys in fixed order, so
/// two processes always derive the same key.
pub fn fingerprint(host: &str, port: u16, query: Option<bool>) -> String {
    let mut form = form_urlencoded::Serializer::new(String::new());
    form.append_pair("hostname", host);
    form.append_pair("port", &port.to_string());
    if let Some(query) = query {
        form.append_pair("query", if query { "true" } else { "false" });
    }
    sha1_hex(form.finish().as_bytes())
}
