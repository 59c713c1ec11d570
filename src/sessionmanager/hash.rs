use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Salted hash of a session id, used as the stable session key and to keep
/// raw ids out of logs. This is not authentication.
///
/// The empty id maps to the literal `"none"` so requests without a session
/// header still share one well-known session.
pub fn session_hash(session_id: &str, salt: &str) -> String {
    if session_id.is_empty() {
        return "none".to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();

    STANDARD.encode(digest).trim_end_matches('=').to_string()
}
