use sha2::{Digest, Sha256};

const TRUE_WORDS: [&str; 4] = ["1", "true", "yes", "on"];
const FALSE_WORDS: [&str; 4] = ["0", "false", "no", "off"];

/// Interprets the value of an on/off override such as
/// `UNITVISOR_REQUIRE_ALLOWLIST=yes`. Unrecognized words yield `None`.
pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    let word = raw.trim();
    if TRUE_WORDS.iter().any(|w| word.eq_ignore_ascii_case(w)) {
        Some(true)
    } else if FALSE_WORDS.iter().any(|w| word.eq_ignore_ascii_case(w)) {
        Some(false)
    } else {
        None
    }
}

/// On/off override from the environment; unset and unrecognized are both `None`.
pub fn env_bool(key: &str) -> Option<bool> {
    parse_bool_flag(&std::env::var(key).ok()?)
}

/// Read an environment variable as an unsigned integer; blank or malformed values are ignored.
pub fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
}

/// Lowercase hex SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
