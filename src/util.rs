use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix timestamp in whole seconds.
pub fn now_ts_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current unix timestamp in milliseconds.
pub fn now_ts_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// ISO-8601 UTC timestamp for record fields that carry wall-clock time.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Fresh UUID v4 string for record ids.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Mask API-key-like substrings before a message reaches logs or the UI.
/// Anything shaped like `sk-…` or `sk_live_…` with a long tail is collapsed.
pub fn mask_secrets(text: &str) -> String {
    static KEY_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = KEY_RE.get_or_init(|| {
        regex::Regex::new(r"sk[-_][A-Za-z0-9_\-]{8,}").expect("secret mask regex")
    });
    re.replace_all(text, "sk-***").into_owned()
}

/// Truncate to `max` characters on a char boundary, appending an ellipsis.
pub fn truncate_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let prefix: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{prefix}...")
}

/// Last two path segments of a file path, for short tool descriptions.
pub fn short_path(path: &str) -> String {
    let mut parts: Vec<&str> = path.split(['/', '\\']).filter(|s| !s.is_empty()).collect();
    if parts.len() <= 2 {
        return parts.join("/");
    }
    let tail = parts.split_off(parts.len() - 2);
    tail.join("/")
}

/// Stable 64-bit FNV-1a hash, used for cache keys and project ids.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secrets() {
        let masked = mask_secrets("key is sk_live_abcdefghij1234567890 ok");
        assert_eq!(masked, "key is sk-*** ok");
        assert_eq!(mask_secrets("no secrets here"), "no secrets here");
        assert_eq!(mask_secrets("sk-proj-aaaabbbbcccc"), "sk-***");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdefghij", 8), "abcde...");
    }

    #[test]
    fn test_short_path() {
        assert_eq!(short_path("/a/b/c/d.rs"), "c/d.rs");
        assert_eq!(short_path("d.rs"), "d.rs");
        assert_eq!(short_path("b/d.rs"), "b/d.rs");
    }

    #[test]
    fn test_fnv_stable() {
        assert_eq!(fnv1a_64(b"abc"), fnv1a_64(b"abc"));
        assert_ne!(fnv1a_64(b"abc"), fnv1a_64(b"abd"));
    }
}
