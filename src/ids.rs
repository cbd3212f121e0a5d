use sha2::{Digest, Sha256};

/// Deterministic short hex digest; used to version monitor code blobs so
/// re-registration bumps only on real changes.
pub(crate) fn stable_hex_id(namespace: &str, key: &str) -> String {
    let payload = [namespace.trim(), key.trim()].join("|");
    let digest = Sha256::digest(payload.as_bytes());
    let hex = format!("{digest:x}");
    hex.chars().take(24).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digests_are_stable_and_namespaced() {
        let a = stable_hex_id("monitor-code", "fn search() {}");
        let b = stable_hex_id("monitor-code", "fn search() {}");
        let c = stable_hex_id("other", "fn search() {}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 24);
    }
}
