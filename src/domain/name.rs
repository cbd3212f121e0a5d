/// Normalizes a monitor name: lowercase, runs of non-alphanumerics become a
/// single underscore, leading/trailing underscores stripped.
pub fn normalize_monitor_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut pending_separator = false;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !normalized.is_empty() {
                normalized.push('_');
            }
            pending_separator = false;
            normalized.push(ch.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_collapses_separators() {
        assert_eq!(normalize_monitor_name("Disk Space"), "disk_space");
        assert_eq!(normalize_monitor_name("API -- latency"), "api_latency");
        assert_eq!(normalize_monitor_name("__edge__case__"), "edge_case");
        assert_eq!(normalize_monitor_name("already_normal"), "already_normal");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in ["Disk Space", "API -- latency", "weird\tname\n2", "a.b.c"] {
            let once = normalize_monitor_name(raw);
            assert_eq!(normalize_monitor_name(&once), once);
        }
    }

    #[test]
    fn strips_to_empty_when_nothing_remains() {
        assert_eq!(normalize_monitor_name("---"), "");
        assert_eq!(normalize_monitor_name(""), "");
    }
}
