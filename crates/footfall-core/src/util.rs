use url::Url;

/// Derives the registry key (hostname) for a target URL.
///
/// Returns the parsed host without port when `raw` is a real URL, and the
/// raw input unchanged otherwise — bare-hostname DNS targets key on
/// themselves. Deterministic and total: every string maps to exactly one
/// key.
pub fn hostname_of(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(url) => match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => raw.to_string(),
        },
        Err(_) => raw.to_string(),
    }
}
