use crate::error::{Error, Result};
use url::Url;

/// Join two URL path segments with exactly one slash between them.
pub fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) if a.is_empty() => format!("/{b}"),
        (false, false) => format!("{a}/{b}"),
        _ if a.is_empty() => {
            if b.is_empty() {
                "/".to_string()
            } else {
                b.to_string()
            }
        }
        _ => format!("{a}{b}"),
    }
}

/// Parse a forward or replay base. Accepts `host:port` shorthand, which is assumed
/// to be plain http.
pub fn parse_base_url(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::validation("empty base url"));
    }
    let candidate = if !raw.contains("://") && raw.contains(':') {
        format!("http://{raw}")
    } else {
        raw.to_string()
    };
    let url = Url::parse(&candidate)
        .map_err(|e| Error::validation(format!("invalid base url {raw:?}: {e}")))?;
    if url.scheme().is_empty() || url.host_str().map_or(true, str::is_empty) {
        return Err(Error::validation(format!("invalid base url: {raw:?}")));
    }
    Ok(url)
}

/// Resolve a captured path and raw query against `base`.
pub fn resolve(base: &Url, path: &str, query: &str) -> Url {
    let mut url = base.clone();
    url.set_path(&single_joining_slash(base.path(), path));
    let query = query.strip_prefix('?').unwrap_or(query);
    url.set_query(if query.is_empty() { None } else { Some(query) });
    url
}

/// `host[:port]` of `url`, as sent in the Host header.
pub fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}
