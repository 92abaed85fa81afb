//! Broker endpoint helpers

use url::Url;

const MASK: &str = "xxxxx";

/// Replace the password of a broker URL so it can be logged or traced.
///
/// Strings that do not parse as a URL, or carry no password, are returned as-is.
pub fn mask_password_url(raw: &str) -> String {
    let mut parsed = match Url::parse(raw) {
        Ok(url) => url,
        Err(_) => return raw.to_string(),
    };

    if parsed.password().is_none() {
        return raw.to_string();
    }

    match parsed.set_password(Some(MASK)) {
        Ok(()) => parsed.to_string(),
        Err(()) => raw.to_string(),
    }
}
