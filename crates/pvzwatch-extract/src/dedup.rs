use sha2::{Digest, Sha256};

/// Level-1 dedup key: SHA-256 over normalized `{price}|{location}|{text}`.
///
/// The author is deliberately excluded: one offer is routinely reposted
/// from a channel, as a forward, or through a bot, each with a different
/// sender identity. The work date is excluded too: the same text posted for
/// a different day is an update, not a duplicate (the store checks the date
/// separately, within the 24 h window).
pub fn content_hash(price: Option<i64>, location: Option<&str>, message_text: &str) -> String {
    let loc = location
        .map(|l| l.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    let text = message_text.trim().to_lowercase();
    let price_str = price.map(|p| p.to_string()).unwrap_or_default();

    let content = format!("{price_str}|{loc}|{text}");

    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Level-2 dedup key: `author|work_date|price`.
///
/// Never persisted: the store evaluates the same tuple against the table
/// directly. A changed price or a changed work date produces a new key, so
/// the same author re-announcing different terms notifies again, while
/// verbatim cross-posts within 24 h are suppressed.
pub fn author_key(author_username: &str, work_date: &str, price: Option<i64>) -> String {
    let price_key = price.map(|p| p.to_string()).unwrap_or_default();
    format!("{author_username}|{work_date}|{price_key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_author_and_whitespace_case() {
        let a = content_hash(Some(2600), Some("Красногорск"), "  Нужен сотрудник  ");
        let b = content_hash(Some(2600), Some("красногорск"), "нужен сотрудник");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_changes_with_price() {
        let a = content_hash(Some(2600), None, "нужен сотрудник");
        let b = content_hash(Some(3000), None, "нужен сотрудник");
        assert_ne!(a, b);
    }

    #[test]
    fn missing_location_normalizes_to_unknown() {
        let a = content_hash(Some(2600), None, "текст");
        let b = content_hash(Some(2600), Some("unknown"), "текст");
        assert_eq!(a, b);
    }

    #[test]
    fn author_key_distinguishes_date_and_price() {
        let base = author_key("ivan", "2026-02-03", Some(3000));
        assert_ne!(base, author_key("ivan", "2026-02-03", Some(2500)));
        assert_ne!(base, author_key("ivan", "2026-02-05", Some(3000)));
        assert_eq!(base, author_key("ivan", "2026-02-03", Some(3000)));
    }
}
