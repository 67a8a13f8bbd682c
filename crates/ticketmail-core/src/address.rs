//! Email address helpers shared by routing, suppression and parsing.

/// Canonical form used for lookups: trimmed, angle brackets removed,
/// lowercased.
#[must_use]
pub fn normalize(address: &str) -> String {
    address
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_lowercase()
}

/// Split `local@domain`. Returns `None` unless there is exactly one `@`
/// with text on both sides.
#[must_use]
pub fn split(address: &str) -> Option<(&str, &str)> {
    let (local, domain) = address.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some((local, domain))
}

/// The plus-suffix of the local part, if any: `support+abc@x` → `abc`.
#[must_use]
pub fn plus_tag(address: &str) -> Option<&str> {
    let (local, _) = split(address)?;
    let (_, tag) = local.split_once('+')?;
    (!tag.is_empty()).then_some(tag)
}

/// Normalise a Message-ID to `<id>` form with a lowercased domain part.
///
/// Local parts are case sensitive and kept as is. Returns `None` for
/// blank input.
#[must_use]
pub fn normalize_message_id(raw: &str) -> Option<String> {
    let inner = raw
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim();
    if inner.is_empty() {
        return None;
    }
    Some(match inner.rsplit_once('@') {
        Some((local, domain)) => format!("<{local}@{}>", domain.to_lowercase()),
        None => format!("<{inner}>"),
    })
}

/// Pull every address out of a raw header value such as
/// `"Support" <support@acme.com>, other@acme.com`.
#[must_use]
pub fn extract_all(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|part| {
            let part = part.trim();
            let candidate = match (part.rfind('<'), part.rfind('>')) {
                (Some(start), Some(end)) if start < end => &part[start + 1..end],
                _ => part,
            };
            let candidate = normalize(candidate);
            split(&candidate).is_some().then_some(candidate)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_addresses() {
        assert_eq!(normalize("  <Bounced@Example.COM> "), "bounced@example.com");
    }

    #[test]
    fn splits_and_tags() {
        assert_eq!(split("a@b.c"), Some(("a", "b.c")));
        assert_eq!(split("a@@b"), None);
        assert_eq!(split("@b"), None);
        assert_eq!(plus_tag("support+abc123@acme.com"), Some("abc123"));
        assert_eq!(plus_tag("support+@acme.com"), None);
        assert_eq!(plus_tag("support@acme.com"), None);
    }

    #[test]
    fn message_ids_keep_local_case() {
        assert_eq!(
            normalize_message_id("ABC@Client.Example").as_deref(),
            Some("<ABC@client.example>")
        );
        assert_eq!(
            normalize_message_id(" <abc@client> ").as_deref(),
            Some("<abc@client>")
        );
        assert_eq!(normalize_message_id("<>"), None);
    }

    #[test]
    fn extracts_header_addresses() {
        assert_eq!(
            extract_all(r#""Support" <Support+T1@acme.com>, other@acme.com, junk"#),
            vec!["support+t1@acme.com", "other@acme.com"]
        );
    }
}
