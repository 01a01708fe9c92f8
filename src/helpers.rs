use regex::Regex;

/// Replace characters that are unsafe in file names.
pub fn sanitize_filename(s: &str) -> String {
    s.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_")
}

/// Normalize a search query for use in a cache key: trimmed, lowercased,
/// inner whitespace collapsed.
pub fn normalize_query(query: &str) -> String {
    query
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fold a cache key into a name safe for the durable tier's files.
pub fn cache_file_name(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Try to build a "Vol.X Ch.Y - Title" label from a raw chapter string and
/// its URL slug, falling back to the raw string.
pub fn format_chapter_label(chapter_number: &str, chapter_url: &str) -> String {
    let mut vol: Option<String> = None;
    let mut ch: Option<String> = None;
    let mut title: Option<String> = None;

    let num_re = Regex::new(r"(?i)(?:ch(?:apter)?\s*)(\d+(?:\.\d+)?)").unwrap();
    let vol_re = Regex::new(r"(?i)(?:vol(?:ume)?\s*)(\d+)").unwrap();

    if let Some(cap) = num_re.captures(chapter_number) {
        ch = cap.get(1).map(|m| m.as_str().to_string());
    }
    if let Some(cap) = vol_re.captures(chapter_number) {
        vol = cap.get(1).map(|m| m.as_str().to_string());
    }
    if chapter_number.contains('-') {
        let parts: Vec<&str> = chapter_number.splitn(2, '-').collect();
        if parts.len() == 2 {
            let t = parts[1].trim();
            if !t.is_empty() {
                title = Some(t.to_string());
            }
        }
    }

    let lower_url = chapter_url.to_lowercase();
    if ch.is_none() {
        if let Some(cap) = Regex::new(r"chapter[-/](\d+(?:\.\d+)?)")
            .unwrap()
            .captures(&lower_url)
        {
            ch = cap.get(1).map(|m| m.as_str().to_string());
        }
    }
    if vol.is_none() {
        if let Some(cap) = Regex::new(r"vol(?:ume)?[-/](\d+)")
            .unwrap()
            .captures(&lower_url)
        {
            vol = cap.get(1).map(|m| m.as_str().to_string());
        }
    }

    let mut parts: Vec<String> = Vec::new();
    if let Some(v) = vol {
        parts.push(format!("Vol.{}", v));
    }
    if let Some(cn) = ch {
        parts.push(format!("Ch.{}", cn));
    }
    let base = if parts.is_empty() {
        chapter_number.to_string()
    } else {
        parts.join(" ")
    };
    match title {
        Some(t) => format!("{} - {}", base, t),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_filename("a/b:c?d"), "a_b_c_d");
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_query("  Solo   Leveling "), "solo leveling");
    }

    #[test]
    fn cache_file_name_is_filesystem_safe() {
        assert_eq!(
            cache_file_name("search:asurascans:solo leveling:1"),
            "search_asurascans_solo_leveling_1"
        );
    }

    #[test]
    fn chapter_label_from_number_and_url() {
        assert_eq!(
            format_chapter_label("Chapter 12 - The Gate", "https://x/chapter-12"),
            "Ch.12 - The Gate"
        );
        assert_eq!(format_chapter_label("oneshot", "https://x/extra"), "oneshot");
        assert_eq!(
            format_chapter_label("", "https://x/manga/vol-2/chapter-3.5"),
            "Vol.2 Ch.3.5"
        );
    }
}
