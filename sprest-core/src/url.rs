//! URL helpers shared by the composer, the hydration code and the batch codecs.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

/// Characters escaped inside a path segment. Parentheses, single quotes,
/// commas, `=` and `/` stay literal because OData method-call syntax needs them.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Characters escaped inside a query-string value.
const QUERY_VALUE: &AsciiSet = &PATH_SEGMENT.add(b'=').add(b';');

/// Join URL parts with single slashes.
///
/// Empty parts are skipped, backslashes become slashes, separators at the
/// joints are trimmed and runs of slashes are collapsed, except in the scheme
/// separator and inside quoted OData literals. A leading slash on the first
/// part is preserved.
pub fn combine<S: AsRef<str>>(parts: &[S]) -> String {
    let mut pieces: Vec<String> = Vec::with_capacity(parts.len());
    let mut leading_slash = false;

    for (i, part) in parts.iter().enumerate() {
        let normalized = part.as_ref().trim().replace('\\', "/");
        if i == 0 && normalized.starts_with('/') && !normalized.starts_with("//") {
            leading_slash = true;
        }
        let trimmed = normalized.trim_matches('/');
        if !trimmed.is_empty() {
            pieces.push(trimmed.to_string());
        }
    }

    let mut joined = pieces.join("/");
    if leading_slash {
        joined.insert(0, '/');
    }
    collapse_slashes(&joined)
}

fn collapse_slashes(url: &str) -> String {
    let (prefix, rest) = match url.find("://") {
        Some(idx) if is_scheme(&url[..idx]) => url.split_at(idx + 3),
        _ => ("", url),
    };

    let mut out = String::with_capacity(url.len());
    out.push_str(prefix);
    let mut previous_slash = false;
    // `''` inside a literal toggles twice, so escaped quotes keep us inside.
    let mut in_literal = false;
    for c in rest.chars() {
        match c {
            '\'' => in_literal = !in_literal,
            '/' if !in_literal && previous_slash => continue,
            _ => {}
        }
        previous_slash = c == '/';
        out.push(c);
    }
    out
}

fn is_scheme(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
}

/// True for `http://`, `https://` and protocol-relative `//` URLs.
pub fn is_url_absolute(url: &str) -> bool {
    let lower = url.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("//")
}

/// The web URL that precedes `/_api/` or `/_vti_bin/`, or the input unchanged.
pub fn extract_web_url(url: &str) -> &str {
    let lower = url.to_ascii_lowercase();
    for marker in ["/_api/", "/_vti_bin/"] {
        if let Some(idx) = lower.find(marker) {
            return &url[..idx];
        }
    }
    if lower.ends_with("/_api") {
        return &url[..url.len() - "/_api".len()];
    }
    url
}

/// Percent-escape a path segment, leaving OData call syntax intact.
///
/// Existing `%XX` escapes pass through unchanged, so literals rendered by
/// [`odata_string`] are not escaped twice.
pub fn escape_path_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(idx) = rest.find('%') {
        let (head, tail) = rest.split_at(idx);
        out.extend(utf8_percent_encode(head, PATH_SEGMENT));
        let escape = tail.as_bytes();
        if escape.len() >= 3 && escape[1].is_ascii_hexdigit() && escape[2].is_ascii_hexdigit() {
            out.push_str(&tail[..3]);
            rest = &tail[3..];
        } else {
            out.push_str("%25");
            rest = &tail[1..];
        }
    }
    out.extend(utf8_percent_encode(rest, PATH_SEGMENT));
    out
}

/// Percent-escape a query-string value.
pub fn escape_query_value(value: &str) -> String {
    utf8_percent_encode(value, QUERY_VALUE).to_string()
}

/// Characters a string literal escapes itself before the path escaping runs.
const LITERAL_VALUE: &AsciiSet = &PATH_SEGMENT.add(b'/');

/// Render an OData string literal: `O'Brien` becomes `'O''Brien'`.
///
/// The value is percent-escaped, `/` included, so a path separator in the
/// value can never be mistaken for one in the URL.
pub fn odata_string(value: &str) -> String {
    let quoted = value.replace('\'', "''");
    format!("'{}'", utf8_percent_encode(&quoted, LITERAL_VALUE))
}

/// Render an OData GUID literal.
pub fn odata_guid(value: &str) -> String {
    format!("guid'{}'", value.trim_matches(|c| c == '{' || c == '}'))
}
