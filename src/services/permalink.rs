//! Permalink generation.
//!
//! Maps file paths and titles to stable, URL-safe identifiers. Accented
//! Latin letters are transliterated to ASCII; other scripts are kept as-is
//! and separated from adjacent ASCII runs by a hyphen.
//!
//! Applying [`generate_permalink`] to its own output returns it unchanged.

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Longest suffix treated as a file extension.
const MAX_EXTENSION_LEN: usize = 8;

/// Letters with no canonical decomposition to an ASCII base.
fn transliterate_special(c: char) -> Option<&'static str> {
    let mapped = match c {
        'ß' => "ss",
        'ẞ' => "SS",
        'æ' => "ae",
        'Æ' => "AE",
        'œ' => "oe",
        'Œ' => "OE",
        'ø' => "o",
        'Ø' => "O",
        'ł' => "l",
        'Ł' => "L",
        'đ' => "d",
        'Đ' => "D",
        'ð' => "d",
        'Ð' => "D",
        'þ' => "th",
        'Þ' => "TH",
        'ı' => "i",
        'ħ' => "h",
        'Ħ' => "H",
        'ŋ' => "ng",
        'Ŋ' => "NG",
        'ə' => "e",
        'Ə' => "E",
        'ɛ' => "e",
        'Ɛ' => "E",
        'ɔ' => "o",
        'Ɔ' => "O",
        'ŧ' => "t",
        'Ŧ' => "T",
        'ĸ' => "k",
        'ſ' => "s",
        'ƒ' => "f",
        'ȷ' => "j",
        _ => return None,
    };
    Some(mapped)
}

const fn is_apostrophe(c: char) -> bool {
    matches!(c, '\'' | '\u{2018}' | '\u{2019}' | '`')
}

/// Non-ASCII characters that survive normalization.
fn is_preserved(c: char) -> bool {
    !c.is_ascii() && c.is_alphanumeric()
}

/// Removes a trailing file extension from the last path segment.
///
/// Only short alphanumeric suffixes containing a letter count, so
/// `v1.2` and `Dr. Smith` are left alone.
fn strip_extension(path: &str) -> &str {
    let segment_start = path.rfind('/').map_or(0, |i| i + 1);
    let segment = &path[segment_start..];
    let Some(dot) = segment.rfind('.') else {
        return path;
    };
    if dot == 0 {
        return path;
    }
    let ext = &segment[dot + 1..];
    let is_extension = !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.chars().all(|c| c.is_ascii_alphanumeric())
        && ext.chars().any(|c| c.is_ascii_alphabetic());
    if is_extension {
        &path[..segment_start + dot]
    } else {
        path
    }
}

/// Transliterates one character, pushing the result onto `out`.
fn transliterate_into(c: char, out: &mut Vec<char>) {
    if is_apostrophe(c) {
        return;
    }
    if c.is_ascii() {
        out.push(c);
        return;
    }
    if let Some(mapped) = transliterate_special(c) {
        out.extend(mapped.chars());
        return;
    }
    let mut decomposed = std::iter::once(c).nfd();
    let base = decomposed.next();
    let rest_are_marks = decomposed.all(is_combining_mark);
    match base {
        Some(base) if base.is_ascii_alphanumeric() && rest_are_marks => out.push(base),
        _ if is_combining_mark(c) && !c.is_alphanumeric() => {},
        _ => out.push(c),
    }
}

/// Generates a permalink from a path or title.
///
/// The output contains only lowercase ASCII letters, digits, `-`, `/` and
/// non-ASCII letters or digits from other scripts. It may be empty if the
/// input has no usable characters.
///
/// # Examples
///
/// ```
/// use notegraph::generate_permalink;
///
/// assert_eq!(generate_permalink("Specs/Search Design.md"), "specs/search-design");
/// assert_eq!(generate_permalink("notes/Café Crème"), "notes/cafe-creme");
/// assert_eq!(generate_permalink("specs/search-design"), "specs/search-design");
/// ```
#[must_use]
pub fn generate_permalink(input: &str) -> String {
    let path = input.trim().replace('\\', "/");
    let stem = strip_extension(&path);

    let mut chars = Vec::with_capacity(stem.len());
    for c in stem.chars() {
        transliterate_into(c, &mut chars);
    }

    let mut separated = String::with_capacity(chars.len() + 8);
    let mut prev: Option<char> = None;
    for &c in &chars {
        if let Some(p) = prev {
            let camel = (p.is_ascii_lowercase() || p.is_ascii_digit()) && c.is_ascii_uppercase();
            let script = (p.is_ascii_alphanumeric() && is_preserved(c))
                || (is_preserved(p) && c.is_ascii_alphanumeric());
            if camel || script {
                separated.push('-');
            }
        }
        let mapped = match c {
            '/' | '-' => c,
            c if c.is_ascii_alphanumeric() => c.to_ascii_lowercase(),
            c if is_preserved(c) => c,
            _ => '-',
        };
        separated.push(mapped);
        prev = Some(c);
    }

    separated
        .split('/')
        .map(collapse_hyphens)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Collapses hyphen runs and trims hyphens from both ends.
fn collapse_hyphens(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for c in segment.chars() {
        if c == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(c);
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Normalizes a free-form entity type to `snake_case`.
///
/// Returns `note` for inputs without usable characters.
#[must_use]
pub fn normalize_entity_type(entity_type: &str) -> String {
    let normalized = generate_permalink(&entity_type.replace(['/', '.'], " ")).replace('-', "_");
    if normalized.is_empty() {
        crate::models::DEFAULT_ENTITY_TYPE.to_string()
    } else {
        normalized
    }
}

/// Returns the permalink with a numeric disambiguation suffix.
#[must_use]
pub fn disambiguated_permalink(base: &str, suffix: u32) -> String {
    format!("{base}-{suffix}")
}

/// Returns true if `permalink` is `base` or `base` with a numeric
/// disambiguation suffix.
#[must_use]
pub fn is_derived_permalink(permalink: &str, base: &str) -> bool {
    permalink == base
        || permalink
            .strip_prefix(base)
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("Search Design.md", "search-design"; "strips extension and spaces")]
    #[test_case("specs/Search_Design", "specs/search-design"; "underscore to hyphen")]
    #[test_case("notes/camelCaseTitle", "notes/camel-case-title"; "camel case boundaries")]
    #[test_case("v2Release", "v2-release"; "digit to upper boundary")]
    #[test_case("Café Crème", "cafe-creme"; "accented latin")]
    #[test_case("Straße", "strasse"; "explicit map")]
    #[test_case("Łódź", "lodz"; "mixed map and decomposition")]
    #[test_case("Don't Panic", "dont-panic"; "apostrophe removed")]
    #[test_case("Don\u{2019}t Panic", "dont-panic"; "curly apostrophe removed")]
    #[test_case("  --Hello,   World!!--  ", "hello-world"; "punctuation collapses")]
    #[test_case("/a//b/", "a/b"; "empty segments dropped")]
    #[test_case("-a-/-b-", "a/b"; "segments trimmed")]
    #[test_case("日本語ノート", "日本語ノート"; "cjk preserved")]
    #[test_case("Rust日本語", "rust-日本語"; "latin to cjk boundary")]
    #[test_case("日本Notes", "日本-notes"; "cjk to latin boundary")]
    #[test_case("v1.2", "v1-2"; "numeric suffix is not an extension")]
    #[test_case("Dr. Smith", "dr-smith"; "dot with spaces is not an extension")]
    #[test_case(".hidden", "hidden"; "leading dot")]
    #[test_case("e\u{301}clair", "eclair"; "decomposed accent")]
    #[test_case("Ŋoŋo", "ngongo"; "eng without decomposition")]
    #[test_case("Azərbaycan", "azerbaycan"; "schwa without decomposition")]
    #[test_case("Ɔkɛ", "oke"; "open vowels")]
    #[test_case("C:\\notes\\Draft.md", "c/notes/draft"; "backslashes")]
    #[test_case("!!!", ""; "nothing usable")]
    fn test_generate_permalink(input: &str, expected: &str) {
        assert_eq!(generate_permalink(input), expected);
    }

    #[test_case("search-design"; "single segment")]
    #[test_case("specs/search-design"; "nested")]
    #[test_case("rust-日本語/notes"; "mixed script")]
    #[test_case("a-1/b-2"; "digits")]
    fn test_normalized_permalinks_are_fixed_points(permalink: &str) {
        assert_eq!(generate_permalink(permalink), permalink);
    }

    #[test_case("Technical Spec", "technical_spec"; "spaces")]
    #[test_case("meetingNote", "meeting_note"; "camel case")]
    #[test_case("note", "note"; "already normalized")]
    #[test_case("???", "note"; "fallback")]
    fn test_normalize_entity_type(input: &str, expected: &str) {
        assert_eq!(normalize_entity_type(input), expected);
    }

    #[test]
    fn test_disambiguated_permalink() {
        assert_eq!(disambiguated_permalink("notes/a", 2), "notes/a-2");
    }

    #[test_case("same", "same", true; "base itself")]
    #[test_case("same-1", "same", true; "numeric suffix")]
    #[test_case("same-12", "same", true; "multi digit suffix")]
    #[test_case("same-x", "same", false; "non numeric suffix")]
    #[test_case("same-", "same", false; "empty suffix")]
    #[test_case("sameness", "same", false; "longer word")]
    #[test_case("other-1", "same", false; "different base")]
    fn test_is_derived_permalink(permalink: &str, base: &str, expected: bool) {
        assert_eq!(is_derived_permalink(permalink, base), expected);
    }
}
