//! Source-text normalization for fingerprinting, plus script heuristics shared
//! by the rate limiter's token estimate and the line formatter.

/// Collapse whitespace runs to a single space and trim both ends.
/// Two inputs that differ only in spacing or line breaks normalize equally.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Normalize each context line; blank lines are dropped, order is kept.
pub fn normalize_context(context: &[String]) -> Vec<String> {
    context
        .iter()
        .map(|line| normalize_text(line))
        .filter(|line| !line.is_empty())
        .collect()
}

/// CJK ideographs, kana, hangul and full-width forms.
pub fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF      // hiragana, katakana
        | 0x3400..=0x4DBF    // CJK extension A
        | 0x4E00..=0x9FFF    // CJK unified ideographs
        | 0xAC00..=0xD7AF    // hangul syllables
        | 0xF900..=0xFAFF    // CJK compatibility ideographs
        | 0xFF00..=0xFFEF    // half/full-width forms
        | 0x3000..=0x303F    // CJK symbols and punctuation
    )
}

/// True when more than half of the non-whitespace characters are CJK.
pub fn is_mostly_cjk(text: &str) -> bool {
    let mut total = 0usize;
    let mut cjk = 0usize;
    for c in text.chars().filter(|c| !c.is_whitespace()) {
        total += 1;
        if is_cjk(c) {
            cjk += 1;
        }
    }
    total > 0 && cjk * 2 > total
}
