//! Display-line formatter for translated subtitle text.
//!
//! Pipeline: punctuation normalization → fit check → per-line smart split →
//! whole-paragraph reflow → overflow merge → hard truncation. Every step that
//! cannot honour the limits leaves a `FormatWarning` instead of failing.
//!
//! Split precedence inside one line:
//!   1. after strong punctuation, closest to the midpoint
//!   2. before a conjunction, closest to the midpoint
//!   3. at the whitespace nearest the limit
//!   4. between CJK characters, nearest the limit
//!
//! Ties in 1 and 2 go to the later position. Lengths are in chars.

use regex::Regex;
use serde::Serialize;

use crate::config::PunctuationStyle;
use crate::translate::normalize::is_cjk;

/// Break after these.
const STRONG_PUNCT: &[char] = &[
    '，', '、', '；', '：', '。', '！', '？', '⋯', ',', ';', ':', '!', '?',
];

/// Break before these.
const CJK_CONJUNCTIONS: &[&str] = &[
    "但是", "可是", "不過", "所以", "因為", "而且", "然後", "或者", "和", "與", "或",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatWarningKind {
    /// More lines than allowed; the overflow was merged into the last line.
    TooManyLines,
    /// A line was cut at the character limit.
    Truncated,
    /// Input lines were joined and re-split to fit the line budget.
    Reflowed,
    DoubledQuestion,
    DoubledExclamation,
    MixedQuestionExclamation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatWarning {
    pub kind: FormatWarningKind,
    /// Output line the warning refers to, if any.
    pub line: Option<usize>,
    pub detail: String,
}

impl FormatWarning {
    fn new(kind: FormatWarningKind, line: Option<usize>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            line,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormattedResult {
    pub lines: Vec<String>,
    pub was_modified: bool,
    pub warnings: Vec<FormatWarning>,
}

impl FormattedResult {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn has_warning(&self, kind: FormatWarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }
}

/// Pure formatter; holds only its punctuation convention and compiled patterns.
pub struct LineFormatter {
    style: PunctuationStyle,
    ellipsis: Regex,
    english_conjunction: Regex,
}

impl LineFormatter {
    pub fn new(style: PunctuationStyle) -> Self {
        Self {
            style,
            ellipsis: Regex::new(r"\.{3,}|…+|。{3,}|⋯+").unwrap(),
            english_conjunction: Regex::new(r"(?i)\b(?:and|but|or|because|so|then|which|while)\b")
                .unwrap(),
        }
    }

    pub fn style(&self) -> PunctuationStyle {
        self.style
    }

    /// Fit `text` into at most `max_lines` lines of `max_chars_per_line` chars.
    /// Zero limits are treated as 1.
    pub fn format(&self, text: &str, max_chars_per_line: usize, max_lines: usize) -> FormattedResult {
        let max_chars = max_chars_per_line.max(1);
        let max_lines = max_lines.max(1);
        let mut warnings = Vec::new();

        let normalized = self.normalize_punctuation(text);
        self.advisories(&normalized, &mut warnings);

        let source: Vec<String> = normalized
            .lines()
            .map(|line| self.tidy(line))
            .filter(|line| !line.is_empty())
            .collect();

        let fits = source.len() <= max_lines && source.iter().all(|l| char_len(l) <= max_chars);
        let lines = if fits {
            source
        } else {
            self.wrap(&source, max_chars, max_lines, &mut warnings)
        };

        let was_modified = lines.join("\n") != text;
        FormattedResult {
            lines,
            was_modified,
            warnings,
        }
    }

    /// Apply the punctuation convention. Idempotent.
    pub fn normalize_punctuation(&self, text: &str) -> String {
        if self.style == PunctuationStyle::Preserve {
            return text.to_string();
        }
        let text = self.ellipsis.replace_all(text, "⋯");

        // Digits first so the "between digits" checks below see ASCII.
        let chars: Vec<char> = text
            .chars()
            .map(|c| match c {
                '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
                _ => c,
            })
            .collect();

        let mut out = String::with_capacity(text.len());
        let mut quote_open = false;
        let mut after_converted = false;
        for (i, &c) in chars.iter().enumerate() {
            // Full-width marks carry their own spacing.
            if c == ' ' && after_converted {
                continue;
            }
            let prev = i.checked_sub(1).map(|j| chars[j]);
            let next = chars.get(i + 1).copied();
            let between_digits = prev.is_some_and(|p| p.is_ascii_digit())
                && next.is_some_and(|n| n.is_ascii_digit());
            let between_letters = prev.is_some_and(char::is_alphanumeric)
                && next.is_some_and(char::is_alphanumeric);

            let mapped = match c {
                ',' | ';' | ':' | '!' | '?' if between_digits => c,
                ',' => '，',
                ';' => '；',
                ':' => '：',
                '!' => '！',
                '?' => '？',
                // Apostrophes stay.
                '\'' | '’' if between_letters => c,
                '“' | '‘' => {
                    quote_open = true;
                    '「'
                }
                '”' | '’' => {
                    quote_open = false;
                    '」'
                }
                '"' | '\'' => {
                    quote_open = !quote_open;
                    if quote_open {
                        '「'
                    } else {
                        '」'
                    }
                }
                '「' => {
                    quote_open = true;
                    c
                }
                '」' => {
                    quote_open = false;
                    c
                }
                _ => c,
            };
            after_converted = mapped != c && matches!(mapped, '，' | '；' | '：' | '！' | '？');
            out.push(mapped);
        }
        out
    }

    /// Trim, and under the full-width convention drop trailing 。 and ，.
    fn tidy(&self, line: &str) -> String {
        let line = line.trim();
        let line = match self.style {
            PunctuationStyle::FullWidth => line
                .trim_end_matches(|c: char| c == '。' || c == '，')
                .trim_end(),
            PunctuationStyle::Preserve => line,
        };
        line.to_string()
    }

    fn advisories(&self, text: &str, warnings: &mut Vec<FormatWarning>) {
        if text.contains("？？") {
            warnings.push(FormatWarning::new(
                FormatWarningKind::DoubledQuestion,
                None,
                "repeated question mark",
            ));
        }
        if text.contains("！！") {
            warnings.push(FormatWarning::new(
                FormatWarningKind::DoubledExclamation,
                None,
                "repeated exclamation mark",
            ));
        }
        if text.contains("？！") || text.contains("！？") {
            warnings.push(FormatWarning::new(
                FormatWarningKind::MixedQuestionExclamation,
                None,
                "mixed question and exclamation marks",
            ));
        }
    }

    fn wrap(
        &self,
        source: &[String],
        max_chars: usize,
        max_lines: usize,
        warnings: &mut Vec<FormatWarning>,
    ) -> Vec<String> {
        let mut lines = Vec::new();
        for (i, line) in source.iter().enumerate() {
            let later = source.len() - i - 1;
            let budget = max_lines.saturating_sub(lines.len() + later).max(1);
            self.split_line(line, max_chars, budget, &mut lines);
        }

        if lines.len() > max_lines && source.len() > 1 {
            let mut reflowed = Vec::new();
            self.split_line(&join_paragraph(source), max_chars, max_lines, &mut reflowed);
            if reflowed.len() < lines.len() {
                warnings.push(FormatWarning::new(
                    FormatWarningKind::Reflowed,
                    None,
                    format!("{} lines reflowed into {}", lines.len(), reflowed.len()),
                ));
                lines = reflowed;
            }
        }

        if lines.len() > max_lines {
            let produced = lines.len();
            let tail = join_paragraph(&lines[max_lines - 1..]);
            lines.truncate(max_lines - 1);
            lines.push(tail);
            warnings.push(FormatWarning::new(
                FormatWarningKind::TooManyLines,
                Some(max_lines - 1),
                format!("{produced} lines merged into {max_lines}"),
            ));
        }

        for (i, line) in lines.iter_mut().enumerate() {
            if char_len(line) <= max_chars {
                continue;
            }
            let kept: String = line.chars().take(max_chars).collect();
            let dropped: String = line.chars().skip(max_chars).collect();
            warnings.push(FormatWarning::new(
                FormatWarningKind::Truncated,
                Some(i),
                format!("dropped \"{dropped}\""),
            ));
            *line = kept.trim_end().to_string();
        }
        lines
    }

    /// Split one line into pieces no longer than `max_chars` where a legal
    /// break exists, preferring breaks that keep the whole line within
    /// `budget` pieces. Unbreakable runs are emitted whole.
    fn split_line(&self, line: &str, max_chars: usize, budget: usize, out: &mut Vec<String>) {
        let mut rest = self.tidy(line);
        let mut produced = 0;
        loop {
            if rest.is_empty() {
                return;
            }
            let chars: Vec<char> = rest.chars().collect();
            if chars.len() <= max_chars {
                out.push(rest);
                return;
            }
            let spare = budget.saturating_sub(produced + 1);
            let Some(at) = self.find_break(&rest, &chars, max_chars, spare) else {
                out.push(rest);
                return;
            };
            let left: String = chars[..at].iter().collect();
            let right: String = chars[at..].iter().collect();
            let left = self.tidy(&left);
            if !left.is_empty() {
                out.push(left);
                produced += 1;
            }
            rest = self.tidy(&right);
        }
    }

    /// Char index to split at: the line becomes `chars[..at]` and `chars[at..]`.
    /// A break is taken first among those whose right piece still fits in
    /// `spare_lines` lines; if none does, among all breaks whose left piece fits.
    fn find_break(
        &self,
        line: &str,
        chars: &[char],
        max_chars: usize,
        spare_lines: usize,
    ) -> Option<usize> {
        let len = chars.len();
        let target = len.div_ceil(2).min(max_chars);
        let left_fits = |at: usize| trimmed_len(&chars[..at]) <= max_chars;
        let legal = |at: usize| {
            at > 0 && at < len && trimmed_len(&chars[..at]) > 0 && trimmed_len(&chars[at..]) > 0
        };

        let punct: Vec<usize> = chars
            .iter()
            .enumerate()
            .filter(|&(i, &c)| {
                if !STRONG_PUNCT.contains(&c) {
                    return false;
                }
                // 1,000 and 12:30 are not clause breaks.
                let digits = i > 0
                    && chars[i - 1].is_ascii_digit()
                    && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
                !digits
            })
            .map(|(i, _)| i + 1)
            .filter(|&at| legal(at))
            .collect();
        let conjunctions = self.conjunction_breaks(line, chars);
        let conjunctions: Vec<usize> = conjunctions.into_iter().filter(|&at| legal(at)).collect();
        let spaces: Vec<usize> = (1..len)
            .filter(|&i| chars[i].is_whitespace())
            .filter(|&at| legal(at))
            .collect();
        let cjk: Vec<usize> = (1..len)
            .filter(|&i| cjk_boundary(chars[i - 1], chars[i]))
            .filter(|&at| legal(at))
            .collect();

        let keeps_budget = |at: usize| {
            left_fits(at) && spare_lines > 0 && min_lines(&chars[at..], max_chars) <= spare_lines
        };
        let pick = |accept: &dyn Fn(usize) -> bool| {
            closest_to(&punct, target, accept)
                .or_else(|| closest_to(&conjunctions, target, accept))
                .or_else(|| spaces.iter().copied().filter(|&at| accept(at)).max())
                .or_else(|| cjk.iter().copied().filter(|&at| accept(at)).max())
        };
        if let Some(at) = pick(&keeps_budget).or_else(|| pick(&left_fits)) {
            return Some(at);
        }

        // Nothing fits: take the earliest legal break past the limit so only
        // the left piece overflows.
        punct
            .iter()
            .chain(&conjunctions)
            .chain(&spaces)
            .chain(&cjk)
            .copied()
            .min()
    }

    /// Break positions immediately before a conjunction.
    fn conjunction_breaks(&self, line: &str, chars: &[char]) -> Vec<usize> {
        let mut breaks = Vec::new();
        for m in self.english_conjunction.find_iter(line) {
            let at = line[..m.start()].chars().count();
            if at > 0 && chars[at - 1].is_whitespace() {
                breaks.push(at);
            }
        }
        for i in 1..chars.len() {
            if !is_cjk(chars[i - 1]) {
                continue;
            }
            let starts_conjunction = CJK_CONJUNCTIONS.iter().any(|word| {
                word.chars()
                    .enumerate()
                    .all(|(k, w)| chars.get(i + k) == Some(&w))
            });
            if starts_conjunction {
                breaks.push(i);
            }
        }
        breaks.sort_unstable();
        breaks.dedup();
        breaks
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn trim_chars(chars: &[char]) -> &[char] {
    let start = chars.iter().position(|c| !c.is_whitespace());
    let end = chars.iter().rposition(|c| !c.is_whitespace());
    match (start, end) {
        (Some(s), Some(e)) => &chars[s..=e],
        _ => &[],
    }
}

/// Whether a line may be broken between `chars[at - 1]` and `chars[at]`.
fn is_break(chars: &[char], at: usize) -> bool {
    let (prev, next) = (chars[at - 1], chars[at]);
    if prev.is_whitespace() || next.is_whitespace() {
        return true;
    }
    if STRONG_PUNCT.contains(&prev) {
        return !(at >= 2 && chars[at - 2].is_ascii_digit() && next.is_ascii_digit());
    }
    cjk_boundary(prev, next)
}

/// Fewest lines of at most `max_chars` that `chars` packs into, breaking
/// greedily at the last legal position. `usize::MAX` when a run cannot be broken.
fn min_lines(chars: &[char], max_chars: usize) -> usize {
    let mut rest = trim_chars(chars);
    let mut lines = 1;
    while rest.len() > max_chars {
        let Some(at) = (1..=max_chars).rev().find(|&at| is_break(rest, at)) else {
            return usize::MAX;
        };
        rest = trim_chars(&rest[at..]);
        lines += 1;
    }
    lines
}

fn trimmed_len(chars: &[char]) -> usize {
    let start = chars.iter().position(|c| !c.is_whitespace());
    let end = chars.iter().rposition(|c| !c.is_whitespace());
    match (start, end) {
        (Some(s), Some(e)) => e - s + 1,
        _ => 0,
    }
}

/// Candidate whose left piece fits and that is nearest `target`; ties go to
/// the later position.
fn closest_to(candidates: &[usize], target: usize, fits: &dyn Fn(usize) -> bool) -> Option<usize> {
    candidates
        .iter()
        .copied()
        .filter(|&at| fits(at))
        .min_by_key(|&at| (at.abs_diff(target), std::cmp::Reverse(at)))
}

/// Splitting here keeps words intact and does not strand punctuation.
fn cjk_boundary(prev: char, next: char) -> bool {
    if prev.is_whitespace() || next.is_whitespace() {
        return false;
    }
    if !(is_cjk(prev) || is_cjk(next)) {
        return false;
    }
    if matches!(prev, '「' | '『' | '（') {
        return false;
    }
    !matches!(
        next,
        '，' | '。' | '、' | '；' | '：' | '！' | '？' | '」' | '』' | '）' | '⋯'
    )
}

/// Join lines into one paragraph; a space is inserted only between two
/// non-CJK neighbours.
fn join_paragraph(lines: &[String]) -> String {
    let mut out = String::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let (Some(prev), Some(next)) = (out.chars().last(), line.chars().next()) {
            if !is_cjk(prev) && !is_cjk(next) {
                out.push(' ');
            }
        }
        out.push_str(line);
    }
    out
}
