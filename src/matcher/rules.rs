//! Splitting stylesheet text into top-level rules
//!
//! This is a brace-depth scanner, not a CSS parser. It only needs to find
//! where each top-level rule starts and ends so the matcher can keep or drop
//! it whole. Strings and escapes are skipped so braces inside them do not
//! count. Nested blocks (`@media`, `@supports`, native nesting) stay attached
//! to their top-level rule.

/// How a top-level chunk of CSS is treated by the matcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// `selector { declarations }`
    Style,
    /// Anything whose prelude starts with `@`, block or statement
    AtRule,
    /// Text that does not form a rule (stray `}` or `;`, trailing junk)
    Unparsed,
}

/// A top-level rule borrowed from the stylesheet text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CssRule<'a> {
    pub kind: RuleKind,
    /// Selector list or at-rule prelude, trimmed
    pub prelude: &'a str,
    /// Full rule text, trimmed
    pub text: &'a str,
}

/// Remove `/* ... */` comments outside of strings
pub fn strip_comments(css: &str) -> String {
    let bytes = css.as_bytes();
    let mut out = String::with_capacity(css.len());
    let mut copied_to = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => i = skip_string(bytes, i),
            b'\\' => i += 2,
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                out.push_str(&css[copied_to..i]);
                i = match css[i + 2..].find("*/") {
                    Some(pos) => i + 2 + pos + 2,
                    None => bytes.len(),
                };
                copied_to = i;
            }
            _ => i += 1,
        }
    }

    if copied_to < bytes.len() {
        out.push_str(&css[copied_to..]);
    }
    out
}

/// Split comment-free CSS into top-level rules, in source order
pub fn split_rules(css: &str) -> Vec<CssRule<'_>> {
    let bytes = css.as_bytes();
    let mut rules = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => i = skip_string(bytes, i),
            b'\\' => i += 2,
            b';' => {
                push_statement(&mut rules, &css[start..=i]);
                i += 1;
                start = i;
            }
            b'{' => {
                let end = matching_brace(bytes, i);
                push_block(&mut rules, &css[start..end], i - start);
                i = end;
                start = end;
            }
            b'}' => {
                push_unparsed(&mut rules, &css[start..=i]);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }

    if start < bytes.len() {
        let rest = &css[start..];
        if rest.trim_start().starts_with('@') {
            push_statement(&mut rules, rest);
        } else {
            push_unparsed(&mut rules, rest);
        }
    }
    rules
}

fn push_block<'a>(rules: &mut Vec<CssRule<'a>>, raw: &'a str, brace_at: usize) {
    let prelude = raw[..brace_at].trim();
    let kind = if prelude.starts_with('@') {
        RuleKind::AtRule
    } else {
        RuleKind::Style
    };
    rules.push(CssRule {
        kind,
        prelude,
        text: raw.trim(),
    });
}

fn push_statement<'a>(rules: &mut Vec<CssRule<'a>>, raw: &'a str) {
    let text = raw.trim();
    if text.is_empty() || text == ";" {
        return;
    }
    let prelude = text.trim_end_matches(';').trim_end();
    let kind = if prelude.starts_with('@') {
        RuleKind::AtRule
    } else {
        RuleKind::Unparsed
    };
    rules.push(CssRule { kind, prelude, text });
}

fn push_unparsed<'a>(rules: &mut Vec<CssRule<'a>>, raw: &'a str) {
    let text = raw.trim();
    if text.is_empty() || text == "}" {
        return;
    }
    rules.push(CssRule {
        kind: RuleKind::Unparsed,
        prelude: text,
        text,
    });
}

/// Index just past the string starting at `open`. Unterminated strings end at
/// a newline, as in CSS.
fn skip_string(bytes: &[u8], open: usize) -> usize {
    let quote = bytes[open];
    let mut j = open + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 2,
            b'\n' => return j,
            b if b == quote => return j + 1,
            _ => j += 1,
        }
    }
    bytes.len()
}

/// Index just past the `}` matching the `{` at `open`, or the end of input
fn matching_brace(bytes: &[u8], open: usize) -> usize {
    let mut depth = 0usize;
    let mut j = open;
    while j < bytes.len() {
        match bytes[j] {
            b'"' | b'\'' => {
                j = skip_string(bytes, j);
                continue;
            }
            b'\\' => {
                j += 2;
                continue;
            }
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return j + 1;
                }
            }
            _ => {}
        }
        j += 1;
    }
    bytes.len()
}
