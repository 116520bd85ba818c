//! CSS minification
//!
//! A single left-to-right pass that removes comments, collapses whitespace
//! runs and drops the last `;` of each block. Strings, escapes and `/*! */`
//! comments are copied verbatim. Running it twice gives the same output as
//! running it once.

/// Characters after which whitespace is never significant
const STRIP_AFTER: &[char] = &['{', '}', ';', ',', '>', '~', ':'];

/// Characters before which whitespace is never significant.
///
/// `:` is absent because `a :hover` and `a:hover` select different elements.
const STRIP_BEFORE: &[char] = &['{', '}', ';', ',', '>', '~'];

/// Minify CSS text
pub fn minify(css: &str) -> String {
    let chars: Vec<char> = css.chars().collect();
    let mut out = String::with_capacity(css.len());
    // Bytes of `out` before this index were copied verbatim and must not be
    // trimmed or reinterpreted.
    let mut protect = 0;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '"' || c == '\'' {
            let end = string_end(&chars, i);
            out.extend(&chars[i..end]);
            protect = out.len();
            i = end;
            continue;
        }

        if c == '\\' {
            let end = (i + 2).min(chars.len());
            out.extend(&chars[i..end]);
            protect = out.len();
            i = end;
            continue;
        }

        if c == '/' && chars.get(i + 1) == Some(&'*') && chars.get(i + 2) == Some(&'!') {
            let end = comment_end(&chars, i);
            out.extend(&chars[i..end]);
            protect = out.len();
            i = end;
            continue;
        }

        if is_space(c) || starts_comment(&chars, i) {
            let (end, saw_space) = skip_insignificant(&chars, i);
            let prev = out.chars().next_back();
            let next = chars.get(end).copied();
            if keep_separator(prev, next, saw_space, out.len() > protect) {
                out.push(' ');
            }
            i = end;
            continue;
        }

        if c == '}' {
            while out.len() > protect && out.ends_with(';') {
                out.pop();
            }
        }

        out.push(c);
        i += 1;
    }

    out
}

fn is_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0C')
}

fn is_name(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_' || !c.is_ascii()
}

fn starts_comment(chars: &[char], i: usize) -> bool {
    chars[i] == '/' && chars.get(i + 1) == Some(&'*') && chars.get(i + 2) != Some(&'!')
}

/// Decide whether a run of whitespace and comments becomes a single space
fn keep_separator(prev: Option<char>, next: Option<char>, saw_space: bool, prev_free: bool) -> bool {
    let (Some(prev), Some(next)) = (prev, next) else {
        return false;
    };

    if !saw_space {
        // Only comments were removed. A comment is not whitespace, so
        // `a/**/.b` is the compound `a.b`; only two names would fuse.
        return (is_name(prev) && is_name(next)) || (prev == '/' && next == '*');
    }

    if prev_free && STRIP_AFTER.contains(&prev) {
        return false;
    }
    !STRIP_BEFORE.contains(&next)
}

/// Skip whitespace and removable comments starting at `i`
fn skip_insignificant(chars: &[char], mut i: usize) -> (usize, bool) {
    let mut saw_space = false;
    while i < chars.len() {
        if is_space(chars[i]) {
            saw_space = true;
            i += 1;
        } else if starts_comment(chars, i) {
            i = comment_end(chars, i);
        } else {
            break;
        }
    }
    (i, saw_space)
}

/// Index just past the comment opening at `open`; unterminated comments run
/// to the end of input
fn comment_end(chars: &[char], open: usize) -> usize {
    let mut j = open + 2;
    while j + 1 < chars.len() {
        if chars[j] == '*' && chars[j + 1] == '/' {
            return j + 2;
        }
        j += 1;
    }
    chars.len()
}

/// Index just past the string opening at `open`; unterminated strings run to
/// the end of input
fn string_end(chars: &[char], open: usize) -> usize {
    let quote = chars[open];
    let mut j = open + 1;
    while j < chars.len() {
        match chars[j] {
            '\\' => j += 2,
            c if c == quote => return j + 1,
            _ => j += 1,
        }
    }
    chars.len()
}
