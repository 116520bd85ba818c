//! Compiling CSS selectors into DOM predicates
//!
//! Supported grammar:
//!
//! ```text
//! list       := complex ( "," complex )*
//! complex    := compound ( combinator compound )*
//! combinator := whitespace | ">" | "+" | "~"
//! compound   := ( type | "*" )? ( "." class | "#" id | attribute )*
//! attribute  := "[" name ( op value flag? )? "]"
//! op         := "=" | "~=" | "|=" | "^=" | "$=" | "*="
//! ```
//!
//! Anything else (pseudo-classes, pseudo-elements, namespaces, escapes,
//! nesting `&`) is reported as [`SelectorError::Unsupported`]. Callers must
//! treat every error as "keep the rule".

use std::collections::HashMap;

use ego_tree::NodeId;
use scraper::node::Element;
use scraper::ElementRef;
use thiserror::Error;

/// Why a selector could not be compiled
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("empty selector")]
    Empty,
    #[error("unsupported syntax '{found}' at offset {offset}")]
    Unsupported { found: char, offset: usize },
    #[error("malformed selector: {0}")]
    Malformed(&'static str),
}

/// A compiled selector list; matches if any alternative matches
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorList {
    alternatives: Vec<ComplexSelector>,
}

/// Compounds joined by combinators, stored left to right
#[derive(Debug, Clone, PartialEq)]
struct ComplexSelector {
    compounds: Vec<Compound>,
    /// `combinators[i]` joins `compounds[i]` and `compounds[i + 1]`
    combinators: Vec<Combinator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
    NextSibling,
    SubsequentSibling,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Compound {
    /// Lowercased type name; `None` for `*` or no type
    tag: Option<String>,
    ids: Vec<String>,
    classes: Vec<String>,
    attributes: Vec<AttributeTest>,
}

#[derive(Debug, Clone, PartialEq)]
struct AttributeTest {
    name: String,
    op: Option<(AttrOp, String)>,
    ignore_case: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrOp {
    Equals,
    Includes,
    DashMatch,
    Prefix,
    Suffix,
    Substring,
}

impl SelectorList {
    /// Compile a selector list
    pub fn compile(source: &str) -> Result<Self, SelectorError> {
        let mut parser = Parser::new(source);
        let mut alternatives = vec![parser.complex()?];
        while parser.eat(',') {
            alternatives.push(parser.complex()?);
        }
        parser.skip_ws();
        if let Some((offset, found)) = parser.peek_indexed() {
            return Err(SelectorError::Unsupported { found, offset });
        }
        Ok(Self { alternatives })
    }

    /// Does any of `elements` match any alternative?
    ///
    /// Partial results are memoized per `(alternative, compound, node)`, so a
    /// whole-document scan costs at most one compound test per triple plus
    /// the walks over ancestors or siblings.
    pub fn matches_any<'a>(&self, elements: impl IntoIterator<Item = ElementRef<'a>>) -> bool {
        let mut memo = HashMap::new();
        elements.into_iter().any(|element| {
            self.alternatives.iter().enumerate().any(|(alt, complex)| {
                let mut scope = Memo { alt, seen: &mut memo };
                complex.matches_at(element, complex.compounds.len() - 1, &mut scope)
            })
        })
    }
}

struct Memo<'m> {
    alt: usize,
    seen: &'m mut HashMap<(usize, usize, NodeId), bool>,
}

impl ComplexSelector {
    /// Right-to-left: `compounds[idx]` must match `element`, and the chain to
    /// its left must match the related elements.
    fn matches_at(&self, element: ElementRef<'_>, idx: usize, memo: &mut Memo<'_>) -> bool {
        let key = (memo.alt, idx, element.id());
        if let Some(&known) = memo.seen.get(&key) {
            return known;
        }
        let matched = self.compute_at(element, idx, memo);
        memo.seen.insert(key, matched);
        matched
    }

    fn compute_at(&self, element: ElementRef<'_>, idx: usize, memo: &mut Memo<'_>) -> bool {
        if !self.compounds[idx].matches(element) {
            return false;
        }
        if idx == 0 {
            return true;
        }
        match self.combinators[idx - 1] {
            Combinator::Descendant => element
                .ancestors()
                .filter_map(ElementRef::wrap)
                .any(|a| self.matches_at(a, idx - 1, memo)),
            Combinator::Child => element
                .parent()
                .and_then(ElementRef::wrap)
                .is_some_and(|p| self.matches_at(p, idx - 1, memo)),
            Combinator::NextSibling => element
                .prev_siblings()
                .find_map(ElementRef::wrap)
                .is_some_and(|s| self.matches_at(s, idx - 1, memo)),
            Combinator::SubsequentSibling => element
                .prev_siblings()
                .filter_map(ElementRef::wrap)
                .any(|s| self.matches_at(s, idx - 1, memo)),
        }
    }
}

impl Compound {
    fn is_empty(&self) -> bool {
        self.tag.is_none() && self.ids.is_empty() && self.classes.is_empty() && self.attributes.is_empty()
    }

    fn matches(&self, element: ElementRef<'_>) -> bool {
        let el = element.value();
        if let Some(tag) = &self.tag {
            if !el.name().eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if !self.ids.iter().all(|id| el.id() == Some(id.as_str())) {
            return false;
        }
        if !self.classes.iter().all(|class| el.classes().any(|c| c == class.as_str())) {
            return false;
        }
        self.attributes
            .iter()
            .all(|test| test.matches(attribute_value(el, &test.name)))
    }
}

/// Attribute lookup ignoring ASCII case.
///
/// The HTML parser lowercases attributes of HTML elements but keeps the case
/// of SVG and MathML ones (`viewBox`), so the name is compared as written on
/// either side. Foreign elements strictly compare case-sensitively; matching
/// loosely there can only keep a rule, never drop one.
fn attribute_value<'a>(el: &'a Element, name: &str) -> Option<&'a str> {
    el.attrs()
        .find(|(attr, _)| attr.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

impl AttributeTest {
    fn matches(&self, actual: Option<&str>) -> bool {
        let Some(actual) = actual else {
            return false;
        };
        let Some((op, expected)) = &self.op else {
            return true;
        };

        let (actual, expected) = if self.ignore_case {
            (actual.to_ascii_lowercase(), expected.to_ascii_lowercase())
        } else {
            (actual.to_string(), expected.clone())
        };

        match op {
            AttrOp::Equals => actual == expected,
            AttrOp::Includes => {
                !expected.is_empty() && actual.split_ascii_whitespace().any(|w| w == expected)
            }
            AttrOp::DashMatch => {
                actual == expected || actual.starts_with(&format!("{}-", expected))
            }
            AttrOp::Prefix => !expected.is_empty() && actual.starts_with(&expected),
            AttrOp::Suffix => !expected.is_empty() && actual.ends_with(&expected),
            AttrOp::Substring => !expected.is_empty() && actual.contains(&expected),
        }
    }
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    chars: Vec<(usize, char)>,
    pos: usize,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || !c.is_ascii()
}

impl Parser {
    fn new(source: &str) -> Self {
        Self {
            chars: source.char_indices().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|&(_, c)| c)
    }

    fn peek_indexed(&self) -> Option<(usize, char)> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn unsupported(&self) -> SelectorError {
        match self.peek_indexed() {
            Some((offset, found)) => SelectorError::Unsupported { found, offset },
            None => SelectorError::Malformed("unexpected end of selector"),
        }
    }

    fn complex(&mut self) -> Result<ComplexSelector, SelectorError> {
        self.skip_ws();
        let mut compounds = vec![self.compound()?];
        let mut combinators = Vec::new();

        loop {
            let had_ws = self.skip_ws();
            let combinator = match self.peek() {
                None | Some(',') => break,
                Some('>') => Combinator::Child,
                Some('+') => Combinator::NextSibling,
                Some('~') => Combinator::SubsequentSibling,
                Some(_) if had_ws => Combinator::Descendant,
                Some(_) => return Err(self.unsupported()),
            };
            if combinator != Combinator::Descendant {
                self.pos += 1;
                self.skip_ws();
            }
            combinators.push(combinator);
            compounds.push(self.compound()?);
        }

        Ok(ComplexSelector {
            compounds,
            combinators,
        })
    }

    fn compound(&mut self) -> Result<Compound, SelectorError> {
        let mut compound = Compound::default();
        let mut universal = false;

        match self.peek() {
            Some('*') => {
                self.pos += 1;
                if self.peek() == Some('|') {
                    return Err(self.unsupported());
                }
                universal = true;
            }
            Some(c) if is_ident_char(c) && !c.is_ascii_digit() => {
                let name = self.ident()?;
                if self.peek() == Some('|') {
                    return Err(self.unsupported());
                }
                compound.tag = Some(name.to_ascii_lowercase());
            }
            _ => {}
        }

        loop {
            match self.peek() {
                Some('.') => {
                    self.pos += 1;
                    compound.classes.push(self.ident()?);
                }
                Some('#') => {
                    self.pos += 1;
                    compound.ids.push(self.ident()?);
                }
                Some('[') => {
                    self.pos += 1;
                    compound.attributes.push(self.attribute()?);
                }
                Some(c) if c.is_whitespace() || matches!(c, ',' | '>' | '+' | '~') => break,
                None => break,
                Some(_) => return Err(self.unsupported()),
            }
        }

        if compound.is_empty() && !universal {
            return Err(match self.peek() {
                None => SelectorError::Empty,
                Some(_) => self.unsupported(),
            });
        }
        Ok(compound)
    }

    fn ident(&mut self) -> Result<String, SelectorError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '\\' {
                return Err(self.unsupported());
            }
            if !is_ident_char(c) {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.unsupported());
        }
        Ok(self.chars[start..self.pos].iter().map(|&(_, c)| c).collect())
    }

    fn attribute(&mut self) -> Result<AttributeTest, SelectorError> {
        self.skip_ws();
        let name = self.ident()?;
        if self.peek() == Some('|') && self.chars.get(self.pos + 1).map(|&(_, c)| c) != Some('=') {
            return Err(self.unsupported());
        }
        self.skip_ws();

        let op = match self.bump() {
            Some(']') => {
                return Ok(AttributeTest {
                    name,
                    op: None,
                    ignore_case: false,
                })
            }
            Some('=') => AttrOp::Equals,
            Some(c @ ('~' | '|' | '^' | '$' | '*')) => {
                if self.bump() != Some('=') {
                    return Err(SelectorError::Malformed("expected '=' in attribute operator"));
                }
                match c {
                    '~' => AttrOp::Includes,
                    '|' => AttrOp::DashMatch,
                    '^' => AttrOp::Prefix,
                    '$' => AttrOp::Suffix,
                    _ => AttrOp::Substring,
                }
            }
            Some(_) => {
                self.pos -= 1;
                return Err(self.unsupported());
            }
            None => return Err(SelectorError::Malformed("unterminated attribute selector")),
        };

        self.skip_ws();
        let value = match self.peek() {
            Some(q @ ('"' | '\'')) => {
                self.pos += 1;
                self.quoted(q)?
            }
            _ => self.ident()?,
        };

        self.skip_ws();
        let mut ignore_case = false;
        match self.peek() {
            Some('i' | 'I') => {
                ignore_case = true;
                self.pos += 1;
            }
            Some('s' | 'S') => self.pos += 1,
            _ => {}
        }
        self.skip_ws();
        if self.bump() != Some(']') {
            return Err(SelectorError::Malformed("unterminated attribute selector"));
        }

        Ok(AttributeTest {
            name,
            op: Some((op, value)),
            ignore_case,
        })
    }

    fn quoted(&mut self, quote: char) -> Result<String, SelectorError> {
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('\\') => return Err(self.unsupported_at_previous()),
                Some(c) if c == quote => return Ok(value),
                Some(c) => value.push(c),
                None => return Err(SelectorError::Malformed("unterminated string")),
            }
        }
    }

    fn unsupported_at_previous(&self) -> SelectorError {
        let (offset, found) = self.chars[self.pos - 1];
        SelectorError::Unsupported { found, offset }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    fn any_match(html: &str, selector: &str) -> bool {
        let doc = Html::parse_document(html);
        let list = SelectorList::compile(selector).unwrap();
        list.matches_any(doc.root_element().descendants().filter_map(ElementRef::wrap))
    }

    const PAGE: &str = r#"
        <html><body>
          <div id="main" class="wrap wide">
            <p class="lead" data-role="intro text" lang="en-US">Hi</p>
            <a href="https://example.com/docs.pdf">pdf</a>
          </div>
          <ul><li>one</li><li class="second">two</li></ul>
        </body></html>
    "#;

    #[test]
    fn type_class_and_id() {
        assert!(any_match(PAGE, "body"));
        assert!(any_match(PAGE, "P"));
        assert!(any_match(PAGE, ".lead"));
        assert!(any_match(PAGE, "#main"));
        assert!(any_match(PAGE, "div.wrap.wide#main"));
        assert!(!any_match(PAGE, ".unused"));
        assert!(!any_match(PAGE, "span"));
        assert!(!any_match(PAGE, "div.wrap.narrow"));
    }

    #[test]
    fn combinators() {
        assert!(any_match(PAGE, "body p"));
        assert!(any_match(PAGE, "#main > .lead"));
        assert!(!any_match(PAGE, "body > p"));
        assert!(any_match(PAGE, "li + .second"));
        assert!(any_match(PAGE, "p ~ a"));
        assert!(!any_match(PAGE, "a ~ p"));
        assert!(!any_match(PAGE, "ul p"));
    }

    #[test]
    fn attributes() {
        assert!(any_match(PAGE, "[href]"));
        assert!(any_match(PAGE, "a[href$='.pdf']"));
        assert!(any_match(PAGE, r#"a[href^="https:"]"#));
        assert!(any_match(PAGE, "[data-role~=intro]"));
        assert!(any_match(PAGE, "[lang|=en]"));
        assert!(any_match(PAGE, "[data-role*=ro]"));
        assert!(any_match(PAGE, "[id=MAIN i]"));
        assert!(!any_match(PAGE, "[id=MAIN]"));
        assert!(!any_match(PAGE, "[title]"));
    }

    #[test]
    fn selector_list_matches_any() {
        assert!(any_match(PAGE, ".missing, .lead"));
        assert!(!any_match(PAGE, ".missing, .gone"));
    }

    #[test]
    fn universal_selector() {
        assert!(any_match(PAGE, "*"));
        assert!(any_match(PAGE, "#main > *"));
    }

    #[test]
    fn foreign_attribute_names_keep_their_case() {
        let page = r#"<html><body>
            <svg viewBox="0 0 10 10" preserveAspectRatio="none"><rect width="5"/></svg>
        </body></html>"#;
        assert!(any_match(page, "svg[viewBox]"));
        assert!(any_match(page, "svg[viewbox]"));
        assert!(any_match(page, "[preserveAspectRatio=none] rect"));
        assert!(any_match(page, "rect[WIDTH='5']"));
        assert!(!any_match(page, "svg[viewBox='0 0 5 5']"));
    }

    #[test]
    fn deep_documents_match_in_bounded_time() {
        let depth = 40;
        let page = format!(
            "<html><body><div class=\"outer\">{}<span>x</span>{}</div></body></html>",
            "<div>".repeat(depth),
            "</div>".repeat(depth)
        );
        let started = std::time::Instant::now();
        assert!(!any_match(&page, ".missing div div div div div div div span"));
        assert!(any_match(&page, ".outer div div div div div div div span"));
        assert!(!any_match(&page, ".missing ~ div div div div div div div div p"));
        assert!(
            started.elapsed() < std::time::Duration::from_secs(2),
            "matching took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn pseudo_classes_are_unsupported() {
        for sel in ["a:hover", "p::before", ":root", "li:nth-child(2)", "div:not(.x)"] {
            assert!(
                matches!(SelectorList::compile(sel), Err(SelectorError::Unsupported { found: ':', .. })),
                "{sel} should be unsupported"
            );
        }
    }

    #[test]
    fn other_unsupported_syntax() {
        assert!(SelectorList::compile("svg|rect").is_err());
        assert!(SelectorList::compile(".a\\:b").is_err());
        assert!(SelectorList::compile("& .child").is_err());
        assert!(SelectorList::compile("").is_err());
        assert!(SelectorList::compile("a,").is_err());
        assert!(SelectorList::compile("[unterminated").is_err());
        assert!(SelectorList::compile("50%").is_err());
    }
}
