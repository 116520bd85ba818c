//! Selector usage matching
//!
//! Given one stylesheet and the page DOM, keep only the rules whose selectors
//! match at least one element. At-rules are kept whole. A selector that cannot
//! be compiled keeps its rule: an unused rule costs bytes, a wrongly dropped
//! one breaks layout.

mod rules;
mod selector;

pub use rules::{split_rules, strip_comments, CssRule, RuleKind};
pub use selector::{SelectorError, SelectorList};

use std::collections::HashMap;

use scraper::{ElementRef, Html};
use tracing::trace;

/// A parsed page, built once and shared by every stylesheet of that page.
///
/// Parsing is lenient: malformed markup still yields a tree.
pub struct PageDom {
    document: Html,
}

impl PageDom {
    pub fn parse(html: &str) -> Self {
        Self {
            document: Html::parse_document(html),
        }
    }

    fn any_match(&self, selector: &SelectorList) -> bool {
        selector.matches_any(
            self.document
                .root_element()
                .descendants()
                .filter_map(ElementRef::wrap),
        )
    }
}

/// Outcome of checking one selector against the page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Used,
    Unused,
    /// Could not be compiled; the rule is kept
    Untranslatable,
}

impl Verdict {
    pub fn keeps_rule(self) -> bool {
        !matches!(self, Verdict::Unused)
    }
}

/// Filtered stylesheet and what happened to its rules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOutcome {
    /// Surviving rules in source order, one per line
    pub css: String,
    pub kept: usize,
    pub dropped: usize,
    /// Rules kept only because their selector (or the text) was not understood
    pub fail_open: usize,
}

/// Filters stylesheets against one page, caching verdicts per selector
pub struct UsageMatcher<'d> {
    dom: &'d PageDom,
    verdicts: HashMap<String, Verdict>,
}

impl<'d> UsageMatcher<'d> {
    pub fn new(dom: &'d PageDom) -> Self {
        Self {
            dom,
            verdicts: HashMap::new(),
        }
    }

    /// Decide whether a selector list matches anything on the page
    pub fn verdict(&mut self, selector: &str) -> Verdict {
        if let Some(v) = self.verdicts.get(selector) {
            return *v;
        }
        let verdict = match SelectorList::compile(selector) {
            Ok(list) if self.dom.any_match(&list) => Verdict::Used,
            Ok(_) => Verdict::Unused,
            Err(e) => {
                trace!("keeping untranslatable selector {:?}: {}", selector, e);
                Verdict::Untranslatable
            }
        };
        self.verdicts.insert(selector.to_string(), verdict);
        verdict
    }

    /// Keep the rules of `css` that the page uses, in their original order
    pub fn filter(&mut self, css: &str) -> FilterOutcome {
        let stripped = strip_comments(css);
        let mut outcome = FilterOutcome::default();
        let mut kept: Vec<&str> = Vec::new();

        for rule in split_rules(&stripped) {
            let keep = match rule.kind {
                RuleKind::AtRule => true,
                RuleKind::Unparsed => {
                    outcome.fail_open += 1;
                    true
                }
                RuleKind::Style => {
                    let verdict = self.verdict(rule.prelude);
                    if verdict == Verdict::Untranslatable {
                        outcome.fail_open += 1;
                    }
                    verdict.keeps_rule()
                }
            };

            if keep {
                outcome.kept += 1;
                kept.push(rule.text);
            } else {
                outcome.dropped += 1;
            }
        }

        outcome.css = kept.join("\n");
        outcome
    }
}

/// Filter a single stylesheet against a page
pub fn filter_used_css(css: &str, dom: &PageDom) -> FilterOutcome {
    UsageMatcher::new(dom).filter(css)
}
