//! Stylesheet reference extraction

use scraper::{Html, Selector};
use url::Url;

/// Absolute URLs of the stylesheets linked from `html`, in document order.
///
/// Relative hrefs resolve against `<base href>` when the page has one, else
/// against `page_url`. Duplicates are kept. Alternate stylesheets, empty
/// hrefs and non-http(s) targets are skipped.
pub fn extract_stylesheets(html: &str, page_url: &Url) -> Vec<Url> {
    let document = Html::parse_document(html);
    let base = document_base(&document, page_url);

    let selector = match Selector::parse("link[href]") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    let mut urls = Vec::new();
    for element in document.select(&selector) {
        let link = element.value();
        if !is_stylesheet_rel(link.attr("rel").unwrap_or_default()) {
            continue;
        }
        let href = link.attr("href").unwrap_or_default().trim();
        if href.is_empty() {
            continue;
        }
        if let Ok(url) = base.join(href) {
            if url.scheme() == "http" || url.scheme() == "https" {
                urls.push(url);
            }
        }
    }

    urls
}

/// `rel` is a space-separated, case-insensitive token list
fn is_stylesheet_rel(rel: &str) -> bool {
    let mut stylesheet = false;
    for token in rel.split_ascii_whitespace() {
        if token.eq_ignore_ascii_case("alternate") {
            return false;
        }
        if token.eq_ignore_ascii_case("stylesheet") {
            stylesheet = true;
        }
    }
    stylesheet
}

fn document_base(document: &Html, page_url: &Url) -> Url {
    let Ok(selector) = Selector::parse("base[href]") else {
        return page_url.clone();
    };
    document
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| page_url.join(href.trim()).ok())
        .unwrap_or_else(|| page_url.clone())
}
