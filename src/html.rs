//! Small markup helpers shared by the page parsers and the attempt extractor

use std::sync::LazyLock;

use scraper::{ElementRef, Node, Selector, node::Element};
use url::Url;

/// Classes that keep an element for screen readers only
const SCREEN_READER_ONLY: &[&str] = &["accesshide", "sr-only", "visually-hidden"];

/// Lets relative hrefs go through the URL parser
static RELATIVE_BASE: LazyLock<Url> = LazyLock::new(|| Url::parse("http://relative.invalid/").expect("static url"));

/// Parse a selector literal. Only ever called with constant CSS.
pub(crate) fn sel(css: &str) -> Selector {
	Selector::parse(css).unwrap_or_else(|e| panic!("invalid selector {css:?}: {e:?}"))
}

/// Collapse runs of whitespace into single spaces and trim
pub(crate) fn normalize_ws(s: &str) -> String {
	s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace-normalized text content of an element
pub(crate) fn text_of(el: ElementRef<'_>) -> String {
	normalize_ws(&el.text().collect::<String>())
}

/// Text content with every non-empty string on its own line
pub(crate) fn text_lines(el: ElementRef<'_>) -> String {
	el.text().map(str::trim).filter(|s| !s.is_empty()).collect::<Vec<_>>().join("\n")
}

/// Like [`text_of`], but skips screen-reader-only subtrees and script/style content
pub(crate) fn visible_text(el: ElementRef<'_>) -> String {
	fn walk(el: ElementRef<'_>, out: &mut String) {
		for child in el.children() {
			match child.value() {
				Node::Text(text) => out.push_str(text),
				Node::Element(element) => {
					if is_screen_reader_only(element) || matches!(element.name(), "script" | "style") {
						continue;
					}
					if let Some(child_el) = ElementRef::wrap(child) {
						out.push(' ');
						walk(child_el, out);
						out.push(' ');
					}
				}
				_ => {}
			}
		}
	}
	let mut out = String::new();
	walk(el, &mut out);
	normalize_ws(&out)
}

pub(crate) fn has_class(element: &Element, class: &str) -> bool {
	element.classes().any(|c| c == class)
}

pub(crate) fn is_screen_reader_only(element: &Element) -> bool {
	SCREEN_READER_ONLY.iter().any(|class| has_class(element, class))
}

/// Attribute value, trimmed, `None` when absent or empty
pub(crate) fn attr(el: ElementRef<'_>, name: &str) -> Option<String> {
	el.value().attr(name).map(str::trim).filter(|v| !v.is_empty()).map(str::to_owned)
}

/// Decoded value of `key` in the query of a (possibly relative) href
pub(crate) fn query_param(href: &str, key: &str) -> Option<String> {
	let url = Url::parse(href).or_else(|_| RELATIVE_BASE.join(href)).ok()?;
	url.query_pairs().find(|(k, _)| k == key).map(|(_, v)| v.into_owned())
}
