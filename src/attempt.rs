//! Quiz attempt page extraction.
//!
//! Turns the HTML of `mod/quiz/attempt.php` into an [`AttemptContext`]: the three
//! submission tokens of the attempt form plus, per `.que` block, the question text with
//! its answer controls swapped for `[BLANK_n]` markers and the controls themselves.

use std::{collections::HashSet, str::FromStr, sync::LazyLock};

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector, node::Element};

use crate::{
	Anomaly, AttemptContext, Field, FieldKind, Question, SelectOption,
	config::QuizLabels,
	error::ExtractionError,
	html::{has_class, is_screen_reader_only, normalize_ws, sel, text_of},
};

static RESPONSE_FORM: LazyLock<Selector> = LazyLock::new(|| sel("#responseform"));
static QUESTION_BLOCK: LazyLock<Selector> = LazyLock::new(|| sel(".que"));
static QUESTION_NUMBER: LazyLock<Selector> = LazyLock::new(|| sel(".qno"));
static FORMULATION: LazyLock<Selector> = LazyLock::new(|| sel(".formulation"));
static CONTENT: LazyLock<Selector> = LazyLock::new(|| sel(".content"));
static INPUT: LazyLock<Selector> = LazyLock::new(|| sel("input"));
static OPTION: LazyLock<Selector> = LazyLock::new(|| sel("option"));
static LABEL: LazyLock<Selector> = LazyLock::new(|| sel("label"));
static SUBQUESTION_CONTROL: LazyLock<[Selector; 3]> = LazyLock::new(|| [sel("select"), sel("textarea"), sel("input")]);

/// Answer fields are named `q<usage>:<slot>_<rest>`
static ANSWER_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^q\d+:\d+_").expect("static regex"));

/// Value the server uses for "nothing selected"
const UNSELECTED_VALUE: &str = "0";
const SEQUENCE_CHECK_SUFFIX: &str = ":sequencecheck";
/// Wrapper of the "Clear my choice" radio of single-answer multichoice
const CLEAR_CHOICE: &str = "qtype_multichoice_clearchoice";

/// Classes on `.que` describing behaviour or state rather than the question type
const NON_TYPE_CLASSES: &[&str] = &[
	"que",
	"deferredfeedback",
	"immediatefeedback",
	"interactive",
	"adaptive",
	"adaptivenopenalty",
	"manualgraded",
	"deferredcbm",
	"immediatecbm",
	"notyetanswered",
	"answersaved",
	"notanswered",
	"invalidanswer",
	"complete",
	"incomplete",
];

/// Input types that never carry an answer
const NON_ANSWER_INPUTS: &[&str] = &["hidden", "submit", "button", "image", "reset"];

/// Extract an attempt page using the default (English + Japanese) placeholder phrases
pub fn extract(html: &str) -> Result<AttemptContext, ExtractionError> {
	extract_with(html, &QuizLabels::default())
}

/// Extract an attempt page.
///
/// Fails only when the page is not an attempt page or a submission token is missing;
/// anything wrong inside a single question is recorded in [`AttemptContext::anomalies`]
/// and that question is returned with defaulted data.
pub fn extract_with(html: &str, labels: &QuizLabels) -> Result<AttemptContext, ExtractionError> {
	let document = Html::parse_document(html);
	let form = document.select(&RESPONSE_FORM).next().ok_or(ExtractionError::NotAnAttemptPage)?;

	let attempt_id = input_value(form, "attempt").ok_or(ExtractionError::MissingToken("attempt"))?;
	let session_key = input_value(form, "sesskey").ok_or(ExtractionError::MissingToken("sesskey"))?;
	let slots = input_value(form, "slots").ok_or(ExtractionError::MissingToken("slots"))?;

	let mut anomalies = Vec::new();
	let this_page = page_field(form, "thispage", 0u32, &mut anomalies);
	let next_page = page_field(form, "nextpage", -1i32, &mut anomalies);

	let mut field_names = HashSet::new();
	let questions: Vec<Question> = form
		.select(&QUESTION_BLOCK)
		.enumerate()
		.map(|(index, block)| parse_question(index, block, labels, &mut field_names, &mut anomalies))
		.collect();

	for anomaly in &anomalies {
		tracing::warn!(attempt = %attempt_id, "{anomaly}");
	}
	tracing::debug!(attempt = %attempt_id, questions = questions.len(), "extracted attempt page");

	Ok(AttemptContext {
		attempt_id,
		session_key,
		slots,
		this_page,
		next_page,
		questions,
		anomalies,
	})
}

/// Value of the first `input[name=..]` under `scope`. Present-but-empty counts as present.
fn input_value(scope: ElementRef<'_>, name: &str) -> Option<String> {
	scope.select(&INPUT).find(|i| i.value().attr("name") == Some(name)).and_then(|i| i.value().attr("value")).map(str::to_owned)
}

fn page_field<T: FromStr>(form: ElementRef<'_>, name: &str, default: T, anomalies: &mut Vec<Anomaly>) -> T {
	let Some(raw) = input_value(form, name) else {
		return default;
	};
	match raw.trim().parse() {
		Ok(v) => v,
		Err(_) => {
			anomalies.push(Anomaly::MalformedPageField {
				field: name.to_string(),
				value: raw,
			});
			default
		}
	}
}

/// `field_names` holds every field name taken so far in the attempt
fn parse_question(index: usize, block: ElementRef<'_>, labels: &QuizLabels, field_names: &mut HashSet<String>, anomalies: &mut Vec<Anomaly>) -> Question {
	let number = block.select(&QUESTION_NUMBER).next().and_then(|el| text_of(el).parse::<u32>().ok());
	if number.is_none() {
		anomalies.push(Anomaly::MissingNumber { question: index });
	}

	let region = block.select(&FORMULATION).next().or_else(|| block.select(&CONTENT).next());
	if region.is_none() {
		anomalies.push(Anomaly::MissingContent { question: index });
	}
	let region = region.unwrap_or(block);

	let mut walk = Walk::new(region, labels, field_names);
	walk.visit(region);
	for _ in 0..walk.empty_subquestions {
		anomalies.push(Anomaly::EmptySubquestion { question: index });
	}
	anomalies.extend(walk.duplicates.drain(..).map(|name| Anomaly::DuplicateField { question: index, name }));

	let sequence_check = block
		.select(&INPUT)
		.find(|i| i.value().attr("name").is_some_and(|n| n.ends_with(SEQUENCE_CHECK_SUFFIX)))
		.and_then(|i| i.value().attr("value"))
		.map(str::to_owned);
	if sequence_check.is_none() {
		anomalies.push(Anomaly::MissingSequenceCheck { question: index });
	}

	Question {
		number: number.unwrap_or(0),
		id: block.value().id().map(str::to_owned),
		qtype: question_type(block.value()),
		text: normalize_ws(&walk.text),
		sequence_check,
		fields: walk.fields,
	}
}

/// Reads the raw class attribute: `Element::classes` comes back sorted, and the type is
/// the class written right after `que`
fn question_type(element: &Element) -> String {
	element.attr("class").unwrap_or_default().split_whitespace().find(|c| !NON_TYPE_CLASSES.contains(c)).unwrap_or("unknown").to_string()
}

/// Single pre-order pass over a question's content region.
///
/// A `.subquestion` wrapper claims the control inside it and its whole subtree, so a
/// wrapped control is never seen again as a bare one; bare controls are only taken when
/// their name follows the answer naming scheme. Both kinds are numbered in document order.
/// A name already taken anywhere in the attempt yields no second field.
struct Walk<'a, 'n> {
	scope: ElementRef<'a>,
	labels: &'a QuizLabels,
	field_names: &'n mut HashSet<String>,
	text: String,
	fields: Vec<Field>,
	/// Radio groups of this question; their later buttons are expected repeats
	radio_groups: HashSet<String>,
	duplicates: Vec<String>,
	empty_subquestions: usize,
}

impl<'a, 'n> Walk<'a, 'n> {
	fn new(scope: ElementRef<'a>, labels: &'a QuizLabels, field_names: &'n mut HashSet<String>) -> Self {
		Self {
			scope,
			labels,
			field_names,
			text: String::new(),
			fields: Vec::new(),
			radio_groups: HashSet::new(),
			duplicates: Vec::new(),
			empty_subquestions: 0,
		}
	}

	fn visit(&mut self, el: ElementRef<'a>) {
		for child in el.children() {
			match child.value() {
				Node::Text(text) => self.text.push_str(text),
				Node::Element(_) =>
					if let Some(child_el) = ElementRef::wrap(child) {
						self.visit_element(child_el);
					},
				_ => {}
			}
		}
	}

	fn visit_element(&mut self, el: ElementRef<'a>) {
		let element = el.value();
		if is_hidden(element) {
			return;
		}
		match element.name() {
			"script" => {
				if let Some(tex) = tex_script(el) {
					self.text.push_str(&tex);
				}
				return;
			}
			"style" | "noscript" => return,
			_ => {}
		}

		if has_class(element, "subquestion") {
			match subquestion_control(el) {
				Some(control) => {
					self.take_control(control);
					return;
				}
				None => self.empty_subquestions += 1,
			}
		}

		if is_control(element) {
			if is_bare_answer_control(element) {
				self.take_control(el);
			}
			return;
		}

		let block = is_block(element.name());
		if block {
			self.text.push(' ');
		}
		self.visit(el);
		if block {
			self.text.push(' ');
		}
	}

	fn take_control(&mut self, control: ElementRef<'a>) {
		let element = control.value();
		let Some(name) = element.attr("name").filter(|n| !n.is_empty()) else {
			self.empty_subquestions += 1;
			return;
		};

		let radio = element.name() == "input" && input_type(element) == "radio";
		if radio && self.radio_groups.contains(name) {
			return;
		}
		if !self.field_names.insert(name.to_string()) {
			self.duplicates.push(name.to_string());
			return;
		}

		let kind = match (element.name(), input_type(element)) {
			("select", _) => FieldKind::Select {
				options: control.select(&OPTION).filter_map(|o| self.keep_option(o.value().attr("value")?, &text_of(o))).collect(),
			},
			("input", "radio") => {
				self.radio_groups.insert(name.to_string());
				FieldKind::Select { options: self.radio_options(name) }
			}
			("input", "checkbox") => {
				let value = element.attr("value").unwrap_or("1");
				FieldKind::Select {
					options: self.keep_option(value, &self.control_label(control)).into_iter().collect(),
				}
			}
			_ => FieldKind::Text,
		};

		self.fields.push(Field::new(name, kind));
		self.text.push_str(&format!(" [BLANK_{}] ", self.fields.len()));
	}

	/// Drops empty values, and the "nothing selected" value when its label is an instruction
	fn keep_option(&self, value: &str, label: &str) -> Option<SelectOption> {
		if value.is_empty() || (value == UNSELECTED_VALUE && self.labels.is_placeholder(label)) {
			return None;
		}
		Some(SelectOption::new(value, label))
	}

	fn radio_options(&self, name: &str) -> Vec<SelectOption> {
		self.scope
			.select(&INPUT)
			.filter(|i| i.value().attr("name") == Some(name) && input_type(i.value()) == "radio" && !within_hidden(*i))
			.filter_map(|radio| self.keep_option(radio.value().attr("value")?, &self.control_label(radio)))
			.collect()
	}

	/// Label text of a radio/checkbox: `aria-labelledby`, then `label[for]`, then the parent's text
	fn control_label(&self, control: ElementRef<'a>) -> String {
		let element = control.value();
		if let Some(label_id) = element.attr("aria-labelledby")
			&& let Some(label) = find_by_id(self.scope, label_id)
		{
			return text_of(label);
		}
		if let Some(id) = element.id()
			&& let Some(label) = self.scope.select(&LABEL).find(|l| l.value().attr("for") == Some(id))
		{
			return text_of(label);
		}
		control.parent().and_then(ElementRef::wrap).map(text_of).unwrap_or_default()
	}
}

fn subquestion_control(wrapper: ElementRef<'_>) -> Option<ElementRef<'_>> {
	SUBQUESTION_CONTROL
		.iter()
		.find_map(|selector| wrapper.select(selector).find(|c| c.value().name() != "input" || !NON_ANSWER_INPUTS.contains(&input_type(c.value()))))
}

fn is_hidden(element: &Element) -> bool {
	is_screen_reader_only(element) || has_class(element, CLEAR_CHOICE)
}

fn within_hidden(el: ElementRef<'_>) -> bool {
	std::iter::once(*el).chain(el.ancestors()).filter_map(ElementRef::wrap).any(|e| is_hidden(e.value()))
}

fn is_control(element: &Element) -> bool {
	matches!(element.name(), "input" | "select" | "textarea")
}

fn is_bare_answer_control(element: &Element) -> bool {
	if element.name() == "input" && NON_ANSWER_INPUTS.contains(&input_type(element)) {
		return false;
	}
	element.attr("name").is_some_and(|n| ANSWER_NAME.is_match(n) && !n.contains("sequencecheck"))
}

fn input_type(element: &Element) -> &str {
	element.attr("type").unwrap_or("text")
}

fn find_by_id<'b>(scope: ElementRef<'b>, id: &str) -> Option<ElementRef<'b>> {
	scope.descendants().filter_map(ElementRef::wrap).find(|el| el.value().id() == Some(id))
}

/// Legacy MathJax keeps the TeX source in `<script type="math/tex">`
fn tex_script(el: ElementRef<'_>) -> Option<String> {
	let kind = el.value().attr("type")?;
	if !kind.contains("math/tex") {
		return None;
	}
	let tex = el.text().collect::<String>();
	Some(if kind.contains("mode=display") { format!(" \\[{tex}\\] ") } else { format!(" \\({tex}\\) ") })
}

fn is_block(name: &str) -> bool {
	matches!(
		name,
		"p" | "div" | "br" | "li" | "ul" | "ol" | "table" | "tr" | "td" | "th" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "blockquote" | "pre" | "hr" | "section"
	)
}
