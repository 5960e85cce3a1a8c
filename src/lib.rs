use std::fmt;

use derive_new::new;
use serde::{Deserialize, Serialize};

pub mod api;
pub mod attempt;
pub mod config;
pub mod error;
mod html;
pub mod login;
pub mod pages;
pub mod session;
pub mod submit;

pub use api::MoodleClient;
pub use attempt::{extract, extract_with};
pub use config::{ClientConfig, QuizLabels};
pub use error::{ExtractionError, MoodleError, Rejection, SubmissionError};
pub use login::LoginOutcome;
pub use session::{MoodleSession, SiteCookies};
pub use submit::{Answers, FormPayload, PreparedSubmission, SubmitWarning, Submitted, build_payload};

/// Detects if a URL points at a quiz attempt page
pub fn is_attempt_url(url: &str) -> bool {
	url.contains("/mod/quiz/attempt.php")
}

/// An option of a select-type field
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, new)]
pub struct SelectOption {
	/// The value attribute (what gets submitted)
	#[new(into)]
	pub value: String,
	/// The display text
	#[new(into)]
	pub label: String,
}

/// What kind of answer a field takes
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
	/// One value out of an enumerated list (dropdown, radio group, checkbox)
	Select { options: Vec<SelectOption> },
	/// Free text (text input or textarea)
	Text,
}

/// One editable answer control of a question
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, new)]
pub struct Field {
	/// The form-field name, e.g. `q566739:1_sub1_answer`. Answers are keyed by exactly this.
	#[new(into)]
	pub name: String,
	pub kind: FieldKind,
}

impl Field {
	/// Options of a select field (empty for text fields)
	pub fn options(&self) -> &[SelectOption] {
		match &self.kind {
			FieldKind::Select { options } => options,
			FieldKind::Text => &[],
		}
	}

	pub fn is_select(&self) -> bool {
		matches!(self.kind, FieldKind::Select { .. })
	}
}

/// One question block of an attempt page
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Question {
	/// Displayed question number, 1-based; 0 when the page did not show one
	pub number: u32,
	/// DOM id of the question block, e.g. `question-566730-1`
	pub id: Option<String>,
	/// Question type as the server names it (`multianswer`, `multichoice`, `essay`, ...)
	pub qtype: String,
	/// Question text with every answer control replaced by `[BLANK_n]`
	pub text: String,
	/// The `:sequencecheck` token that has to be echoed on submission
	pub sequence_check: Option<String>,
	pub fields: Vec<Field>,
}

impl Question {
	/// Form-name prefix shared by this question's fields (`q566739:1` for `q566739:1_sub1_answer`)
	pub fn field_prefix(&self) -> Option<&str> {
		self.fields.first().and_then(|f| f.name.split('_').next()).filter(|p| !p.is_empty())
	}

	/// Whether a submission can carry this question's sequence check under the right name
	pub fn is_resequenceable(&self) -> bool {
		self.sequence_check.is_some() && self.field_prefix().is_some()
	}
}

impl fmt::Display for Question {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "{}", self.text)?;
		if self.fields.is_empty() {
			return Ok(());
		}
		writeln!(f)?;
		for (i, field) in self.fields.iter().enumerate() {
			match &field.kind {
				FieldKind::Text => writeln!(f, "  [BLANK_{}] {} (text)", i + 1, field.name)?,
				FieldKind::Select { options } => {
					writeln!(f, "  [BLANK_{}] {} (select)", i + 1, field.name)?;
					for option in options {
						writeln!(f, "      {} = {}", option.value, option.label)?;
					}
				}
			}
		}
		Ok(())
	}
}

/// Something off about one part of an attempt page that did not stop extraction
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "anomaly", rename_all = "snake_case")]
pub enum Anomaly {
	/// No readable `.qno`; the question's number defaulted to 0
	MissingNumber { question: usize },
	/// No `.formulation` / `.content` region; text and fields came from the whole block
	MissingContent { question: usize },
	/// No `:sequencecheck` input; answers to this question may be discarded by the server
	MissingSequenceCheck { question: usize },
	/// A `.subquestion` wrapper without any answer control inside
	EmptySubquestion { question: usize },
	/// A control whose name an earlier field of the attempt already took; it was skipped
	DuplicateField { question: usize, name: String },
	/// A page bookkeeping field (`thispage` / `nextpage`) that is not a number
	MalformedPageField { field: String, value: String },
}

impl fmt::Display for Anomaly {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Anomaly::MissingNumber { question } => write!(f, "question #{} has no number", question + 1),
			Anomaly::MissingContent { question } => write!(f, "question #{} has no content region", question + 1),
			Anomaly::MissingSequenceCheck { question } => write!(f, "question #{} has no sequencecheck token", question + 1),
			Anomaly::EmptySubquestion { question } => write!(f, "question #{} has a subquestion without a control", question + 1),
			Anomaly::DuplicateField { question, name } => write!(f, "question #{} repeats field `{name}`; the repeat was skipped", question + 1),
			Anomaly::MalformedPageField { field, value } => write!(f, "page field `{field}` has non-numeric value {value:?}"),
		}
	}
}

/// Everything needed to answer one attempt page.
///
/// Produced fresh from each page fetch. The server invalidates the tokens after any
/// submission, so a context must not be reused once it has been posted.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AttemptContext {
	pub attempt_id: String,
	/// Anti-CSRF key echoed as `sesskey`
	pub session_key: String,
	/// Server-opaque list of the slots shown on this page
	pub slots: String,
	/// Index of the page this context was read from
	pub this_page: u32,
	/// Index of the following page, -1 on the last page
	pub next_page: i32,
	pub questions: Vec<Question>,
	pub anomalies: Vec<Anomaly>,
}

impl AttemptContext {
	pub fn fields(&self) -> impl Iterator<Item = &Field> {
		self.questions.iter().flat_map(|q| q.fields.iter())
	}

	pub fn field(&self, name: &str) -> Option<&Field> {
		self.fields().find(|f| f.name == name)
	}

	/// The question owning a field
	pub fn question_of(&self, field_name: &str) -> Option<&Question> {
		self.questions.iter().find(|q| q.fields.iter().any(|f| f.name == field_name))
	}
}
