//! Answer submission for quiz attempts.
//!
//! The processing endpoint only ever answers with a redirect. Where it points tells
//! whether the answers were taken: onwards to the next page or the summary on success,
//! back to the very page that was posted when it silently dropped them.

use std::{collections::BTreeMap, fmt};

use reqwest::{Response, header::LOCATION};
use serde::Serialize;
use url::Url;

use crate::{
	AttemptContext,
	config::QuizLabels,
	error::{MoodleError, Rejection, SubmissionError},
	session::MoodleSession,
};

pub const PROCESS_PATH: &str = "mod/quiz/processattempt.php";
pub const START_PATH: &str = "mod/quiz/startattempt.php";
pub const ATTEMPT_PATH: &str = "mod/quiz/attempt.php";
pub const SUMMARY_PATH: &str = "mod/quiz/summary.php";

/// Answers keyed by exact form-field name, e.g. `q566739:1_sub1_answer -> "2"`
pub type Answers = BTreeMap<String, String>;

/// Ordered `application/x-www-form-urlencoded` body with unique keys
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct FormPayload(Vec<(String, String)>);

impl FormPayload {
	pub fn get(&self, key: &str) -> Option<&str> {
		self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
	}

	pub fn contains_key(&self, key: &str) -> bool {
		self.get(key).is_some()
	}

	/// Insert or overwrite
	pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
		let (key, value) = (key.into(), value.into());
		match self.0.iter_mut().find(|(k, _)| *k == key) {
			Some(entry) => entry.1 = value,
			None => self.0.push((key, value)),
		}
	}

	/// Insert only when the key is not there yet
	pub fn set_default(&mut self, key: impl Into<String>, value: impl Into<String>) {
		let key = key.into();
		if !self.contains_key(&key) {
			self.0.push((key, value.into()));
		}
	}

	pub fn entries(&self) -> &[(String, String)] {
		&self.0
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

/// Non-fatal problem with a submission the caller should hear about
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub enum SubmitWarning {
	/// The question has a sequence-check token but no field to derive its form prefix from,
	/// so the token could not be echoed. The server may discard the question's state.
	UnresequenceableQuestion { number: u32, id: Option<String> },
}

impl fmt::Display for SubmitWarning {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SubmitWarning::UnresequenceableQuestion { number, id } => {
				write!(f, "question {number}")?;
				if let Some(id) = id {
					write!(f, " ({id})")?;
				}
				write!(f, " has a sequencecheck token but no fields; it was not resequenced")
			}
		}
	}
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PreparedSubmission {
	pub payload: FormPayload,
	pub warnings: Vec<SubmitWarning>,
}

/// Successful submission
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Submitted {
	/// Absolute redirect target: the next attempt page, or the summary page
	pub redirect_url: Url,
	pub warnings: Vec<SubmitWarning>,
}

/// Build the processattempt payload for one attempt page.
///
/// Answers are written before anything derived from the page and are never overwritten,
/// so a caller can override any bookkeeping entry (including `next`).
pub fn build_payload(context: &AttemptContext, answers: &Answers, finish: bool, labels: &QuizLabels) -> PreparedSubmission {
	let mut payload = FormPayload::default();
	payload.set("attempt", &context.attempt_id);
	payload.set("sesskey", &context.session_key);
	payload.set("slots", &context.slots);
	payload.set("thispage", context.this_page.to_string());
	payload.set("nextpage", if finish { "-1".to_string() } else { context.next_page.to_string() });
	payload.set("timeup", "0");
	payload.set("scrollpos", "");

	for (name, value) in answers {
		payload.set(name, value);
	}

	let mut warnings = Vec::new();
	for question in &context.questions {
		let Some(token) = &question.sequence_check else {
			continue;
		};
		let Some(prefix) = question.field_prefix() else {
			warnings.push(SubmitWarning::UnresequenceableQuestion {
				number: question.number,
				id: question.id.clone(),
			});
			continue;
		};
		payload.set_default(format!("{prefix}_:sequencecheck"), token);
		payload.set_default(format!("{prefix}_:flagged"), "0");
	}

	payload.set_default("next", if finish { &labels.finish_label } else { &labels.continue_label });

	PreparedSubmission { payload, warnings }
}

impl MoodleSession {
	/// Post answers for the page `context` was extracted from.
	///
	/// `context` is stale afterwards whatever the outcome: re-fetch the attempt page before
	/// submitting again.
	pub async fn submit(&self, context: &AttemptContext, answers: &Answers, finish: bool) -> Result<Submitted, SubmissionError> {
		let PreparedSubmission { payload, warnings } = build_payload(context, answers, finish, &self.config().labels);
		for warning in &warnings {
			tracing::warn!(attempt = %context.attempt_id, "{warning}");
		}
		tracing::debug!(attempt = %context.attempt_id, fields = payload.len(), finish, "submitting answers");

		let response = self.post_form_no_redirect(self.base_url().join(PROCESS_PATH)?, payload.entries()).await?;
		let target = redirect_target(&response)?;
		if is_same_attempt_page(&target, &context.attempt_id, context.this_page) {
			return Err(Rejection::SameAttemptPage { url: target }.into());
		}
		tracing::info!(attempt = %context.attempt_id, redirect = %target, "answers accepted");

		Ok(Submitted { redirect_url: target, warnings })
	}

	/// Close an attempt from its summary page. Returns the review page URL.
	pub async fn finish(&self, attempt_id: &str, session_key: &str, cmid: &str) -> Result<Url, SubmissionError> {
		let payload = [
			("attempt", attempt_id),
			("finishattempt", "1"),
			("timeup", "0"),
			("slots", ""),
			("cmid", cmid),
			("sesskey", session_key),
		]
		.map(|(k, v)| (k.to_string(), v.to_string()));

		let response = self.post_form_no_redirect(self.base_url().join(PROCESS_PATH)?, &payload).await?;
		let target = redirect_target(&response)?;
		if target.path().ends_with(ATTEMPT_PATH) || target.path().ends_with(SUMMARY_PATH) {
			return Err(Rejection::SameAttemptPage { url: target }.into());
		}
		tracing::info!(attempt = attempt_id, review = %target, "attempt finished");
		Ok(target)
	}

	/// Start (or continue) an attempt of the quiz with course-module id `cmid`.
	/// Returns the attempt page URL.
	pub async fn start_attempt(&self, cmid: &str, session_key: &str) -> Result<Url, MoodleError> {
		let url = self.url(START_PATH)?;
		let payload = [("cmid", cmid), ("sesskey", session_key)].map(|(k, v)| (k.to_string(), v.to_string()));
		let response = self.post_form_no_redirect(url.clone(), &payload).await?;
		match redirect_target(&response) {
			Ok(target) => {
				tracing::info!(cmid, attempt_url = %target, "attempt started");
				Ok(target)
			}
			Err(_) => Err(MoodleError::NoRedirect {
				status: response.status().as_u16(),
				url: url.to_string(),
			}),
		}
	}
}

fn redirect_target(response: &Response) -> Result<Url, SubmissionError> {
	let status = response.status();
	if !status.is_redirection() {
		return Err(Rejection::NoRedirect { status: status.as_u16() }.into());
	}
	let location = response.headers().get(LOCATION).and_then(|v| v.to_str().ok()).ok_or(Rejection::MissingLocation)?;
	Ok(response.url().join(location)?)
}

/// Whether `url` shows the page of the attempt that was just posted
fn is_same_attempt_page(url: &Url, attempt_id: &str, this_page: u32) -> bool {
	if !url.path().ends_with(ATTEMPT_PATH) {
		return false;
	}
	let param = |key: &str| url.query_pairs().find(|(k, _)| k == key).map(|(_, v)| v.into_owned());
	let same_attempt = param("attempt").is_none_or(|a| a == attempt_id);
	let page = param("page").and_then(|p| p.parse::<u32>().ok()).unwrap_or(0);
	same_attempt && page == this_page
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{Field, FieldKind, Question, SelectOption};

	fn question(number: u32, sequence_check: Option<&str>, fields: &[&str]) -> Question {
		Question {
			number,
			id: Some(format!("question-566730-{number}")),
			qtype: "multianswer".to_string(),
			text: String::new(),
			sequence_check: sequence_check.map(str::to_owned),
			fields: fields
				.iter()
				.map(|name| {
					Field::new(
						*name,
						FieldKind::Select {
							options: vec![SelectOption::new("1", "A")],
						},
					)
				})
				.collect(),
		}
	}

	fn context(questions: Vec<Question>) -> AttemptContext {
		AttemptContext {
			attempt_id: "1234".to_string(),
			session_key: "abcDEF123".to_string(),
			slots: "1,2,3".to_string(),
			this_page: 0,
			next_page: 1,
			questions,
			anomalies: Vec::new(),
		}
	}

	#[test]
	fn one_resequencing_pair_per_eligible_question() {
		let ctx = context(vec![
			question(1, Some("3"), &["q566730:1_sub1_answer", "q566730:1_sub2_answer"]),
			question(2, None, &["q566730:2_answer"]),
			question(3, Some("1"), &[]),
		]);
		let prepared = build_payload(&ctx, &Answers::new(), false, &QuizLabels::default());
		let p = &prepared.payload;

		assert_eq!(p.get("q566730:1_:sequencecheck"), Some("3"));
		assert_eq!(p.get("q566730:1_:flagged"), Some("0"));
		assert_eq!(p.entries().iter().filter(|(k, _)| k.ends_with(":sequencecheck")).count(), 1);
		assert!(!p.contains_key("q566730:2_:sequencecheck"));
		assert_eq!(
			prepared.warnings,
			vec![SubmitWarning::UnresequenceableQuestion {
				number: 3,
				id: Some("question-566730-3".to_string())
			}]
		);
	}

	#[test]
	fn continue_without_token() {
		let ctx = context(vec![question(1, None, &["q9:1_answer"])]);
		let answers = Answers::from([("q9:1_answer".to_string(), "1".to_string())]);
		let prepared = build_payload(&ctx, &answers, false, &QuizLabels::default());
		let p = &prepared.payload;

		assert_eq!(p.get("q9:1_answer"), Some("1"));
		assert!(!p.entries().iter().any(|(k, _)| k.contains(":sequencecheck")));
		assert_eq!(p.get("next"), Some("Next page"));
		assert_eq!(p.get("nextpage"), Some("1"));
		assert_eq!(p.get("attempt"), Some("1234"));
		assert_eq!(p.get("sesskey"), Some("abcDEF123"));
		assert_eq!(p.get("slots"), Some("1,2,3"));
		assert_eq!(p.get("timeup"), Some("0"));
		assert_eq!(p.get("scrollpos"), Some(""));
		assert!(prepared.warnings.is_empty());
	}

	#[test]
	fn finish_uses_configured_label() {
		let ctx = context(vec![question(1, Some("2"), &["q1:1_answer"])]);
		let english = build_payload(&ctx, &Answers::new(), true, &QuizLabels::default());
		assert_eq!(english.payload.get("next"), Some("Finish attempt ..."));
		assert_eq!(english.payload.get("nextpage"), Some("-1"));

		let japanese = build_payload(&ctx, &Answers::new(), true, &QuizLabels::japanese());
		assert_eq!(japanese.payload.get("next"), Some("テストを終了する ..."));
		let japanese_continue = build_payload(&ctx, &Answers::new(), false, &QuizLabels::japanese());
		assert_eq!(japanese_continue.payload.get("next"), Some("次のページ"));
	}

	#[test]
	fn caller_keys_are_final() {
		let ctx = context(vec![question(1, Some("7"), &["q1:1_answer"])]);
		let answers = Answers::from([
			("q1:1_:sequencecheck".to_string(), "8".to_string()),
			("next".to_string(), "Save".to_string()),
			("thispage".to_string(), "4".to_string()),
		]);
		let p = build_payload(&ctx, &answers, true, &QuizLabels::default()).payload;
		assert_eq!(p.get("q1:1_:sequencecheck"), Some("8"));
		assert_eq!(p.get("next"), Some("Save"));
		assert_eq!(p.get("thispage"), Some("4"));
		assert_eq!(p.entries().iter().filter(|(k, _)| k == "next").count(), 1);
	}

	#[test]
	fn same_page_detection() {
		let url = |s: &str| Url::parse(s).unwrap();
		assert!(is_same_attempt_page(&url("https://m.example/mod/quiz/attempt.php?attempt=1234&cmid=5"), "1234", 0));
		assert!(is_same_attempt_page(&url("https://m.example/mod/quiz/attempt.php?attempt=1234&page=2"), "1234", 2));
		assert!(!is_same_attempt_page(&url("https://m.example/mod/quiz/attempt.php?attempt=1234&page=1"), "1234", 0));
		assert!(!is_same_attempt_page(&url("https://m.example/mod/quiz/summary.php?attempt=1234"), "1234", 0));
		assert!(!is_same_attempt_page(&url("https://m.example/mod/quiz/attempt.php?attempt=99"), "1234", 0));
	}
}
