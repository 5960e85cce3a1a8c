use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::MoodleError;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClientConfig {
	/// Root of the Moodle install, e.g. `https://moodle.example.ac.jp/moodle/`
	pub base_url: String,
	/// Where the cookie set is persisted between runs
	#[serde(default = "default_session_file")]
	pub session_file: PathBuf,
	#[serde(default = "default_user_agent")]
	pub user_agent: String,
	#[serde(default = "default_accept")]
	pub accept: String,
	#[serde(default = "default_accept_language")]
	pub accept_language: String,
	/// Locale-dependent strings the quiz protocol matches on
	#[serde(default)]
	pub labels: QuizLabels,
	/// Used by the CLI when no credentials are passed on the command line
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub password: Option<String>,
}

fn default_session_file() -> PathBuf {
	PathBuf::from("session.json")
}

fn default_user_agent() -> String {
	"Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()
}

fn default_accept() -> String {
	"text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,application/apng,*/*;q=0.8".to_string()
}

fn default_accept_language() -> String {
	"ja,en-US;q=0.9,en;q=0.8".to_string()
}

impl ClientConfig {
	pub fn new(base_url: impl Into<String>) -> Self {
		Self {
			base_url: base_url.into(),
			session_file: default_session_file(),
			user_agent: default_user_agent(),
			accept: default_accept(),
			accept_language: default_accept_language(),
			labels: QuizLabels::default(),
			username: None,
			password: None,
		}
	}

	/// Read a TOML config file
	pub fn load(path: &Path) -> Result<Self, MoodleError> {
		let raw = std::fs::read_to_string(path)?;
		Ok(toml::from_str(&raw)?)
	}
}

/// Button texts and placeholder phrases of the quiz UI.
///
/// The server matches the terminal `next` control by its *text*, which follows the
/// site's language pack. There is no locale-independent name for it, so deployments
/// running a non-English language pack must override `finish_label` (and usually
/// `continue_label`).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct QuizLabels {
	/// Value sent as `next` when moving on to the next page
	#[serde(default = "default_continue_label")]
	pub continue_label: String,
	/// Value sent as `next` when finishing the attempt
	#[serde(default = "default_finish_label")]
	pub finish_label: String,
	/// Label prefixes identifying the "Choose..." entry of a select
	#[serde(default = "default_placeholder_prefixes")]
	pub placeholder_prefixes: Vec<String>,
}

fn default_continue_label() -> String {
	"Next page".to_string()
}

fn default_finish_label() -> String {
	"Finish attempt ...".to_string()
}

fn default_placeholder_prefixes() -> Vec<String> {
	["Choose", "Select", "選択"].into_iter().map(String::from).collect()
}

impl Default for QuizLabels {
	fn default() -> Self {
		Self {
			continue_label: default_continue_label(),
			finish_label: default_finish_label(),
			placeholder_prefixes: default_placeholder_prefixes(),
		}
	}
}

impl QuizLabels {
	/// Strings of the Japanese language pack
	pub fn japanese() -> Self {
		Self {
			continue_label: "次のページ".to_string(),
			finish_label: "テストを終了する ...".to_string(),
			..Self::default()
		}
	}

	/// Whether an option label reads like an instruction rather than an answer
	pub fn is_placeholder(&self, label: &str) -> bool {
		let label = label.trim().to_lowercase();
		label.is_empty() || self.placeholder_prefixes.iter().any(|p| label.starts_with(&p.to_lowercase()))
	}
}
