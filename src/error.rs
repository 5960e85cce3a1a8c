//! Error types for the Moodle client.

use url::Url;

/// Why an attempt page could not be turned into an [`AttemptContext`](crate::AttemptContext).
///
/// Both variants are fatal for the call: no partial context is produced.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ExtractionError {
	/// The page has no `#responseform`, so it is not an attempt page at all.
	#[error("not an attempt page: no attempt form found")]
	NotAnAttemptPage,

	/// A hidden token required for submission is absent from the attempt form.
	#[error("attempt form is missing the `{0}` token")]
	MissingToken(&'static str),
}

/// How the server signalled that it did not accept a submission.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Rejection {
	/// The processing endpoint answered without redirecting (usually the form re-rendered).
	#[error("server answered {status} instead of redirecting")]
	NoRedirect {
		/// HTTP status code of the response.
		status: u16,
	},

	/// A redirect status without a `Location` header.
	#[error("redirect without a Location header")]
	MissingLocation,

	/// The redirect points back at the attempt page that was just submitted.
	#[error("server sent the attempt back to the same page ({url})")]
	SameAttemptPage {
		/// Where the server redirected to.
		url: Url,
	},
}

/// Error from posting answers or finishing an attempt.
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
	/// The request went through but the server silently refused it.
	#[error("submission rejected: {0}")]
	Rejected(#[from] Rejection),

	/// Transport-level failure (connection, TLS, body read).
	#[error("HTTP request failed")]
	Network(#[from] reqwest::Error),

	/// The endpoint or redirect target could not be resolved to a URL.
	#[error("invalid URL: {0}")]
	InvalidUrl(#[from] url::ParseError),
}

impl SubmissionError {
	/// True when the server refused the submission, as opposed to the request failing.
	pub fn is_rejection(&self) -> bool {
		matches!(self, SubmissionError::Rejected(_))
	}
}

/// Error from client operations.
#[derive(Debug, thiserror::Error)]
pub enum MoodleError {
	/// HTTP request failed (network error, TLS, body read).
	#[error("HTTP request failed")]
	Request(#[from] reqwest::Error),

	/// Server returned an error status.
	#[error("HTTP error: {status} for {url}")]
	Status {
		/// HTTP status code.
		status: u16,
		/// Requested URL.
		url: String,
	},

	/// Expected a redirect (e.g. from starting an attempt) but got something else.
	#[error("expected a redirect from {url}, got {status}")]
	NoRedirect {
		/// HTTP status code.
		status: u16,
		/// Requested URL.
		url: String,
	},

	/// URL could not be built or parsed.
	#[error("invalid URL: {0}")]
	Url(#[from] url::ParseError),

	/// A configured header value is not valid in HTTP.
	#[error("invalid header value")]
	Header(#[from] reqwest::header::InvalidHeaderValue),

	/// Session/config/download file I/O.
	#[error("I/O error")]
	Io(#[from] std::io::Error),

	/// Session file is not valid JSON.
	#[error("session file JSON error")]
	Json(#[from] serde_json::Error),

	/// Config file is not valid TOML.
	#[error("config parse error")]
	Config(#[from] toml::de::Error),

	#[error(transparent)]
	Extraction(#[from] ExtractionError),

	#[error(transparent)]
	Submission(#[from] SubmissionError),
}
