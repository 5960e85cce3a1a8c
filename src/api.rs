use std::{
	path::{Path, PathBuf},
	sync::LazyLock,
};

use futures::StreamExt as _;
use percent_encoding::percent_decode_str;
use regex::Regex;
use reqwest::{
	Response,
	header::{CONTENT_DISPOSITION, LOCATION},
};
use tokio::io::AsyncWriteExt as _;
use url::Url;

use crate::{
	AttemptContext,
	attempt::extract_with,
	config::ClientConfig,
	error::{MoodleError, SubmissionError},
	login::LoginOutcome,
	pages::{self, AssignmentDetails, Category, Course, FolderDetails, ForumDetails, PageDetails, QuizDetails, Section},
	session::MoodleSession,
	submit::{Answers, Submitted},
};

static DISPOSITION_FILENAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"filename\*=UTF-8''([^;]+)|filename="([^"]+)"|filename=([^;]+)"#).expect("static regex"));

const FALLBACK_FILENAME: &str = "downloaded_file";

/// High-level access to one Moodle site
#[derive(Clone, Debug)]
pub struct MoodleClient {
	session: MoodleSession,
}

impl MoodleClient {
	pub fn new(config: ClientConfig) -> Result<Self, MoodleError> {
		Ok(Self { session: MoodleSession::new(config)? })
	}

	pub fn session(&self) -> &MoodleSession {
		&self.session
	}

	pub fn load_session(&self) -> Result<bool, MoodleError> {
		self.session.load_session()
	}

	pub async fn login(&self, username: &str, password: &str) -> Result<LoginOutcome, MoodleError> {
		self.session.authenticate(username, password).await
	}

	pub async fn is_logged_in(&self) -> bool {
		self.session.is_logged_in().await
	}

	/// Fetch any site page, following redirects. Returns the final URL and the body.
	pub async fn get_html(&self, url: &str) -> Result<(Url, String), MoodleError> {
		self.session.get_html(self.session.url(url)?).await
	}

	async fn page(&self, path: &str) -> Result<String, MoodleError> {
		let (_, body) = self.get_html(path).await?;
		Ok(body)
	}

	pub async fn get_my_courses(&self) -> Result<Vec<Course>, MoodleError> {
		Ok(pages::parse_my_courses(&self.page("").await?))
	}

	pub async fn get_course_contents(&self, course_id: u64) -> Result<Vec<Section>, MoodleError> {
		Ok(pages::parse_course_contents(&self.page(&format!("course/view.php?id={course_id}")).await?))
	}

	/// Root categories come from the front page, subcategories from the category index
	pub async fn get_course_categories(&self, parent: Option<u64>) -> Result<Vec<Category>, MoodleError> {
		let html = match parent {
			Some(id) => self.page(&format!("course/index.php?categoryid={id}")).await?,
			None => self.page("").await?,
		};
		Ok(pages::parse_categories(&html, parent.is_some()))
	}

	/// Direct file URL of a resource module
	pub async fn get_resource_download_url(&self, resource_id: u64) -> Result<Option<String>, MoodleError> {
		self.resolve_module(&format!("mod/resource/view.php?id={resource_id}"), pages::parse_resource_url).await
	}

	/// Target of a URL module
	pub async fn get_external_url(&self, url_id: u64) -> Result<Option<String>, MoodleError> {
		self.resolve_module(&format!("mod/url/view.php?id={url_id}"), pages::parse_external_url).await
	}

	/// Modules configured to redirect answer with their target; the others embed it in the page
	async fn resolve_module(&self, path: &str, parse: fn(&str) -> Option<String>) -> Result<Option<String>, MoodleError> {
		let url = self.session.url(path)?;
		let response = self.session.get_no_redirect(url.clone()).await?;
		let status = response.status();
		if status.is_redirection() {
			return Ok(response.headers().get(LOCATION).and_then(|v| v.to_str().ok()).map(str::to_owned));
		}
		if !status.is_success() {
			return Err(MoodleError::Status {
				status: status.as_u16(),
				url: url.to_string(),
			});
		}
		Ok(parse(&response.text().await?))
	}

	pub async fn get_folder_details(&self, folder_id: u64) -> Result<FolderDetails, MoodleError> {
		Ok(pages::parse_folder(&self.page(&format!("mod/folder/view.php?id={folder_id}")).await?))
	}

	pub async fn get_assignment_details(&self, assign_id: u64) -> Result<AssignmentDetails, MoodleError> {
		Ok(pages::parse_assignment(&self.page(&format!("mod/assign/view.php?id={assign_id}")).await?))
	}

	pub async fn get_forum_details(&self, forum_id: u64) -> Result<ForumDetails, MoodleError> {
		Ok(pages::parse_forum(&self.page(&format!("mod/forum/view.php?id={forum_id}")).await?))
	}

	pub async fn get_page_details(&self, page_id: u64) -> Result<PageDetails, MoodleError> {
		Ok(pages::parse_page(&self.page(&format!("mod/page/view.php?id={page_id}")).await?))
	}

	pub async fn get_quiz_details(&self, quiz_id: u64) -> Result<QuizDetails, MoodleError> {
		Ok(pages::parse_quiz(&self.page(&format!("mod/quiz/view.php?id={quiz_id}")).await?))
	}

	pub async fn start_attempt(&self, cmid: &str, session_key: &str) -> Result<Url, MoodleError> {
		self.session.start_attempt(cmid, session_key).await
	}

	/// Fetch an attempt page and extract it. Returns the page body as well, for callers that keep it.
	pub async fn fetch_attempt(&self, url: &str) -> Result<(AttemptContext, String), MoodleError> {
		let (final_url, html) = self.get_html(url).await?;
		let context = extract_with(&html, &self.session.config().labels)?;
		tracing::info!(url = %final_url, attempt = %context.attempt_id, questions = context.questions.len(), "fetched attempt page");
		Ok((context, html))
	}

	pub async fn submit(&self, context: &AttemptContext, answers: &Answers, finish: bool) -> Result<Submitted, SubmissionError> {
		self.session.submit(context, answers, finish).await
	}

	pub async fn finish(&self, attempt_id: &str, session_key: &str, cmid: &str) -> Result<Url, SubmissionError> {
		self.session.finish(attempt_id, session_key, cmid).await
	}

	/// Stream a file to disk. When `save_path` is an existing directory the file name comes
	/// from the response. Returns the path written.
	pub async fn download_file(&self, url: &str, save_path: &Path) -> Result<PathBuf, MoodleError> {
		let url = self.session.url(url)?;
		let response = self.session.get(url.clone()).await?;

		let target = if save_path.is_dir() {
			let disposition = response.headers().get(CONTENT_DISPOSITION).and_then(|v| v.to_str().ok());
			save_path.join(download_filename(disposition, response.url()))
		} else {
			save_path.to_path_buf()
		};

		let written = match write_body(response, &target).await {
			Ok(written) => written,
			Err(e) => {
				if let Err(rm) = tokio::fs::remove_file(&target).await {
					tracing::warn!(path = %target.display(), "Failed to remove partial download: {rm}");
				}
				return Err(e);
			}
		};

		tracing::info!(%url, path = %target.display(), bytes = written, "downloaded file");
		Ok(target)
	}
}

async fn write_body(response: Response, target: &Path) -> Result<usize, MoodleError> {
	let mut file = tokio::fs::File::create(target).await?;
	let mut stream = response.bytes_stream();
	let mut written = 0usize;
	while let Some(chunk) = stream.next().await {
		let chunk = chunk?;
		written += chunk.len();
		file.write_all(&chunk).await?;
	}
	file.flush().await?;
	Ok(written)
}

/// File name for a download: `Content-Disposition`, then the URL's last path segment, then a fixed fallback.
/// Always a bare name, never a path.
pub fn download_filename(content_disposition: Option<&str>, url: &Url) -> String {
	let from_header = content_disposition.and_then(filename_from_content_disposition);
	let from_url = || {
		url.path_segments()
			.and_then(|mut segments| segments.next_back())
			.map(|last| percent_decode_str(last).decode_utf8_lossy().into_owned())
			.and_then(sanitize)
	};
	from_header.or_else(from_url).unwrap_or_else(|| FALLBACK_FILENAME.to_string())
}

/// `filename*=UTF-8''…`, `filename="…"` or bare `filename=…`, percent-decoded
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
	let captures = DISPOSITION_FILENAME.captures(header)?;
	let raw = (1..=3).find_map(|i| captures.get(i))?.as_str().trim();
	sanitize(percent_decode_str(raw).decode_utf8_lossy().into_owned())
}

/// Keep only the final path component so a hostile header cannot escape the target directory
fn sanitize(name: String) -> Option<String> {
	let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
	(!base.is_empty() && base != "." && base != "..").then(|| base.to_string())
}
