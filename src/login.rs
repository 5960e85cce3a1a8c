use std::sync::LazyLock;

use reqwest::header::{HeaderMap, HeaderValue, LOCATION, ORIGIN, REFERER};
use scraper::{Html, Selector};

use crate::{
	error::MoodleError,
	html::sel,
	session::{LOGIN_PATH, MoodleSession},
};

static LOGIN_TOKEN: LazyLock<Selector> = LazyLock::new(|| sel(r#"input[name="logintoken"]"#));

/// Phrases the login page shows after a rejected username/password
const INVALID_LOGIN_MARKERS: &[&str] = &["Invalid login", "ログインが無効"];

/// Result of a credential POST
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoginOutcome {
	LoggedIn,
	/// The site explicitly rejected the username/password
	InvalidCredentials,
	/// Still on the login page without an error message (SSO-only site, changed form, ...)
	StillOnLoginPage,
}

impl LoginOutcome {
	pub fn is_success(self) -> bool {
		self == LoginOutcome::LoggedIn
	}
}

impl MoodleSession {
	/// Log in through the site's own login form and persist the session on success
	pub async fn authenticate(&self, username: &str, password: &str) -> Result<LoginOutcome, MoodleError> {
		let login_url = self.login_url().clone();
		let (_, page) = self.get_html(login_url.clone()).await?;

		let mut form = vec![("username".to_string(), username.to_string()), ("password".to_string(), password.to_string())];
		match find_login_token(&page) {
			Some(token) => form.push(("logintoken".to_string(), token)),
			None => tracing::warn!("login page has no logintoken, posting without it"),
		}

		let mut headers = HeaderMap::new();
		headers.insert(REFERER, HeaderValue::from_str(login_url.as_str())?);
		headers.insert(ORIGIN, HeaderValue::from_str(&login_url.origin().ascii_serialization())?);

		let response = self.post_form(login_url, &form, headers).await?;
		let final_url = response.url().clone();
		if !final_url.as_str().contains(LOGIN_PATH) {
			tracing::info!(url = %final_url, "logged in");
			self.save_session()?;
			return Ok(LoginOutcome::LoggedIn);
		}

		let body = response.text().await?;
		if INVALID_LOGIN_MARKERS.iter().any(|marker| body.contains(marker)) {
			tracing::warn!("login rejected: invalid credentials");
			Ok(LoginOutcome::InvalidCredentials)
		} else {
			tracing::warn!(url = %final_url, "login did not leave the login page");
			Ok(LoginOutcome::StillOnLoginPage)
		}
	}

	/// Probe the site root without following redirects.
	///
	/// Anonymous visitors get bounced to the login page; any request failure counts as
	/// logged out.
	pub async fn is_logged_in(&self) -> bool {
		let response = match self.get_no_redirect(self.base_url().clone()).await {
			Ok(r) => r,
			Err(e) => {
				tracing::debug!("login check failed: {e}");
				return false;
			}
		};
		let status = response.status();
		if status.is_redirection() {
			let location = response.headers().get(LOCATION).and_then(|v| v.to_str().ok()).unwrap_or_default();
			return !location.contains(LOGIN_PATH);
		}
		status.is_success() && !response.url().as_str().contains(LOGIN_PATH)
	}
}

pub fn find_login_token(html: &str) -> Option<String> {
	let document = Html::parse_document(html);
	document.select(&LOGIN_TOKEN).next().and_then(|el| el.value().attr("value")).filter(|v| !v.is_empty()).map(str::to_owned)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn login_token_is_read_from_the_form() {
		let html = r#"<form class="login-form" action="https://moodle.example.ac.jp/login/index.php" method="post" id="login">
			<input type="hidden" name="logintoken" value="Xq1TzM0y8u">
			<input type="text" name="username" id="username"></form>"#;
		assert_eq!(find_login_token(html).as_deref(), Some("Xq1TzM0y8u"));
		assert_eq!(find_login_token("<form></form>"), None);
	}

	#[test]
	fn outcome_success() {
		assert!(LoginOutcome::LoggedIn.is_success());
		assert!(!LoginOutcome::InvalidCredentials.is_success());
	}
}
