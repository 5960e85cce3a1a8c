//! HTTP transport bound to one Moodle site: cookie jar, default headers, session file.

use std::{
	collections::BTreeMap,
	path::Path,
	sync::{Arc, MutexGuard, PoisonError},
};

use reqwest::{
	Client, Response,
	header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT},
	redirect,
};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex, RawCookie};
use url::Url;

use crate::{config::ClientConfig, error::MoodleError};

/// Path of the login form, relative to the site root
pub const LOGIN_PATH: &str = "login/index.php";

/// Cookie jar of one site.
///
/// Cookies are scoped by domain, path and `Secure` the way a browser does it
/// (`cookie_store`), so nothing set by the site leaves it. The flat `name -> value` view
/// is what the site's root would receive, and is the shape of the session file.
#[derive(Clone, Debug)]
pub struct SiteCookies {
	site: Url,
	store: Arc<CookieStoreMutex>,
}

impl SiteCookies {
	pub fn new(site: Url) -> Self {
		Self {
			site,
			store: Arc::new(CookieStoreMutex::default()),
		}
	}

	fn lock(&self) -> MutexGuard<'_, CookieStore> {
		self.store.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Store handed to the HTTP clients
	fn provider(&self) -> Arc<CookieStoreMutex> {
		Arc::clone(&self.store)
	}

	pub fn get(&self, name: &str) -> Option<String> {
		self.lock().get_request_values(&self.site).find(|(n, _)| *n == name).map(|(_, v)| v.to_string())
	}

	/// Set a host-only cookie for the whole site host
	pub fn insert(&self, name: impl Into<String>, value: impl Into<String>) {
		let mut cookie = RawCookie::new(name.into(), value.into());
		cookie.set_path("/");
		if let Err(e) = self.lock().insert_raw(&cookie, &self.site) {
			tracing::warn!(cookie = cookie.name(), "cookie rejected: {e}");
		}
	}

	pub fn snapshot(&self) -> BTreeMap<String, String> {
		self.lock().get_request_values(&self.site).map(|(n, v)| (n.to_string(), v.to_string())).collect()
	}

	/// Replace the whole cookie set
	pub fn replace(&self, cookies: BTreeMap<String, String>) {
		self.lock().clear();
		for (name, value) in cookies {
			self.insert(name, value);
		}
	}

	pub fn is_empty(&self) -> bool {
		self.lock().get_request_values(&self.site).next().is_none()
	}
}

/// One authenticated (or not yet authenticated) browsing session against a Moodle site.
///
/// Holds a redirect-following client for page fetches and a redirect-suppressing one for
/// the endpoints whose answer *is* the redirect. Both share the cookie jar.
#[derive(Clone, Debug)]
pub struct MoodleSession {
	config: ClientConfig,
	base_url: Url,
	login_url: Url,
	cookies: SiteCookies,
	client: Client,
	no_redirect: Client,
}

impl MoodleSession {
	pub fn new(config: ClientConfig) -> Result<Self, MoodleError> {
		let mut base = config.base_url.trim().to_string();
		if !base.ends_with('/') {
			base.push('/');
		}
		let base_url = Url::parse(&base)?;
		let login_url = base_url.join(LOGIN_PATH)?;

		let mut headers = HeaderMap::new();
		headers.insert(USER_AGENT, HeaderValue::from_str(&config.user_agent)?);
		headers.insert(ACCEPT, HeaderValue::from_str(&config.accept)?);
		headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_str(&config.accept_language)?);

		let cookies = SiteCookies::new(base_url.clone());
		let client = Client::builder().default_headers(headers.clone()).cookie_provider(cookies.provider()).build()?;
		let no_redirect = Client::builder()
			.default_headers(headers)
			.cookie_provider(cookies.provider())
			.redirect(redirect::Policy::none())
			.build()?;

		Ok(Self {
			config,
			base_url,
			login_url,
			cookies,
			client,
			no_redirect,
		})
	}

	pub fn config(&self) -> &ClientConfig {
		&self.config
	}

	pub fn base_url(&self) -> &Url {
		&self.base_url
	}

	pub fn login_url(&self) -> &Url {
		&self.login_url
	}

	pub fn cookies(&self) -> &SiteCookies {
		&self.cookies
	}

	/// Resolve a site-relative path (or an absolute URL) against the base URL
	pub fn url(&self, path: &str) -> Result<Url, MoodleError> {
		Ok(self.base_url.join(path.trim_start_matches('/'))?)
	}

	/// GET following redirects; non-2xx final responses are errors
	pub async fn get(&self, url: Url) -> Result<Response, MoodleError> {
		tracing::info!(%url, "GET");
		let response = self.client.get(url).send().await?;
		check_status(response)
	}

	/// GET without following redirects. The status is not checked.
	pub async fn get_no_redirect(&self, url: Url) -> Result<Response, MoodleError> {
		tracing::info!(%url, "GET (no redirect)");
		Ok(self.no_redirect.get(url).send().await?)
	}

	/// GET a page and return its final URL and body
	pub async fn get_html(&self, url: Url) -> Result<(Url, String), MoodleError> {
		let response = self.get(url).await?;
		let final_url = response.url().clone();
		Ok((final_url, response.text().await?))
	}

	/// Form POST following redirects. The status is not checked, callers inspect the final page.
	pub async fn post_form(&self, url: Url, form: &[(String, String)], extra: HeaderMap) -> Result<Response, reqwest::Error> {
		tracing::info!(%url, "POST");
		self.client.post(url).headers(extra).form(form).send().await
	}

	/// Form POST without following redirects
	pub async fn post_form_no_redirect(&self, url: Url, form: &[(String, String)]) -> Result<Response, reqwest::Error> {
		tracing::info!(%url, "POST (no redirect)");
		self.no_redirect.post(url).form(form).send().await
	}

	/// Persist the cookie set as a JSON object
	pub fn save_session(&self) -> Result<(), MoodleError> {
		let path = &self.config.session_file;
		if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			std::fs::create_dir_all(parent)?;
		}
		let json = serde_json::to_string_pretty(&self.cookies.snapshot())?;
		std::fs::write(path, json)?;
		tracing::debug!(path = %path.display(), "saved session");
		Ok(())
	}

	/// Restore cookies from the session file. `Ok(false)` when there is no file yet.
	pub fn load_session(&self) -> Result<bool, MoodleError> {
		load_cookies(&self.config.session_file).map(|loaded| match loaded {
			Some(cookies) => {
				self.cookies.replace(cookies);
				true
			}
			None => false,
		})
	}
}

fn load_cookies(path: &Path) -> Result<Option<BTreeMap<String, String>>, MoodleError> {
	if !path.exists() {
		tracing::debug!(path = %path.display(), "no session file");
		return Ok(None);
	}
	let raw = std::fs::read_to_string(path)?;
	Ok(Some(serde_json::from_str(&raw)?))
}

fn check_status(response: Response) -> Result<Response, MoodleError> {
	let status = response.status();
	if status.is_success() {
		return Ok(response);
	}
	Err(MoodleError::Status {
		status: status.as_u16(),
		url: response.url().to_string(),
	})
}
