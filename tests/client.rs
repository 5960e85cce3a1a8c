use std::path::Path;

use mockito::{Matcher, Server, ServerGuard};
use uni_moodle::{Answers, ClientConfig, LoginOutcome, MoodleClient, MoodleError, MoodleSession, Rejection, SubmissionError};

const ATTEMPT_PAGE: &str = r#"<html><body><div role="main">
<form action="https://moodle.example/mod/quiz/processattempt.php?cmid=5" method="post" id="responseform">
<input type="hidden" name="attempt" value="1234">
<input type="hidden" name="thispage" value="0">
<input type="hidden" name="nextpage" value="1">
<input type="hidden" name="timeup" value="0">
<input type="hidden" name="sesskey" value="abcDEF123">
<input type="hidden" name="scrollpos" value="">
<div id="question-566730-1" class="que multianswer deferredfeedback notyetanswered">
	<div class="info"><h3 class="no">Question <span class="qno">1</span></h3></div>
	<div class="content"><div class="formulation clearfix">
		<input type="hidden" name="q566730:1_:sequencecheck" value="3">
		<p>Water boils at <span class="subquestion"><select name="q566730:1_sub1_answer">
			<option value="0">Choose...</option><option value="1">90</option><option value="2">100</option>
		</select></span> degrees.</p>
	</div></div>
</div>
<input type="hidden" name="slots" value="1">
<input type="submit" name="next" value="Next page">
</form></div></body></html>"#;

fn config(server: &ServerGuard, dir: &Path) -> ClientConfig {
	let mut config = ClientConfig::new(server.url());
	config.session_file = dir.join("session.json");
	config
}

async fn attempt_fixture(server: &mut ServerGuard, client: &MoodleClient) -> uni_moodle::AttemptContext {
	server.mock("GET", "/mod/quiz/attempt.php?attempt=1234&cmid=5").with_status(200).with_body(ATTEMPT_PAGE).create_async().await;
	let (context, _) = client.fetch_attempt("mod/quiz/attempt.php?attempt=1234&cmid=5").await.unwrap();
	context
}

#[tokio::test]
async fn login_stores_session_cookie() {
	let mut server = Server::new_async().await;
	let dir = tempfile::tempdir().unwrap();
	let login_page = server
		.mock("GET", "/login/index.php")
		.with_status(200)
		.with_body(r#"<form id="login" method="post"><input type="hidden" name="logintoken" value="tok3n"></form>"#)
		.create_async()
		.await;
	let post = server
		.mock("POST", "/login/index.php")
		.match_body(Matcher::AllOf(vec![
			Matcher::UrlEncoded("username".into(), "student".into()),
			Matcher::UrlEncoded("password".into(), "hunter2".into()),
			Matcher::UrlEncoded("logintoken".into(), "tok3n".into()),
		]))
		.with_status(303)
		.with_header("location", "/my/")
		.with_header("set-cookie", "MoodleSession=abc123; path=/; HttpOnly")
		.create_async()
		.await;
	let dashboard = server
		.mock("GET", "/my/")
		.match_header("cookie", Matcher::Regex("MoodleSession=abc123".into()))
		.with_status(200)
		.with_body("<html>Dashboard</html>")
		.create_async()
		.await;

	let session = MoodleSession::new(config(&server, dir.path())).unwrap();
	let outcome = session.authenticate("student", "hunter2").await.unwrap();

	assert_eq!(outcome, LoginOutcome::LoggedIn);
	login_page.assert_async().await;
	post.assert_async().await;
	dashboard.assert_async().await;

	let saved = std::fs::read_to_string(dir.path().join("session.json")).unwrap();
	assert!(saved.contains("abc123"));

	let restored = MoodleSession::new(config(&server, dir.path())).unwrap();
	assert!(restored.load_session().unwrap());
	assert_eq!(restored.cookies().get("MoodleSession").as_deref(), Some("abc123"));
}

#[tokio::test]
async fn invalid_credentials_are_reported() {
	let mut server = Server::new_async().await;
	let dir = tempfile::tempdir().unwrap();
	server.mock("GET", "/login/index.php").with_status(200).with_body("<form></form>").create_async().await;
	server
		.mock("POST", "/login/index.php")
		.with_status(200)
		.with_body(r#"<div class="alert alert-danger">Invalid login, please try again</div>"#)
		.create_async()
		.await;

	let session = MoodleSession::new(config(&server, dir.path())).unwrap();
	assert_eq!(session.authenticate("student", "wrong").await.unwrap(), LoginOutcome::InvalidCredentials);
	assert!(!dir.path().join("session.json").exists());
}

#[tokio::test]
async fn login_check_follows_no_redirect() {
	let mut server = Server::new_async().await;
	let dir = tempfile::tempdir().unwrap();
	let login_url = format!("{}/login/index.php", server.url());
	server.mock("GET", "/").with_status(303).with_header("location", &login_url).create_async().await;
	let session = MoodleSession::new(config(&server, dir.path())).unwrap();
	assert!(!session.is_logged_in().await);

	let mut other = Server::new_async().await;
	other.mock("GET", "/").with_status(200).with_body("<html>Dashboard</html>").create_async().await;
	let session = MoodleSession::new(config(&other, dir.path())).unwrap();
	assert!(session.is_logged_in().await);
}

#[tokio::test]
async fn submit_posts_full_payload() {
	let mut server = Server::new_async().await;
	let dir = tempfile::tempdir().unwrap();
	let client = MoodleClient::new(config(&server, dir.path())).unwrap();
	let context = attempt_fixture(&mut server, &client).await;
	assert_eq!(context.questions[0].fields[0].options().len(), 2);

	let process = server
		.mock("POST", "/mod/quiz/processattempt.php")
		.match_body(Matcher::AllOf(vec![
			Matcher::UrlEncoded("attempt".into(), "1234".into()),
			Matcher::UrlEncoded("sesskey".into(), "abcDEF123".into()),
			Matcher::UrlEncoded("slots".into(), "1".into()),
			Matcher::UrlEncoded("q566730:1_sub1_answer".into(), "2".into()),
			Matcher::UrlEncoded("q566730:1_:sequencecheck".into(), "3".into()),
			Matcher::UrlEncoded("q566730:1_:flagged".into(), "0".into()),
			Matcher::UrlEncoded("next".into(), "Next page".into()),
		]))
		.with_status(303)
		.with_header("location", "/mod/quiz/attempt.php?attempt=1234&cmid=5&page=1")
		.create_async()
		.await;

	let answers = Answers::from([("q566730:1_sub1_answer".to_string(), "2".to_string())]);
	let submitted = client.submit(&context, &answers, false).await.unwrap();

	process.assert_async().await;
	assert_eq!(submitted.redirect_url.as_str(), format!("{}/mod/quiz/attempt.php?attempt=1234&cmid=5&page=1", server.url()));
	assert!(submitted.warnings.is_empty());
}

#[tokio::test]
async fn redirect_to_same_page_is_a_rejection() {
	let mut server = Server::new_async().await;
	let dir = tempfile::tempdir().unwrap();
	let client = MoodleClient::new(config(&server, dir.path())).unwrap();
	let context = attempt_fixture(&mut server, &client).await;
	server
		.mock("POST", "/mod/quiz/processattempt.php")
		.with_status(303)
		.with_header("location", "/mod/quiz/attempt.php?attempt=1234&cmid=5")
		.create_async()
		.await;

	let err = client.submit(&context, &Answers::new(), false).await.unwrap_err();
	assert!(err.is_rejection());
	assert!(matches!(err, SubmissionError::Rejected(Rejection::SameAttemptPage { .. })));
}

#[tokio::test]
async fn non_redirect_is_a_rejection() {
	let mut server = Server::new_async().await;
	let dir = tempfile::tempdir().unwrap();
	let client = MoodleClient::new(config(&server, dir.path())).unwrap();
	let context = attempt_fixture(&mut server, &client).await;
	server.mock("POST", "/mod/quiz/processattempt.php").with_status(200).with_body(ATTEMPT_PAGE).create_async().await;

	let err = client.submit(&context, &Answers::new(), true).await.unwrap_err();
	assert!(matches!(err, SubmissionError::Rejected(Rejection::NoRedirect { status: 200 })));
}

#[tokio::test]
async fn redirect_without_location_is_a_rejection() {
	let mut server = Server::new_async().await;
	let dir = tempfile::tempdir().unwrap();
	let client = MoodleClient::new(config(&server, dir.path())).unwrap();
	let context = attempt_fixture(&mut server, &client).await;
	server.mock("POST", "/mod/quiz/processattempt.php").with_status(303).create_async().await;

	let err = client.submit(&context, &Answers::new(), false).await.unwrap_err();
	assert!(err.is_rejection());
	assert!(matches!(err, SubmissionError::Rejected(Rejection::MissingLocation)));
}

#[tokio::test]
async fn unreachable_server_is_a_network_failure() {
	let server = Server::new_async().await;
	let dir = tempfile::tempdir().unwrap();
	let context = uni_moodle::extract(ATTEMPT_PAGE).unwrap();
	let mut config = config(&server, dir.path());
	config.base_url = "http://127.0.0.1:1/".to_string();
	let client = MoodleClient::new(config).unwrap();

	let err = client.submit(&context, &Answers::new(), false).await.unwrap_err();
	assert!(matches!(err, SubmissionError::Network(_)));
	assert!(!err.is_rejection());
}

#[tokio::test]
async fn finish_closes_the_attempt() {
	let mut server = Server::new_async().await;
	let dir = tempfile::tempdir().unwrap();
	let finish = server
		.mock("POST", "/mod/quiz/processattempt.php")
		.match_body(Matcher::AllOf(vec![
			Matcher::UrlEncoded("attempt".into(), "1234".into()),
			Matcher::UrlEncoded("finishattempt".into(), "1".into()),
			Matcher::UrlEncoded("cmid".into(), "5".into()),
			Matcher::UrlEncoded("sesskey".into(), "abcDEF123".into()),
		]))
		.with_status(303)
		.with_header("location", "/mod/quiz/review.php?attempt=1234&cmid=5")
		.create_async()
		.await;

	let client = MoodleClient::new(config(&server, dir.path())).unwrap();
	let review = client.finish("1234", "abcDEF123", "5").await.unwrap();
	finish.assert_async().await;
	assert!(review.path().ends_with("mod/quiz/review.php"));
}

#[tokio::test]
async fn finish_bounced_to_summary_is_rejected() {
	let mut server = Server::new_async().await;
	let dir = tempfile::tempdir().unwrap();
	server
		.mock("POST", "/mod/quiz/processattempt.php")
		.with_status(303)
		.with_header("location", "/mod/quiz/summary.php?attempt=1234&cmid=5")
		.create_async()
		.await;

	let client = MoodleClient::new(config(&server, dir.path())).unwrap();
	let err = client.finish("1234", "abcDEF123", "5").await.unwrap_err();
	assert!(err.is_rejection());
}

#[tokio::test]
async fn start_attempt_returns_attempt_page() {
	let mut server = Server::new_async().await;
	let dir = tempfile::tempdir().unwrap();
	server
		.mock("POST", "/mod/quiz/startattempt.php")
		.match_body(Matcher::AllOf(vec![Matcher::UrlEncoded("cmid".into(), "5".into()), Matcher::UrlEncoded("sesskey".into(), "k3y".into())]))
		.with_status(303)
		.with_header("location", "/mod/quiz/attempt.php?attempt=77&cmid=5")
		.create_async()
		.await;

	let client = MoodleClient::new(config(&server, dir.path())).unwrap();
	let url = client.start_attempt("5", "k3y").await.unwrap();
	assert!(uni_moodle::is_attempt_url(url.as_str()));
	assert_eq!(url.query(), Some("attempt=77&cmid=5"));
}

#[tokio::test]
async fn resource_resolution() {
	let mut server = Server::new_async().await;
	let dir = tempfile::tempdir().unwrap();
	let file_url = format!("{}/pluginfile.php/9/mod_resource/content/1/slides.pdf", server.url());
	server.mock("GET", "/mod/resource/view.php?id=3").with_status(303).with_header("location", &file_url).create_async().await;
	server
		.mock("GET", "/mod/resource/view.php?id=4")
		.with_status(200)
		.with_body(r#"<div class="resourceworkaround">Click <a href="/pluginfile.php/9/b.zip">b.zip</a></div>"#)
		.create_async()
		.await;
	server.mock("GET", "/mod/resource/view.php?id=5").with_status(404).create_async().await;

	let client = MoodleClient::new(config(&server, dir.path())).unwrap();
	assert_eq!(client.get_resource_download_url(3).await.unwrap(), Some(file_url));
	assert_eq!(client.get_resource_download_url(4).await.unwrap().as_deref(), Some("/pluginfile.php/9/b.zip"));
	assert!(matches!(client.get_resource_download_url(5).await, Err(MoodleError::Status { status: 404, .. })));
}

#[tokio::test]
async fn download_names_file_from_header() {
	let mut server = Server::new_async().await;
	let dir = tempfile::tempdir().unwrap();
	server
		.mock("GET", "/pluginfile.php/9/mod_resource/content/1/x")
		.with_status(200)
		.with_header("content-disposition", "attachment; filename*=UTF-8''week%201.pdf")
		.with_body(b"%PDF-1.4 fake")
		.create_async()
		.await;

	let client = MoodleClient::new(config(&server, dir.path())).unwrap();
	let saved = client.download_file("pluginfile.php/9/mod_resource/content/1/x", dir.path()).await.unwrap();
	assert_eq!(saved, dir.path().join("week 1.pdf"));
	assert_eq!(std::fs::read(&saved).unwrap(), b"%PDF-1.4 fake");
}

#[tokio::test]
async fn session_cookie_stays_on_the_site() {
	let mut server = Server::new_async().await;
	let mut other = Server::new_async().await;
	let dir = tempfile::tempdir().unwrap();
	let own = server
		.mock("GET", "/pluginfile.php/1/a.txt")
		.match_header("cookie", Matcher::Regex("MoodleSession=s3cr3t".into()))
		.with_status(200)
		.with_body("own")
		.create_async()
		.await;
	let foreign = other
		.mock("GET", "/file.pdf")
		.match_header("cookie", Matcher::Missing)
		.with_status(200)
		.with_body("foreign")
		.create_async()
		.await;

	let client = MoodleClient::new(config(&server, dir.path())).unwrap();
	client.session().cookies().insert("MoodleSession", "s3cr3t");

	client.download_file("pluginfile.php/1/a.txt", &dir.path().join("a.txt")).await.unwrap();
	own.assert_async().await;

	let foreign_url = format!("http://localhost:{}/file.pdf", other.socket_address().port());
	let saved = client.download_file(&foreign_url, &dir.path().join("file.pdf")).await.unwrap();
	foreign.assert_async().await;
	assert_eq!(std::fs::read_to_string(saved).unwrap(), "foreign");
}

#[tokio::test]
async fn interrupted_download_leaves_no_file() {
	let mut server = Server::new_async().await;
	let dir = tempfile::tempdir().unwrap();
	server
		.mock("GET", "/pluginfile.php/9/big.zip")
		.with_status(200)
		.with_chunked_body(|w| {
			w.write_all(b"PK partial")?;
			Err(std::io::Error::other("connection dropped"))
		})
		.create_async()
		.await;

	let client = MoodleClient::new(config(&server, dir.path())).unwrap();
	let target = dir.path().join("big.zip");
	assert!(client.download_file("pluginfile.php/9/big.zip", &target).await.is_err());
	assert!(!target.exists());
}
