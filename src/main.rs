use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::{
	Result,
	eyre::{WrapErr as _, bail, eyre},
};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _};
use tracing_subscriber::EnvFilter;
use uni_moodle::{Answers, AttemptContext, ClientConfig, LoginOutcome, MoodleClient, QuizLabels};

#[derive(Debug, Parser)]
#[command(name = "uni_moodle")]
#[command(about = "Moodle from the command line: courses, files and quiz attempts", long_about = None)]
struct Cli {
	#[command(flatten)]
	global: GlobalArgs,

	#[command(subcommand)]
	command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
	/// TOML config file (see `ClientConfig`)
	#[arg(short, long, global = true)]
	config: Option<PathBuf>,

	/// Moodle root URL, overrides the config file
	#[arg(long, global = true, env = "MOODLE_BASE_URL")]
	base_url: Option<String>,

	/// Where cookies are kept between runs
	#[arg(long, global = true)]
	session_file: Option<PathBuf>,

	#[arg(short, long, global = true, env = "MOODLE_USERNAME")]
	username: Option<String>,

	#[arg(short, long, global = true, env = "MOODLE_PASSWORD", hide_env_values = true)]
	password: Option<String>,

	/// Language pack of the site; selects the quiz button labels
	#[arg(long, global = true, value_enum)]
	locale: Option<Locale>,

	/// Exact text of the site's "Finish attempt" button, when neither locale matches
	#[arg(long, global = true)]
	finish_label: Option<String>,

	/// Print results as JSON
	#[arg(long, global = true)]
	json: bool,

	/// Save every fetched attempt page under the state dir
	#[cfg(feature = "xdg")]
	#[arg(long, global = true)]
	persist_html: bool,

	/// Debug logging (RUST_LOG takes precedence)
	#[arg(short, long, global = true)]
	verbose: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Locale {
	En,
	Ja,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Log in with username/password and store the session
	Login,
	/// List enrolled courses
	Courses,
	/// List course categories
	Categories {
		#[arg(long)]
		parent: Option<u64>,
	},
	/// Sections and activities of a course
	Contents { course_id: u64 },
	/// Resolve a file resource to its download URL
	Resource { id: u64 },
	/// Resolve a URL module to its target
	Url { id: u64 },
	Folder { id: u64 },
	Assign { id: u64 },
	Forum { id: u64 },
	Page { id: u64 },
	/// Quiz overview: previous attempts and whether a new one can be started
	Quiz { id: u64 },
	/// Start (or continue) an attempt of a quiz and print its first page
	Start { cmid: String },
	/// Print the questions of an attempt page
	Attempt { url: String },
	/// Submit answers for an attempt page
	Answer {
		url: String,
		/// Answer as FIELD_NAME=VALUE, repeatable
		#[arg(short = 's', long = "set", value_parser = parse_answer)]
		answers: Vec<(String, String)>,
		/// Submit with the "finish attempt" control instead of moving to the next page
		#[arg(long)]
		finish: bool,
		/// After finishing, also close the attempt for this course-module id
		#[arg(long, requires = "finish")]
		close: Option<String>,
		/// Do not ask before closing
		#[arg(short, long)]
		yes: bool,
	},
	/// Close an attempt from its summary page
	Finish {
		#[arg(long)]
		attempt: String,
		#[arg(long)]
		sesskey: String,
		#[arg(long)]
		cmid: String,
		#[arg(short, long)]
		yes: bool,
	},
	/// Download a file; PATH may be a directory
	Download { url: String, path: PathBuf },
}

fn parse_answer(s: &str) -> Result<(String, String), String> {
	s.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())).ok_or_else(|| format!("expected FIELD_NAME=VALUE, got {s:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;
	let cli = Cli::parse();

	let default_filter = if cli.global.verbose { "uni_moodle=debug" } else { "uni_moodle=info" };
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
		.with_writer(std::io::stderr)
		.init();

	let config = build_config(&cli.global)?;
	let client = MoodleClient::new(config)?;
	let global = &cli.global;

	if !matches!(cli.command, Command::Login) {
		ensure_session(&client).await?;
	}

	match cli.command {
		Command::Login => {
			log_in(&client).await?;
			output(global, &true, || println!("logged in"))
		}
		Command::Courses => {
			let courses = client.get_my_courses().await?;
			output(global, &courses, || {
				for c in &courses {
					println!("{:>8}  {}", c.id, c.name);
				}
			})
		}
		Command::Categories { parent } => {
			let categories = client.get_course_categories(parent).await?;
			output(global, &categories, || {
				for c in &categories {
					let id = c.id.map(|id| id.to_string()).unwrap_or_default();
					println!("{id:>8}  {} ({} courses){}", c.name, c.course_count, if c.has_children { " +" } else { "" });
				}
			})
		}
		Command::Contents { course_id } => {
			let sections = client.get_course_contents(course_id).await?;
			output(global, &sections, || {
				for section in &sections {
					println!("## {}", section.name);
					for m in &section.modules {
						let id = m.id.map(|id| id.to_string()).unwrap_or_default();
						println!("  [{}] {id:>8}  {:<10} {}", if m.completed { "x" } else { " " }, m.kind, m.name);
					}
				}
			})
		}
		Command::Resource { id } => {
			let url = client.get_resource_download_url(id).await?.ok_or_else(|| eyre!("no file link found for resource {id}"))?;
			output(global, &url, || println!("{url}"))
		}
		Command::Url { id } => {
			let url = client.get_external_url(id).await?.ok_or_else(|| eyre!("no target found for url module {id}"))?;
			output(global, &url, || println!("{url}"))
		}
		Command::Folder { id } => {
			let folder = client.get_folder_details(id).await?;
			output(global, &folder, || {
				println!("{}", folder.title);
				for f in &folder.files {
					println!("  {}  {}", f.filename, f.url);
				}
				if let Some(all) = &folder.download_all_url {
					println!("all: {all}");
				}
			})
		}
		Command::Assign { id } => {
			let a = client.get_assignment_details(id).await?;
			output(global, &a, || {
				println!("{}\n\n{}\n", a.title, a.intro);
				for (label, value) in [("submission", &a.submission_status), ("grading", &a.grading_status), ("due", &a.due_date), ("remaining", &a.time_remaining)] {
					if !value.is_empty() {
						println!("{label:>10}: {value}");
					}
				}
				for f in a.attachments.iter().chain(&a.submission_files) {
					println!("  {}  {}", f.filename, f.url);
				}
			})
		}
		Command::Forum { id } => {
			let forum = client.get_forum_details(id).await?;
			output(global, &forum, || println!("{}\n\n{}\n\ndiscussions: {}", forum.title, forum.intro, forum.has_discussions))
		}
		Command::Page { id } => {
			let page = client.get_page_details(id).await?;
			output(global, &page, || println!("{}\n\n{}", page.title, page.content))
		}
		Command::Quiz { id } => {
			let quiz = client.get_quiz_details(id).await?;
			output(global, &quiz, || {
				println!("{}\n\n{}\n", quiz.title, quiz.intro);
				for a in &quiz.attempts {
					println!("  #{} {} {}", a.attempt_number, a.state, a.grade.as_deref().unwrap_or("-"));
				}
				if let (true, Some(cmid)) = (quiz.can_attempt, &quiz.cmid) {
					println!("\nstart with: uni_moodle start {cmid}");
				}
			})
		}
		Command::Start { cmid } => {
			let (_, view) = client.get_html(&format!("mod/quiz/view.php?id={cmid}")).await?;
			let sesskey = uni_moodle::pages::parse_quiz(&view).sesskey.ok_or_else(|| eyre!("quiz {cmid} offers no attempt to start"))?;
			let attempt_url = client.start_attempt(&cmid, &sesskey).await?;
			tracing::info!("attempt page: {attempt_url}");
			show_attempt(&client, global, attempt_url.as_str()).await
		}
		Command::Attempt { url } => show_attempt(&client, global, &url).await,
		Command::Answer {
			url,
			answers,
			finish,
			close,
			yes,
		} => {
			let context = fetch_attempt(&client, global, &url).await?;
			let answers: Answers = answers.into_iter().collect();
			for name in answers.keys() {
				if context.field(name).is_none() {
					tracing::warn!("`{name}` is not a field of this page; sending it anyway");
				}
			}

			let submitted = client.submit(&context, &answers, finish).await?;
			for warning in &submitted.warnings {
				eprintln!("warning: {warning}");
			}
			println!("{}", submitted.redirect_url);

			if let Some(cmid) = close {
				if !yes && !confirm("Close the attempt? No further changes will be possible.").await? {
					return Ok(());
				}
				let review = client.finish(&context.attempt_id, &context.session_key, &cmid).await?;
				println!("{review}");
			}
			Ok(())
		}
		Command::Finish { attempt, sesskey, cmid, yes } => {
			if !yes && !confirm(&format!("Close attempt {attempt}? No further changes will be possible.")).await? {
				return Ok(());
			}
			let review = client.finish(&attempt, &sesskey, &cmid).await?;
			println!("{review}");
			Ok(())
		}
		Command::Download { url, path } => {
			let saved = client.download_file(&url, &path).await?;
			println!("{}", saved.display());
			Ok(())
		}
	}
}

fn build_config(args: &GlobalArgs) -> Result<ClientConfig> {
	let mut config = match &args.config {
		Some(path) => ClientConfig::load(path).wrap_err_with(|| format!("Failed to read config {}", path.display()))?,
		None => {
			let Some(base_url) = &args.base_url else {
				bail!("no Moodle URL: pass --base-url or --config");
			};
			ClientConfig::new(base_url)
		}
	};

	#[cfg(feature = "xdg")]
	if args.config.is_none()
		&& let Some(dir) = state_dir()
	{
		config.session_file = dir.join("session.json");
	}

	if let Some(base_url) = &args.base_url {
		config.base_url = base_url.clone();
	}
	if let Some(session_file) = &args.session_file {
		config.session_file = session_file.clone();
	}
	if args.username.is_some() {
		config.username = args.username.clone();
	}
	if args.password.is_some() {
		config.password = args.password.clone();
	}
	match args.locale {
		Some(Locale::Ja) => config.labels = QuizLabels::japanese(),
		Some(Locale::En) => config.labels = QuizLabels::default(),
		None => {}
	}
	if let Some(label) = &args.finish_label {
		config.labels.finish_label = label.clone();
	}
	Ok(config)
}

async fn log_in(client: &MoodleClient) -> Result<()> {
	let config = client.session().config();
	let (Some(username), Some(password)) = (&config.username, &config.password) else {
		bail!("login needs --username and --password (or MOODLE_USERNAME / MOODLE_PASSWORD)");
	};
	match client.login(username, password).await? {
		LoginOutcome::LoggedIn => {
			tracing::info!("session saved to {}", config.session_file.display());
			Ok(())
		}
		LoginOutcome::InvalidCredentials => bail!("invalid username or password"),
		LoginOutcome::StillOnLoginPage => bail!("login did not go through (does the site use single sign-on?)"),
	}
}

/// Reuse the stored session; log in again only when it has expired and credentials are available
async fn ensure_session(client: &MoodleClient) -> Result<()> {
	if client.load_session()? && client.is_logged_in().await {
		return Ok(());
	}
	let config = client.session().config();
	if config.username.is_some() && config.password.is_some() {
		tracing::info!("no valid session, logging in");
		return log_in(client).await;
	}
	tracing::warn!("not logged in and no credentials given; continuing anonymously");
	Ok(())
}

async fn fetch_attempt(client: &MoodleClient, args: &GlobalArgs, url: &str) -> Result<AttemptContext> {
	let (context, html) = client.fetch_attempt(url).await?;
	#[cfg(feature = "xdg")]
	if args.persist_html
		&& let Err(e) = save_page_html(&html, url)
	{
		tracing::error!("Failed to save attempt page HTML: {e}");
	}
	#[cfg(not(feature = "xdg"))]
	let _ = (args, html);
	Ok(context)
}

async fn show_attempt(client: &MoodleClient, args: &GlobalArgs, url: &str) -> Result<()> {
	let context = fetch_attempt(client, args, url).await?;
	output(args, &context, || {
		println!("attempt {} (page {}, sesskey {})\n", context.attempt_id, context.this_page, context.session_key);
		for question in &context.questions {
			println!("Q{} [{}]", question.number, question.qtype);
			println!("{question}");
		}
		for anomaly in &context.anomalies {
			eprintln!("note: {anomaly}");
		}
	})
}

fn output<T: Serialize + ?Sized>(args: &GlobalArgs, value: &T, human: impl FnOnce()) -> Result<()> {
	if args.json {
		println!("{}", serde_json::to_string_pretty(value)?);
	} else {
		human();
	}
	Ok(())
}

async fn confirm(prompt: &str) -> Result<bool> {
	let mut stdout = tokio::io::stdout();
	stdout.write_all(format!("{prompt} [y/N] ").as_bytes()).await?;
	stdout.flush().await?;
	let mut line = String::new();
	tokio::io::BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
	Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

#[cfg(feature = "xdg")]
fn state_dir() -> Option<PathBuf> {
	dirs::state_dir().or_else(dirs::data_local_dir).map(|d| d.join("uni_moodle"))
}

/// Save a fetched page's HTML for debugging, labelled by its URL
#[cfg(feature = "xdg")]
fn save_page_html(html: &str, url: &str) -> Result<PathBuf> {
	let html_dir = state_dir().ok_or_else(|| eyre!("no state directory on this platform"))?.join("persist_htmls");
	std::fs::create_dir_all(&html_dir).map_err(|e| eyre!("Failed to create HTML dir: {}", e))?;

	let label = url.replace("https://", "").replace("http://", "");
	let safe_label: String = label.chars().map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' }).collect();
	let filename = format!("{}_{}.html", chrono::Local::now().format("%Y%m%d-%H%M%S"), safe_label);
	let filepath = html_dir.join(&filename);

	std::fs::write(&filepath, html).map_err(|e| eyre!("Failed to write HTML file: {}", e))?;
	tracing::info!("Saved page HTML to: {}", filepath.display());
	Ok(filepath)
}
