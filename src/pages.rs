//! Parsers for the ordinary (non-attempt) Moodle pages.
//!
//! All of them are best-effort: a missing element yields an empty/`None` value rather
//! than an error, since theme changes routinely move things around.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html};
use serde::Serialize;

use crate::html::{attr, has_class, query_param, sel, text_lines, text_of, visible_text};

static CSS_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"url\(['"]?(.*?)['"]?\)"#).expect("static regex"));
static COURSE_COUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\((\d+)\)").expect("static regex"));

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Course {
	pub id: u64,
	pub name: String,
	pub url: String,
	pub image_url: Option<String>,
	pub teachers: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Category {
	pub id: Option<u64>,
	pub name: String,
	pub url: String,
	pub course_count: u32,
	pub has_children: bool,
}

/// One activity or resource on a course page
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Module {
	/// Course-module id (`cmid`)
	pub id: Option<u64>,
	/// `resource`, `quiz`, `assign`, `forum`, ...
	pub kind: String,
	pub name: String,
	pub url: Option<String>,
	pub description: Option<String>,
	pub completed: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Section {
	pub id: Option<String>,
	pub name: String,
	pub summary: String,
	pub modules: Vec<Module>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FileItem {
	pub filename: String,
	pub url: String,
	pub mimetype: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct FolderDetails {
	pub title: String,
	pub files: Vec<FileItem>,
	pub download_all_url: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct AssignmentDetails {
	pub title: String,
	pub intro: String,
	pub attachments: Vec<FileItem>,
	pub submission_status: String,
	pub grading_status: String,
	pub due_date: String,
	pub time_remaining: String,
	pub last_modified: String,
	pub submission_files: Vec<FileItem>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ForumDetails {
	pub title: String,
	pub intro: String,
	pub has_discussions: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PageDetails {
	pub title: String,
	/// Inner HTML of the page body
	pub content: String,
	pub last_modified: String,
}

/// A row of the "summary of your previous attempts" table
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct QuizAttempt {
	pub attempt_number: u32,
	pub state: String,
	pub grade: Option<String>,
	pub review_url: Option<String>,
	pub feedback: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct QuizDetails {
	pub title: String,
	pub intro: String,
	pub attempts: Vec<QuizAttempt>,
	pub feedback: Option<String>,
	/// Whether the page offers an attempt start/continue form
	pub can_attempt: bool,
	pub cmid: Option<String>,
	pub sesskey: Option<String>,
}

/// Dashboard / "my courses" listing
pub fn parse_my_courses(html: &str) -> Vec<Course> {
	let document = Html::parse_document(html);
	let mut cards: Vec<ElementRef> = document.select(&sel(".coursebox")).collect();
	if cards.is_empty() {
		cards = document.select(&sel(r#"div[data-region="course-content"]"#)).collect();
	}
	if cards.is_empty() {
		return courses_from_nav(&document);
	}

	cards
		.into_iter()
		.filter_map(|card| {
			let (url, name) = match card.select(&sel(".coursename a")).next() {
				Some(link) => (attr(link, "href")?, text_of(link)),
				None => (card.select(&sel("a[href]")).next().and_then(|a| attr(a, "href"))?, text_of(card)),
			};
			let id = match card.value().attr("data-courseid") {
				Some(raw) => raw.trim().parse().ok()?,
				None => query_param(&url, "id")?.parse().ok()?,
			};
			Some(Course {
				id,
				name,
				url,
				image_url: course_image(card),
				teachers: card.select(&sel(".teachers li a")).map(text_of).collect(),
			})
		})
		.collect()
}

/// Fallback for themes that only list courses in the navigation drawer
fn courses_from_nav(document: &Html) -> Vec<Course> {
	let mut courses: Vec<Course> = Vec::new();
	for link in document.select(&sel(r#"nav .list-group-item[href*="course/view.php"]"#)) {
		let Some(url) = attr(link, "href") else { continue };
		let Some(id) = query_param(&url, "id").and_then(|id| id.parse().ok()) else { continue };
		if courses.iter().any(|c| c.id == id) {
			continue;
		}
		courses.push(Course {
			id,
			name: text_of(link),
			url,
			image_url: None,
			teachers: Vec::new(),
		});
	}
	courses
}

fn course_image(card: ElementRef<'_>) -> Option<String> {
	let holder = card.select(&sel(".card-img-top")).next().or_else(|| card.select(&sel(".course-image")).next())?;
	match holder.value().attr("style").filter(|s| s.contains("url(")) {
		Some(style) => CSS_URL.captures(style).map(|c| c[1].to_string()),
		None => holder.select(&sel("img")).next().and_then(|img| attr(img, "src")),
	}
}

/// Sections and activities of `course/view.php`
pub fn parse_course_contents(html: &str) -> Vec<Section> {
	let document = Html::parse_document(html);
	let sections = ["ul.topics li.section.main", ".course-content ul.weeks li.section.main"]
		.iter()
		.map(|css| document.select(&sel(css)).collect::<Vec<_>>())
		.find(|found| !found.is_empty())
		.unwrap_or_default();

	sections
		.into_iter()
		.map(|section| {
			let id = attr(section, "data-sectionid");
			let name = match section.select(&sel(".sectionname")).next() {
				Some(el) => text_of(el),
				None => format!("Section {}", id.as_deref().unwrap_or("?")),
			};
			Section {
				summary: section.select(&sel(".summary")).next().map(text_of).unwrap_or_default(),
				modules: section.select(&sel("ul.section li.activity")).map(parse_module).collect(),
				id,
				name,
			}
		})
		.collect()
}

fn parse_module(item: ElementRef<'_>) -> Module {
	let element = item.value();
	let id = element.id().and_then(|id| id.strip_prefix("module-")).and_then(|n| n.parse().ok());
	let kind = element.classes().find_map(|c| c.strip_prefix("modtype_")).unwrap_or("unknown").to_string();
	let name = item.select(&sel(".instancename")).next().map(visible_text).unwrap_or_else(|| "Untitled".to_string());
	let url = item.select(&sel(".activityinstance a")).next().and_then(|a| attr(a, "href"));
	let description = item.select(&sel(".contentafterlink")).next().map(text_lines);
	let completed = item
		.select(&sel(".autocompletion img"))
		.next()
		.and_then(|img| attr(img, "title").or_else(|| attr(img, "alt")))
		.is_some_and(|title| is_completed_title(&title));
	Module {
		id,
		kind,
		name,
		url,
		description,
		completed,
	}
}

/// Completion icon titles read `完了: <name>` / `Completed: <name>`, or their "not" forms
fn is_completed_title(title: &str) -> bool {
	(title.contains("完了: ") && !title.contains("未完了")) || title.starts_with("Completed:")
}

/// Category listing. With `is_subcategory` only the `.subcategories` container is read when there is one.
pub fn parse_categories(html: &str, is_subcategory: bool) -> Vec<Category> {
	let document = Html::parse_document(html);
	let container = if is_subcategory { document.select(&sel(".subcategories")).next() } else { None };
	let items: Vec<ElementRef> = match container {
		Some(container) => container.select(&sel(".category")).collect(),
		None => document.select(&sel(".category")).collect(),
	};

	items
		.into_iter()
		.filter_map(|item| {
			let link = item.select(&sel(".categoryname a")).next()?;
			let course_count = item
				.select(&sel(".numberofcourse"))
				.next()
				.and_then(|el| COURSE_COUNT.captures(&text_of(el)).and_then(|c| c[1].parse().ok()))
				.unwrap_or(0);
			Some(Category {
				id: item.value().attr("data-categoryid").and_then(|id| id.trim().parse().ok()),
				name: text_of(link),
				url: attr(link, "href").unwrap_or_default(),
				course_count,
				has_children: has_class(item.value(), "with_children"),
			})
		})
		.collect()
}

/// File URL of a `mod/resource` page that did not redirect straight to the file
pub fn parse_resource_url(html: &str) -> Option<String> {
	let document = Html::parse_document(html);
	let first = |css: &str, name: &str| document.select(&sel(css)).find_map(|el| attr(el, name));
	first(".resourcecontent a[href]", "href")
		.or_else(|| first("iframe.resourceembed", "src"))
		.or_else(|| first("object.resourceembed", "data"))
		.or_else(|| first(".resourceworkaround a", "href"))
}

/// Target of a `mod/url` page shown in "click to open" mode
pub fn parse_external_url(html: &str) -> Option<String> {
	let document = Html::parse_document(html);
	document.select(&sel(".urlworkaround a")).find_map(|a| attr(a, "href"))
}

fn parse_file_tree(container: ElementRef<'_>) -> Vec<FileItem> {
	container
		.select(&sel(".fp-filename-icon a"))
		.map(|link| {
			let filename = link.select(&sel(".fp-filename")).next().map(text_of).unwrap_or_else(|| text_of(link));
			let mimetype = link.select(&sel("img.icon")).next().and_then(|img| img.value().attr("src")).and_then(mimetype_from_icon);
			FileItem {
				filename,
				url: attr(link, "href").unwrap_or_default(),
				mimetype: mimetype.map(str::to_owned),
			}
		})
		.collect()
}

fn mimetype_from_icon(src: &str) -> Option<&'static str> {
	if src.contains("/pdf") {
		Some("application/pdf")
	} else if src.contains("/document") {
		Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
	} else if src.contains("/archive") {
		Some("application/zip")
	} else {
		None
	}
}

fn main_heading(document: &Html) -> String {
	document.select(&sel(r#"div[role="main"] h2"#)).next().map(text_of).unwrap_or_default()
}

fn intro(document: &Html) -> Option<ElementRef<'_>> {
	document.select(&sel("#intro")).next()
}

pub fn parse_folder(html: &str) -> FolderDetails {
	let document = Html::parse_document(html);
	let title = document.select(&sel("h2")).next().map(text_of).unwrap_or_default();
	let files = document.select(&sel(".foldertree")).next().map(parse_file_tree).unwrap_or_default();
	let download_all_url = document.select(&sel(r#"form[action*="download_folder.php"]"#)).next().and_then(|form| {
		let action = attr(form, "action")?;
		let id = form.select(&sel(r#"input[name="id"]"#)).next().and_then(|i| attr(i, "value"))?;
		Some(format!("{action}?id={id}"))
	});
	FolderDetails { title, files, download_all_url }
}

pub fn parse_assignment(html: &str) -> AssignmentDetails {
	let document = Html::parse_document(html);
	let intro_el = intro(&document);
	let mut details = AssignmentDetails {
		title: main_heading(&document),
		intro: intro_el.map(text_lines).unwrap_or_default(),
		attachments: intro_el.map(intro_attachments).unwrap_or_default(),
		..Default::default()
	};

	let Some(table) = document.select(&sel(".submissionstatustable table.generaltable")).next() else {
		return details;
	};
	for row in table.select(&sel("tr")) {
		let (Some(th), Some(td)) = (row.select(&sel("th")).next(), row.select(&sel("td")).next()) else {
			continue;
		};
		let header = text_of(th);
		let value = text_of(td);
		let has = |labels: &[&str]| labels.iter().any(|l| header.contains(l));
		if has(&["提出ステータス", "Submission status"]) {
			details.submission_status = value;
		} else if has(&["評定ステータス", "Grading status"]) {
			details.grading_status = value;
		} else if has(&["終了日時", "Due date"]) {
			details.due_date = value;
		} else if has(&["残り時間", "Time remaining"]) {
			details.time_remaining = value;
		} else if has(&["最終更新日時", "Last modified"]) {
			details.last_modified = value;
		} else if has(&["ファイル提出", "File submissions"]) {
			details.submission_files = parse_file_tree(td);
		}
	}
	details
}

/// Intro attachments live in the `assign_files_tree*` sibling following `#intro`
fn intro_attachments(intro: ElementRef<'_>) -> Vec<FileItem> {
	intro
		.next_siblings()
		.filter_map(ElementRef::wrap)
		.find(|el| el.value().name() == "div" && el.value().id().is_some_and(|id| id.starts_with("assign_files_tree")))
		.map(parse_file_tree)
		.unwrap_or_default()
}

pub fn parse_forum(html: &str) -> ForumDetails {
	let document = Html::parse_document(html);
	ForumDetails {
		title: main_heading(&document),
		intro: intro(&document).map(text_lines).unwrap_or_default(),
		has_discussions: document.select(&sel(".forumnodiscuss")).next().is_none(),
	}
}

pub fn parse_page(html: &str) -> PageDetails {
	let document = Html::parse_document(html);
	let last_modified = document
		.select(&sel(".modified"))
		.next()
		.map(|el| {
			let text = text_of(el);
			["最終更新日時:", "Last modified:"]
				.iter()
				.fold(text, |t, label| t.replace(label, ""))
				.trim()
				.to_string()
		})
		.unwrap_or_default();
	PageDetails {
		title: main_heading(&document),
		content: document.select(&sel(".generalbox")).next().map(|el| el.inner_html()).unwrap_or_default(),
		last_modified,
	}
}

/// `mod/quiz/view.php`: intro, previous attempts and the start-attempt form
pub fn parse_quiz(html: &str) -> QuizDetails {
	let document = Html::parse_document(html);
	let intro_el = intro(&document).or_else(|| document.select(&sel(".quizinfo")).next());

	let mut details = QuizDetails {
		title: main_heading(&document),
		intro: intro_el.map(text_lines).unwrap_or_default(),
		attempts: document.select(&sel(".quizattemptsummary")).next().map(parse_attempt_summary).unwrap_or_default(),
		feedback: document.select(&sel("#feedback")).next().map(text_lines),
		..Default::default()
	};

	if let Some(form) = document.select(&sel(r#"form[action*="startattempt.php"]"#)).next() {
		let hidden = |name: &str| form.select(&sel("input")).find(|i| i.value().attr("name") == Some(name)).and_then(|i| attr(i, "value"));
		details.can_attempt = true;
		details.cmid = hidden("cmid");
		details.sesskey = hidden("sesskey");
	}
	details
}

fn parse_attempt_summary(table: ElementRef<'_>) -> Vec<QuizAttempt> {
	let headers: Vec<String> = table.select(&sel("thead th")).map(text_of).collect();
	// several grade-like columns (marks, grade) may exist; the last one wins
	let grade_idx = headers.iter().rposition(|h| ["評点", "素点", "Grade", "Marks"].iter().any(|l| h.contains(l)));
	let review_idx = headers.iter().position(|h| h.contains("レビュー") || h.contains("Review"));
	let feedback_idx = headers.iter().position(|h| h.contains("フィードバック") || h.contains("Feedback"));

	table
		.select(&sel("tbody tr"))
		.filter_map(|row| {
			let cells: Vec<ElementRef> = row.select(&sel("td")).collect();
			let attempt_number = text_of(*cells.first()?).parse().ok()?;
			let cell = |idx: Option<usize>| idx.and_then(|i| cells.get(i).copied());

			let review_url = cell(review_idx)
				.and_then(|c| c.select(&sel("a[href]")).next())
				.and_then(|a| attr(a, "href"))
				.or_else(|| row.select(&sel("a[href]")).find_map(|a| attr(a, "href")).filter(|href| href.contains("review.php")));

			Some(QuizAttempt {
				attempt_number,
				state: cells.get(1).map(|c| c.text().map(str::trim).filter(|s| !s.is_empty()).collect::<Vec<_>>().join(" ")).unwrap_or_default(),
				grade: cell(grade_idx).map(text_of),
				review_url,
				feedback: cell(feedback_idx).map(text_of),
			})
		})
		.collect()
}
