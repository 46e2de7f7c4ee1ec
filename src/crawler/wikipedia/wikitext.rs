//! Heuristic wikitext helpers for the game infobox. Not a wikitext parser:
//! just enough to pull a publisher list and a release date.

use chrono::{Datelike, NaiveDate, Utc};
use regex::Regex;
use std::sync::LazyLock;

static TEMPLATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{[^{}]*\}\}").expect("static regex"));
static REF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<ref[^>/]*>.*?</ref>").expect("static regex"));
static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("static regex"));
static BR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<br\s*/?\s*>").expect("static regex"));
static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[(?:[^\]|]*\|)?([^\]]+)\]\]").expect("static regex"));
static NBSP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)&nbsp;").expect("static regex"));
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("static regex"));
static EDGE_PIPES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\s|]*\|\s*|\s*\|[\s|]*$").expect("static regex"));
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

static START_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\{\{\s*start\s+date[^}]*\}\}").expect("static regex"));
static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?:19|20)\d{2}").expect("static regex"));
static MONTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\b")
        .expect("static regex")
});
static DAY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b([0-3]?\d)\b").expect("static regex"));
static PUBLISHER_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[,;|]").expect("static regex"));
static LEADING_AND_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^and\s+").expect("static regex"));
static FIELD_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[A-Za-z_][A-Za-z0-9_ ]*=").expect("static regex"));

const MONTHS: [&str; 12] = [
    "january", "february", "march", "april", "may", "june", "july", "august", "september", "october",
    "november", "december",
];

const RELEASE_FIELDS: [&str; 3] = ["release_date", "released", "publication_date"];
const PUBLISHER_FIELDS: [&str; 2] = ["publisher", "publishers"];

/// Drop templates (innermost first, until none are left), refs, comments and
/// tags; keep link labels; collapse whitespace.
pub fn strip_wiki_markup(value: &str) -> String {
    let mut result = value.to_string();
    loop {
        let next = TEMPLATE_RE.replace_all(&result, " ").into_owned();
        if next == result {
            break;
        }
        result = next;
    }
    let result = REF_RE.replace_all(&result, " ");
    let result = COMMENT_RE.replace_all(&result, " ");
    let result = BR_RE.replace_all(&result, "|");
    let result = LINK_RE.replace_all(&result, "$1");
    let result = NBSP_RE.replace_all(&result, " ");
    let result = TAG_RE.replace_all(&result, " ");
    // unbalanced leftovers
    let result = result.replace("{{", " ").replace("}}", " ");
    let result = EDGE_PIPES_RE.replace_all(&result, "");
    WS_RE.replace_all(&result, " ").trim().to_string()
}

pub fn parse_publisher_names(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else { return Vec::new() };
    let sanitized = strip_wiki_markup(raw);
    PUBLISHER_SPLIT_RE
        .split(&sanitized)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| LEADING_AND_RE.replace(p, "").trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

pub fn parse_release_date(raw: Option<&str>) -> Option<NaiveDate> {
    parse_release_date_at(raw, Utc::now().year())
}

/// `{{start date|Y|M|D}}` wins when it yields a valid in-range date;
/// otherwise the first plausible year in the stripped text, refined by a
/// month name and day when present. A template with an in-range year but an
/// impossible month or day still gives Jan 1 of that year when the text has
/// nothing better. Years outside `[1900, current_year + 1]` give `None`.
pub fn parse_release_date_at(raw: Option<&str>, current_year: i32) -> Option<NaiveDate> {
    let raw = raw?;
    let in_range = |year: i32| (1900..=current_year + 1).contains(&year);

    let mut template_year = None;
    if let Some(m) = START_DATE_RE.find(raw) {
        let inner = &m.as_str()[2..m.as_str().len() - 2];
        let nums: Vec<i32> = inner
            .split('|')
            .map(str::trim)
            .filter_map(|p| p.parse().ok())
            .collect();
        if let Some(&year) = nums.first().filter(|y| in_range(**y)) {
            let month = nums.get(1).copied().unwrap_or(1);
            let day = nums.get(2).copied().unwrap_or(1);
            if month > 0 && day > 0 {
                if let Some(date) = NaiveDate::from_ymd_opt(year, month as u32, day as u32) {
                    return Some(date);
                }
            }
            template_year = Some(year);
        }
    }

    date_from_text(&strip_wiki_markup(raw), in_range)
        .or_else(|| template_year.and_then(|year| NaiveDate::from_ymd_opt(year, 1, 1)))
}

fn date_from_text(sanitized: &str, in_range: impl Fn(i32) -> bool) -> Option<NaiveDate> {
    let year: i32 = YEAR_RE.find(sanitized)?.as_str().parse().ok()?;
    if !in_range(year) {
        return None;
    }
    if let Some(month) = MONTH_RE.captures(sanitized).and_then(|c| {
        let name = c.get(1)?.as_str().to_lowercase();
        MONTHS.iter().position(|m| *m == name)
    }) {
        let day = DAY_RE
            .captures(sanitized)
            .and_then(|c| c.get(1)?.as_str().parse::<u32>().ok())
            .filter(|d| *d > 0)
            .unwrap_or(1);
        if let Some(date) = NaiveDate::from_ymd_opt(year, month as u32 + 1, day) {
            return Some(date);
        }
    }
    NaiveDate::from_ymd_opt(year, 1, 1)
}

/// Value of `| field = value`, ending at the line break or at the next
/// top-level `|name =` when several fields share a line.
pub fn infobox_field(wikitext: &str, field: &str) -> Option<String> {
    let pattern = format!(r"\|\s*{}\s*=", regex::escape(field));
    let re = Regex::new(&pattern).ok()?;
    let start = re.find(wikitext)?.end();
    let rest = &wikitext[start..];

    let mut depth: i32 = 0;
    let mut end = rest.len();
    let bytes = rest.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                end = i;
                break;
            }
            b'{' | b'[' if bytes.get(i + 1) == Some(&bytes[i]) => {
                depth += 1;
                i += 2;
                continue;
            }
            b'}' | b']' if bytes.get(i + 1) == Some(&bytes[i]) => {
                depth = (depth - 1).max(0);
                i += 2;
                continue;
            }
            b'|' if depth == 0 && FIELD_START_RE.is_match(&rest[i + 1..]) => {
                end = i;
                break;
            }
            _ => {}
        }
        i += 1;
    }
    let value = rest[..end].trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn first_field(wikitext: &str, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|f| infobox_field(wikitext, f))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Infobox {
    pub release_date: Option<NaiveDate>,
    pub release_raw: Option<String>,
    pub publisher_names: Vec<String>,
    pub publisher_raw: Option<String>,
}

pub fn extract_infobox(wikitext: &str) -> Infobox {
    let release_raw = first_field(wikitext, &RELEASE_FIELDS);
    let publisher_raw = first_field(wikitext, &PUBLISHER_FIELDS);
    Infobox {
        release_date: parse_release_date(release_raw.as_deref()),
        publisher_names: parse_publisher_names(publisher_raw.as_deref()),
        release_raw,
        publisher_raw,
    }
}
