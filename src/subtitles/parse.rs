//! Caption body parsers. Every parser flattens cues into one line of text.

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

#[derive(Debug, Deserialize)]
struct Json3 {
    #[serde(default)]
    events: Vec<Json3Event>,
}

#[derive(Debug, Deserialize)]
struct Json3Event {
    #[serde(default)]
    segs: Vec<Json3Segment>,
}

#[derive(Debug, Deserialize)]
struct Json3Segment {
    #[serde(default)]
    utf8: String,
}

/// YouTube `json3` timed text
pub fn parse_json3(body: &str) -> Result<String, serde_json::Error> {
    let parsed: Json3 = serde_json::from_str(body)?;
    let parts = parsed
        .events
        .into_iter()
        .flat_map(|event| event.segs)
        .map(|seg| seg.utf8);
    Ok(join_lines(parts))
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<[^>]*>").expect("static regex"))
}

/// SRT / WebVTT: drop cue numbers, timestamps, headers and inline tags
pub fn strip_timed_text(body: &str) -> String {
    let lines = body.lines().map(str::trim).filter(|line| {
        !(line.is_empty()
            || line.chars().all(|c| c.is_ascii_digit())
            || line.contains("-->")
            || line.starts_with("WEBVTT")
            || line.starts_with("Kind:")
            || line.starts_with("Language:")
            || line.starts_with("NOTE"))
    });

    join_lines(lines.map(|line| tag_pattern().replace_all(line, "").into_owned()))
}

/// Trim, drop blanks and join with single spaces
pub fn join_lines<I, S>(lines: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .filter_map(|line| {
            let trimmed = line.as_ref().trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}
