//! Citation renumbering for compressed findings and final reports.
//!
//! Every distinct URL receives exactly one number, assigned 1..=n in order of
//! first appearance in the body, and the trailing source list is rebuilt to
//! match. Markers with no listed source are removed.

use std::collections::HashMap;
use std::fmt::Write as _;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static SOURCES_HEADING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[ \t]*#{0,6}[ \t]*\**[ \t]*(sources|references)[ \t]*\**[ \t]*:?[ \t]*$")
        .expect("invalid sources heading regex")
});
static SOURCE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[-*]\s*)?\[(\d+)\]\s*(.*)$").expect("invalid source line regex")
});
static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s)\]>"']+"#).expect("invalid url regex"));
static MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\d+)\]").expect("invalid citation marker regex"));
static SPACED_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([ \t]*)\[(\d+)\]").expect("invalid citation marker regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub number: usize,
    pub title: String,
    pub url: String,
}

/// Renumber `[n]` markers and rebuild the `### Sources` list.
///
/// Text without a recognisable sources section is returned unchanged.
pub fn normalize_citations(text: &str) -> String {
    let Some(heading) = SOURCES_HEADING.find_iter(text).last() else {
        return text.to_string();
    };

    let body = &text[..heading.start()];
    let listing = &text[heading.end()..];

    let mut old_to_url: HashMap<usize, String> = HashMap::new();
    let mut titles: HashMap<String, String> = HashMap::new();
    let mut listed_order: Vec<String> = Vec::new();
    let mut trailing = Vec::new();

    for line in listing.lines() {
        let Some(caps) = SOURCE_LINE.captures(line) else {
            if !line.trim().is_empty() && !listed_order.is_empty() {
                trailing.push(line);
            }
            continue;
        };
        let Ok(old) = caps[1].parse::<usize>() else {
            continue;
        };
        let rest = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let Some(url) = URL.find(rest).map(|m| m.as_str().trim_end_matches(['.', ',']).to_string())
        else {
            continue;
        };
        let title = clean_title(&URL.replace(rest, ""));
        old_to_url.entry(old).or_insert_with(|| url.clone());
        if !titles.contains_key(&url) {
            titles.insert(url.clone(), title);
            listed_order.push(url);
        }
    }

    if listed_order.is_empty() {
        return text.to_string();
    }

    let mut new_numbers: HashMap<String, usize> = HashMap::new();
    let mut ordered: Vec<String> = Vec::new();
    for caps in MARKER.captures_iter(body) {
        let Ok(old) = caps[1].parse::<usize>() else {
            continue;
        };
        if let Some(url) = old_to_url.get(&old)
            && !new_numbers.contains_key(url)
        {
            ordered.push(url.clone());
            new_numbers.insert(url.clone(), ordered.len());
        }
    }
    for url in &listed_order {
        if !new_numbers.contains_key(url) {
            ordered.push(url.clone());
            new_numbers.insert(url.clone(), ordered.len());
        }
    }

    let renumbered = SPACED_MARKER.replace_all(body, |caps: &Captures| {
        caps[2]
            .parse::<usize>()
            .ok()
            .and_then(|old| old_to_url.get(&old))
            .and_then(|url| new_numbers.get(url))
            .map(|number| format!("{}[{number}]", &caps[1]))
            .unwrap_or_default()
    });

    let mut output = renumbered.trim_end().to_string();
    output.push_str("\n\n### Sources\n");
    for (index, url) in ordered.iter().enumerate() {
        let title = titles.get(url).map(String::as_str).unwrap_or_default();
        if title.is_empty() {
            let _ = writeln!(output, "[{}] {url}", index + 1);
        } else {
            let _ = writeln!(output, "[{}] {title}: {url}", index + 1);
        }
    }
    for line in trailing {
        let _ = writeln!(output, "{line}");
    }
    output
}

/// Parse the rendered source list back into structured entries.
pub fn extract_sources(text: &str) -> Vec<Source> {
    let Some(heading) = SOURCES_HEADING.find_iter(text).last() else {
        return Vec::new();
    };
    text[heading.end()..]
        .lines()
        .filter_map(|line| {
            let caps = SOURCE_LINE.captures(line)?;
            let number = caps[1].parse().ok()?;
            let rest = caps.get(2)?.as_str();
            let url = URL.find(rest)?.as_str().trim_end_matches(['.', ',']).to_string();
            Some(Source {
                number,
                title: clean_title(&URL.replace(rest, "")),
                url,
            })
        })
        .collect()
}

fn clean_title(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(|c: char| c == ':' || c == '-' || c == '(' || c.is_whitespace())
        .trim_end_matches(['<', '('])
        .trim()
        .to_string()
}
