//! Title, episode and year hints from file names.

use std::path::Path;
use std::sync::LazyLock;

use chrono::Datelike;
use regex::Regex;

static SEASON_EPISODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bS(\d{1,2})[ ._-]?E(\d{1,3})\b").expect("season/episode regex should compile")
});
static EPISODE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:ep?|episode|第)\s*(\d+)").expect("episode marker regex should compile")
});
static EPISODE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2})\s*話").expect("episode suffix regex should compile"));
static EPISODE_DELIMITED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[-_ ](\d{1,2})[-_ ]").expect("delimited episode regex should compile")
});
static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b((?:19|20)\d{2})\b").expect("year regex should compile"));
static BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]|\([^)]*\)").expect("bracket regex should compile"));
static RELEASE_NOISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:\d{3,4}p|x264|x265|h264|h265|hevc|avc|bluray|bdrip|dvdrip|webrip|web-dl|hdtv)\b",
    )
    .expect("release noise regex should compile")
});
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex should compile"));

/// Hints parsed from a file name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedName {
    pub title: String,
    pub episode: Option<u32>,
    pub season: Option<u32>,
    pub year: Option<u16>,
}

/// Parse the file name of `path`.
pub fn parse_file_name(path: &Path) -> ParsedName {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let (season, mut episode) = match SEASON_EPISODE.captures(&stem) {
        Some(caps) => (parse_number(&caps[1]), parse_number(&caps[2])),
        None => (None, None),
    };
    if episode.is_none() {
        episode = find_episode(&stem);
    }

    ParsedName {
        title: clean_title(&stem),
        episode,
        season,
        year: find_year(&stem),
    }
}

fn parse_number(digits: &str) -> Option<u32> {
    digits.parse().ok()
}

fn find_episode(stem: &str) -> Option<u32> {
    // Bracketed tags and release noise often carry digits of their own.
    let stripped = RELEASE_NOISE.replace_all(&BRACKETED.replace_all(stem, " "), " ").to_string();
    [&*EPISODE_MARKER, &*EPISODE_SUFFIX, &*EPISODE_DELIMITED]
        .iter()
        .filter_map(|pattern| pattern.captures(&stripped))
        .filter_map(|caps| parse_number(&caps[1]))
        .find(|episode| (1..1000).contains(episode))
}

fn find_year(stem: &str) -> Option<u16> {
    let max_year = chrono::Utc::now().year() + 1;
    YEAR.captures_iter(stem)
        .filter_map(|caps| caps[1].parse::<i32>().ok())
        .find(|year| (1950..=max_year).contains(year))
        .and_then(|year| u16::try_from(year).ok())
}

fn clean_title(stem: &str) -> String {
    let without_tags = BRACKETED.replace_all(stem, " ");
    let without_noise = RELEASE_NOISE.replace_all(&without_tags, " ");
    let without_episode = SEASON_EPISODE.replace_all(&without_noise, " ");
    // Dotted release names use separators instead of spaces.
    let spaced = if stem.contains(' ') {
        without_episode.to_string()
    } else {
        without_episode.replace(['.', '_'], " ")
    };
    let title = WHITESPACE.replace_all(spaced.trim(), " ");
    let title = title.trim_matches(|c: char| c == '-' || c.is_whitespace());

    if title.is_empty() {
        stem.to_string()
    } else {
        title.to_string()
    }
}
