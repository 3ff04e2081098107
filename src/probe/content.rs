//! Content heuristics for platforms without a public lookup API.
//!
//! Rules are applied in order and the first one that fires wins. The
//! matched indicator travels with the verdict so callers can log it.
use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::CheckStatus;
use crate::platform::PlatformConfig;

/// Not-found fragments shared by every content-probed platform.
pub const GENERIC_NOT_FOUND_TEXT: &[&str] = &[
    "page not found",
    "user not found",
    "account not found",
    "this page doesn't exist",
    "this account doesn't exist",
    "no longer available",
    "profile isn't available",
];

/// Words that show up on rendered profile pages.
const PROFILE_BOILERPLATE: &[&str] = &[
    "followers",
    "following",
    "posts",
    "joined",
    "subscribers",
    "likes",
    "verified",
    "bio",
];

const BOILERPLATE_THRESHOLD: usize = 3;
const SHORT_BODY_CHARS: usize = 512;

static NOT_FOUND_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)\berror\s*:?\s*404\b",
        r"|\b404\s*[-:|]?\s*(?:page\s+)?not\s+found\b",
        r"|(?:could not|couldn't|cannot|can't) be found",
        r"|no such (?:user|account)",
    ))
    .expect("valid not-found regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    AvailableIndicator,
    TakenIndicator,
    NotFoundText,
    NotFoundStatus,
    ProfileBoilerplate,
    NotFoundPhrase,
    ShortBody,
    Default,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::AvailableIndicator => "available_indicator",
            Rule::TakenIndicator => "taken_indicator",
            Rule::NotFoundText => "not_found_text",
            Rule::NotFoundStatus => "not_found_status",
            Rule::ProfileBoilerplate => "profile_boilerplate",
            Rule::NotFoundPhrase => "not_found_phrase",
            Rule::ShortBody => "short_body",
            Rule::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: CheckStatus,
    pub rule: Rule,
    pub matched: Option<String>,
}

impl Verdict {
    fn new(status: CheckStatus, rule: Rule, matched: Option<String>) -> Self {
        Self {
            status,
            rule,
            matched,
        }
    }
}

fn normalize(text: &str) -> String {
    text.replace(['\u{2019}', '\u{2018}'], "'").to_lowercase()
}

fn first_match(haystack: &str, needles: &[&str]) -> Option<String> {
    needles
        .iter()
        .find(|needle| haystack.contains(&normalize(needle)))
        .map(|needle| needle.to_string())
}

/// Classify a fetched profile page. Falls back to `Unavailable` when
/// nothing conclusive is found.
pub fn classify(config: &PlatformConfig, http_status: u16, body: &str) -> Verdict {
    let page = normalize(body);

    if let Some(hit) = first_match(&page, config.available_indicators) {
        return Verdict::new(CheckStatus::Available, Rule::AvailableIndicator, Some(hit));
    }
    if let Some(hit) = first_match(&page, config.taken_indicators) {
        return Verdict::new(CheckStatus::Unavailable, Rule::TakenIndicator, Some(hit));
    }
    if let Some(hit) = first_match(&page, config.not_found_text)
        .or_else(|| first_match(&page, GENERIC_NOT_FOUND_TEXT))
    {
        return Verdict::new(CheckStatus::Available, Rule::NotFoundText, Some(hit));
    }

    if http_status == 404 || http_status == 410 {
        return Verdict::new(
            CheckStatus::Available,
            Rule::NotFoundStatus,
            Some(http_status.to_string()),
        );
    }
    let boilerplate: Vec<&str> = PROFILE_BOILERPLATE
        .iter()
        .copied()
        .filter(|term| page.contains(term))
        .collect();
    if boilerplate.len() >= BOILERPLATE_THRESHOLD {
        return Verdict::new(
            CheckStatus::Unavailable,
            Rule::ProfileBoilerplate,
            Some(boilerplate.join(",")),
        );
    }
    if let Some(m) = NOT_FOUND_PHRASE.find(body) {
        return Verdict::new(
            CheckStatus::Available,
            Rule::NotFoundPhrase,
            Some(m.as_str().to_string()),
        );
    }
    let trimmed = body.trim().chars().count();
    if trimmed < SHORT_BODY_CHARS {
        return Verdict::new(
            CheckStatus::Available,
            Rule::ShortBody,
            Some(format!("{} chars", trimmed)),
        );
    }

    Verdict::new(CheckStatus::Unavailable, Rule::Default, None)
}
