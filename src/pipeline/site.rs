//! Applicant tracking system detection and confirmation extraction.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Applicant tracking system hosting a job posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteKind {
    Linkedin,
    Greenhouse,
    Lever,
    Workday,
    Indeed,
    Bamboohr,
    Generic,
}

/// Host fragments per site, checked in order.
const SITE_MARKERS: &[(SiteKind, &[&str])] = &[
    (SiteKind::Linkedin, &["linkedin.com"]),
    (SiteKind::Greenhouse, &["greenhouse.io"]),
    (SiteKind::Lever, &["lever.co"]),
    (SiteKind::Workday, &["myworkdayjobs.com", "workday.com"]),
    (SiteKind::Indeed, &["indeed.com"]),
    (SiteKind::Bamboohr, &["bamboohr.com"]),
];

impl SiteKind {
    /// Classifies a job URL. Unknown hosts are `Generic`.
    pub fn detect(url: &str) -> Self {
        let url = url.to_lowercase();
        SITE_MARKERS
            .iter()
            .find(|(_, markers)| markers.iter().any(|m| url.contains(m)))
            .map(|(kind, _)| *kind)
            .unwrap_or(SiteKind::Generic)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SiteKind::Linkedin => "linkedin",
            SiteKind::Greenhouse => "greenhouse",
            SiteKind::Lever => "lever",
            SiteKind::Workday => "workday",
            SiteKind::Indeed => "indeed",
            SiteKind::Bamboohr => "bamboohr",
            SiteKind::Generic => "generic",
        }
    }
}

impl fmt::Display for SiteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn keyword_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(?:confirmation|reference|application\s+id|tracking|ticket)\b")
            .expect("confirmation keyword regex should compile")
    })
}

fn code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b[A-Za-z0-9][A-Za-z0-9-]{5,}\b").expect("code regex should compile")
    })
}

fn bare_code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b[A-Z0-9]{8,}\b").expect("bare code regex should compile"))
}

/// How far after a keyword a code may appear.
const KEYWORD_REACH: usize = 80;

fn looks_like_code(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit())
}

/// Finds a confirmation or reference number in page or handler text.
///
/// Codes near a keyword such as "confirmation" or "reference" win over
/// bare upper-case codes elsewhere in the text. A code must contain at
/// least one digit.
pub fn extract_confirmation_number(text: &str) -> Option<String> {
    for keyword in keyword_pattern().find_iter(text) {
        let start = keyword.end();
        let mut end = (start + KEYWORD_REACH).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let window = &text[start..end];
        if let Some(code) = code_pattern()
            .find_iter(window)
            .map(|m| m.as_str())
            .find(|token| looks_like_code(token))
        {
            return Some(code.to_string());
        }
    }

    bare_code_pattern()
        .find_iter(text)
        .map(|m| m.as_str())
        .find(|token| looks_like_code(token))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_sites() {
        let cases = [
            ("https://www.linkedin.com/jobs/view/3812345678", SiteKind::Linkedin),
            ("https://job-boards.greenhouse.io/doordashusa/jobs/7118562", SiteKind::Greenhouse),
            ("https://boards.greenhouse.io/acme/jobs/1", SiteKind::Greenhouse),
            ("https://jobs.lever.co/acme/1c2d/apply", SiteKind::Lever),
            ("https://acme.wd5.myworkdayjobs.com/en-US/careers/job/1", SiteKind::Workday),
            ("https://www.indeed.com/viewjob?jk=abc", SiteKind::Indeed),
            ("https://acme.bamboohr.com/careers/42", SiteKind::Bamboohr),
            ("https://careers.acme.com/jobs/42", SiteKind::Generic),
            ("HTTPS://JOBS.LEVER.CO/ACME", SiteKind::Lever),
        ];
        for (url, expected) in cases {
            assert_eq!(SiteKind::detect(url), expected, "{}", url);
        }
    }

    #[test]
    fn test_extract_after_keyword() {
        assert_eq!(
            extract_confirmation_number("Thank you! Your confirmation number is GH-88231X."),
            Some("GH-88231X".to_string())
        );
        assert_eq!(
            extract_confirmation_number("Application ID: a1b2c3d4 has been received"),
            Some("a1b2c3d4".to_string())
        );
        assert_eq!(
            extract_confirmation_number("Reference: 20240117-0042"),
            Some("20240117-0042".to_string())
        );
    }

    #[test]
    fn test_words_are_not_codes() {
        assert_eq!(
            extract_confirmation_number("You will receive a confirmation email shortly."),
            None
        );
    }

    #[test]
    fn test_bare_code_fallback() {
        assert_eq!(
            extract_confirmation_number("Submitted. Keep ABC12345 for your records."),
            Some("ABC12345".to_string())
        );
        assert_eq!(extract_confirmation_number("APPLICATION SUBMITTED"), None);
    }

    #[test]
    fn test_multibyte_text_near_keyword() {
        let text = format!("confirmation {} REF123456", "é".repeat(50));
        assert_eq!(extract_confirmation_number(&text), Some("REF123456".to_string()));
    }
}
