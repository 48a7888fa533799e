//! Challenge and resolution types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::config::duration_ms;

/// Kind of interactive challenge a site presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Recaptcha,
    Hcaptcha,
    Cloudflare,
    Image,
    Text,
    Unknown,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::Recaptcha => "recaptcha",
            ChallengeKind::Hcaptcha => "hcaptcha",
            ChallengeKind::Cloudflare => "cloudflare",
            ChallengeKind::Image => "image",
            ChallengeKind::Text => "text",
            ChallengeKind::Unknown => "unknown",
        }
    }

    /// Whether recognition-based tiers can attempt this kind.
    pub fn is_text_or_image(&self) -> bool {
        matches!(self, ChallengeKind::Image | ChallengeKind::Text)
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "recaptcha" => Ok(ChallengeKind::Recaptcha),
            "hcaptcha" => Ok(ChallengeKind::Hcaptcha),
            "cloudflare" => Ok(ChallengeKind::Cloudflare),
            "image" | "image_captcha" => Ok(ChallengeKind::Image),
            "text" | "text_captcha" => Ok(ChallengeKind::Text),
            "unknown" => Ok(ChallengeKind::Unknown),
            other => Err(format!("unknown challenge kind: {}", other)),
        }
    }
}

/// A challenge captured while processing a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeContext {
    pub id: Uuid,
    pub kind: ChallengeKind,
    /// Captured visual evidence, usually a PNG screenshot.
    #[serde(with = "evidence_base64", default)]
    pub evidence: Vec<u8>,
    pub job_id: Uuid,
    pub owner_id: String,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub page_url: Option<String>,
}

impl ChallengeContext {
    pub fn new(
        kind: ChallengeKind,
        job_id: Uuid,
        owner_id: impl Into<String>,
        evidence: Vec<u8>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            evidence,
            job_id,
            owner_id: owner_id.into(),
            detected_at: Utc::now(),
            page_url: None,
        }
    }

    pub fn with_page_url(mut self, url: impl Into<String>) -> Self {
        self.page_url = Some(url.into());
        self
    }
}

mod evidence_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Resolution strategy, in default chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Vision,
    Ocr,
    PaidService,
    Behavioral,
    Manual,
}

impl TierKind {
    pub const DEFAULT_ORDER: [TierKind; 5] = [
        TierKind::Vision,
        TierKind::Ocr,
        TierKind::PaidService,
        TierKind::Behavioral,
        TierKind::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TierKind::Vision => "vision",
            TierKind::Ocr => "ocr",
            TierKind::PaidService => "paid_service",
            TierKind::Behavioral => "behavioral",
            TierKind::Manual => "manual",
        }
    }

    /// Whether a tier in this position may attempt `kind` at all.
    ///
    /// Recognition tiers only handle text and image challenges.
    pub fn handles(&self, kind: ChallengeKind) -> bool {
        match self {
            TierKind::Vision | TierKind::Ocr => kind.is_text_or_image(),
            _ => true,
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TierKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "vision" => Ok(TierKind::Vision),
            "ocr" => Ok(TierKind::Ocr),
            "paid_service" | "paid" => Ok(TierKind::PaidService),
            "behavioral" => Ok(TierKind::Behavioral),
            "manual" => Ok(TierKind::Manual),
            other => Err(format!("unknown resolution tier: {}", other)),
        }
    }
}

/// Result of one tier attempt, or of the whole chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub success: bool,
    pub solution: Option<String>,
    /// In [0, 1].
    pub confidence: f64,
    /// Tier that produced the outcome. `None` for an exhausted chain.
    pub method: Option<TierKind>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    /// Provider cost in US cents, when the tier charges.
    pub cost: Option<f64>,
    pub error: Option<String>,
}

impl ResolutionOutcome {
    /// A successful attempt.
    pub fn solved(method: TierKind, solution: impl Into<String>, confidence: f64) -> Self {
        Self {
            success: true,
            solution: Some(solution.into()),
            confidence: confidence.clamp(0.0, 1.0),
            method: Some(method),
            elapsed: Duration::ZERO,
            cost: None,
            error: None,
        }
    }

    /// An attempt that ran but did not solve the challenge.
    pub fn failed(method: TierKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            solution: None,
            confidence: 0.0,
            method: Some(method),
            elapsed: Duration::ZERO,
            cost: None,
            error: Some(error.into()),
        }
    }

    /// Terminal outcome when no tier qualified.
    pub fn exhausted(elapsed: Duration) -> Self {
        Self {
            success: false,
            solution: None,
            confidence: 0.0,
            method: None,
            elapsed,
            cost: None,
            error: Some("all resolution tiers exhausted".to_string()),
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn with_cost(mut self, cents: f64) -> Self {
        self.cost = Some(cents);
        self
    }

    /// Whether this outcome ends the chain.
    pub fn is_confident(&self, threshold: f64) -> bool {
        self.success && self.confidence > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_or_image_kinds() {
        assert!(ChallengeKind::Image.is_text_or_image());
        assert!(ChallengeKind::Text.is_text_or_image());
        assert!(!ChallengeKind::Recaptcha.is_text_or_image());
        assert!(!ChallengeKind::Cloudflare.is_text_or_image());
        assert!(!ChallengeKind::Unknown.is_text_or_image());
    }

    #[test]
    fn test_recognition_tiers_handle_text_and_image() {
        assert!(TierKind::Vision.handles(ChallengeKind::Image));
        assert!(TierKind::Ocr.handles(ChallengeKind::Text));
        assert!(!TierKind::Vision.handles(ChallengeKind::Recaptcha));
        assert!(!TierKind::Ocr.handles(ChallengeKind::Cloudflare));
        assert!(TierKind::PaidService.handles(ChallengeKind::Recaptcha));
        assert!(TierKind::Behavioral.handles(ChallengeKind::Hcaptcha));
        assert!(TierKind::Manual.handles(ChallengeKind::Unknown));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("image_captcha".parse::<ChallengeKind>().unwrap(), ChallengeKind::Image);
        assert_eq!("HCAPTCHA".parse::<ChallengeKind>().unwrap(), ChallengeKind::Hcaptcha);
        assert!("puzzle".parse::<ChallengeKind>().is_err());

        assert_eq!("paid-service".parse::<TierKind>().unwrap(), TierKind::PaidService);
        assert_eq!("manual".parse::<TierKind>().unwrap(), TierKind::Manual);
        assert!("oracle".parse::<TierKind>().is_err());
    }

    #[test]
    fn test_confidence_gate_is_strict() {
        let outcome = ResolutionOutcome::solved(TierKind::Ocr, "x7k2p", 0.7);
        assert!(!outcome.is_confident(0.7));

        let outcome = ResolutionOutcome::solved(TierKind::Ocr, "x7k2p", 0.71);
        assert!(outcome.is_confident(0.7));

        let outcome = ResolutionOutcome::failed(TierKind::Ocr, "unreadable");
        assert!(!outcome.is_confident(0.0));
    }

    #[test]
    fn test_exhausted_outcome() {
        let outcome = ResolutionOutcome::exhausted(Duration::from_millis(120));
        assert!(!outcome.success);
        assert_eq!(outcome.confidence, 0.0);
        assert!(outcome.method.is_none());
        assert!(outcome.solution.is_none());
    }

    #[test]
    fn test_context_evidence_serializes_as_base64() {
        let ctx = ChallengeContext::new(ChallengeKind::Image, Uuid::new_v4(), "user-1", vec![1, 2, 3])
            .with_page_url("https://jobs.lever.co/acme/1/apply");

        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["evidence"], "AQID");
        assert_eq!(json["kind"], "image");

        let back: ChallengeContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, ctx);
    }
}
