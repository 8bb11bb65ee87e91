//! Pluggable statistical classifier
//!
//! The filter turns an envelope into a fixed-length feature vector and asks a
//! [`Model`] for a verdict. The vector layout is:
//!
//! | index   | feature                                              |
//! |---------|------------------------------------------------------|
//! | 0       | image URLs in the bodies                             |
//! | 1       | URLs in the bodies                                   |
//! | 2       | `Reply-To` equals `From`                             |
//! | 3       | `Return-Path` is neither `From` nor a `To` recipient |
//! | 4       | sender domain client id                              |
//! | 5..30   | MIME part count per [`CONTENT_TYPES`] entry          |
//! | 30..59  | attachment count per [`EXTENSIONS`] entry            |

use crate::envelope::Envelope;
use crate::filtering::Filter;
use async_trait::async_trait;
use lisb_common::{Error, FilterName, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::info;

/// MIME types with a dedicated histogram slot
pub const CONTENT_TYPES: [&str; 25] = [
    "text/html",
    "text/plain",
    "multipart/mixed",
    "application/octet-stream",
    "multipart/alternative",
    "multipart/related",
    "image/jpeg",
    "image/gif",
    "message/rfc822",
    "text/plain charset=us-ascii",
    "image/png",
    "text/x-vcard",
    "image/bmp",
    "application/x-zip-compressed",
    "multipart/signed",
    "application/pgp-signature",
    "text/enriched",
    "application/ms-tnef",
    "video/mng",
    "application/x-pkcs7-signature",
    "multipart/report",
    "message/delivery-status",
    "text/rfc822-headers",
    "application/x-java-applet",
    "application/x-patch",
];

/// Attachment extensions with a dedicated histogram slot (case-sensitive)
pub const EXTENSIONS: [&str; 29] = [
    "txt", "html", "jpg", "png", "gif", "lst", "JPG", "htm", "doc", "GIF", "JPE", "b64", "BIN",
    "Jpg", "zip", "dat", "rar", "bmp", "jpe", "jpeg", "gz", "PDF.html", "url", "ng",
    "spec.patch", "spec", "patch", "p7s", "am",
];

const SIGNAL_COUNT: usize = 5;

/// Length of the feature vector
pub const FEATURE_COUNT: usize = SIGNAL_COUNT + CONTENT_TYPES.len() + EXTENSIONS.len();

/// Scale applied to the sender domain hash
const CLIENT_ID_DIVISOR: f64 = 1_111_118_111_111.0;

const URL_PATTERN: &str = r"https?://(?:[-\w.]|(?:%[\da-fA-F]{2}))+";
const IMAGE_PATTERN: &str = r"https?://(?:[-\w.]|/|(?:%[\da-fA-F]{2}))+\.(?:jpg|jpeg|gif|png)";

/// A trained spam model
pub trait Model: Send + Sync {
    /// Whether `features` (of length [`FEATURE_COUNT`]) describe spam
    fn predict(&self, features: &[f64]) -> bool;
}

/// Linear model: spam iff `weights · features + bias > threshold`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub weights: Vec<f64>,
    #[serde(default)]
    pub bias: f64,
    #[serde(default)]
    pub threshold: f64,
}

impl LinearModel {
    /// Load a model from its JSON representation
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read model {}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let model: LinearModel = serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse model: {}", e)))?;

        if model.weights.len() != FEATURE_COUNT {
            return Err(Error::Config(format!(
                "Model has {} weights, expected {}",
                model.weights.len(),
                FEATURE_COUNT
            )));
        }
        Ok(model)
    }

    pub fn score(&self, features: &[f64]) -> f64 {
        self.weights
            .iter()
            .zip(features)
            .map(|(weight, feature)| weight * feature)
            .sum::<f64>()
            + self.bias
    }
}

impl Model for LinearModel {
    fn predict(&self, features: &[f64]) -> bool {
        self.score(features) > self.threshold
    }
}

/// Feature extraction with precompiled body patterns
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    url_pattern: Regex,
    image_pattern: Regex,
}

impl FeatureExtractor {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| Error::Filter(format!("Invalid pattern: {}", e)))
        };

        Ok(Self {
            url_pattern: compile(URL_PATTERN)?,
            image_pattern: compile(IMAGE_PATTERN)?,
        })
    }

    /// Feature vector of `envelope`, [`FEATURE_COUNT`] entries long
    pub fn features(&self, envelope: &Envelope) -> Vec<f64> {
        let mut features = Vec::with_capacity(FEATURE_COUNT);
        let body = envelope.body_text();

        features.push(self.image_pattern.find_iter(body).count() as f64);
        features.push(self.url_pattern.find_iter(body).count() as f64);
        features.push(flag(from_equals_reply_to(envelope)));
        features.push(flag(return_path_inconsistent(envelope)));
        features.push(envelope.sender_domain().map_or(0.0, client_id));

        for content_type in CONTENT_TYPES {
            let count = envelope
                .parts()
                .iter()
                .filter(|part| part.content_type == content_type)
                .count();
            features.push(count as f64);
        }

        for extension in EXTENSIONS {
            let suffix = format!(".{}", extension);
            let count = envelope
                .parts()
                .iter()
                .filter_map(|part| part.attachment_name.as_deref())
                .filter(|name| name.ends_with(&suffix))
                .count();
            features.push(count as f64);
        }

        features
    }
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn from_equals_reply_to(envelope: &Envelope) -> bool {
    matches!(
        (envelope.parsed_reply_to(), envelope.parsed_from()),
        (Some(reply_to), Some(from)) if reply_to == from
    )
}

fn return_path_inconsistent(envelope: &Envelope) -> bool {
    match (envelope.parsed_return_path(), envelope.parsed_to()) {
        (Some(return_path), Some(tos)) => {
            envelope.parsed_from() != Some(return_path) && !tos.iter().any(|to| to == return_path)
        }
        _ => false,
    }
}

/// Stable, scaled-down hash of a sender domain
pub fn client_id(domain: &str) -> f64 {
    let digest = Sha256::digest(domain.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) as f64 / CLIENT_ID_DIVISOR).round()
}

/// Classifier filter backed by a [`Model`]
pub struct ClassifierFilter {
    extractor: FeatureExtractor,
    model: Box<dyn Model>,
}

impl ClassifierFilter {
    pub fn new(model: Box<dyn Model>) -> Result<Self> {
        Ok(Self {
            extractor: FeatureExtractor::new()?,
            model,
        })
    }
}

#[async_trait]
impl Filter for ClassifierFilter {
    fn name(&self) -> FilterName {
        FilterName::Ai
    }

    async fn check(&self, envelope: &Envelope) -> Result<bool> {
        let features = self.extractor.features(envelope);
        let is_spam = self.model.predict(&features);
        if is_spam {
            info!("Classifier has detected the message as spam");
        }
        Ok(is_spam)
    }
}
