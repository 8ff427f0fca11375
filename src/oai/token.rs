//! Resumption tokens: opaque ListRecords cursors.
//!
//! Wire form is URL-safe base64 (no padding) of a JSON object holding the
//! filter and the 0-based page index. Nothing is stored server side.

use super::error::OaiError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResumptionToken {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_date: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until_date: Option<String>,

    #[serde(default)]
    pub page: usize,
}

impl ResumptionToken {
    /// First page of a filter.
    pub fn new(set: Option<String>, from_date: Option<String>, until_date: Option<String>) -> Self {
        Self {
            set,
            from_date,
            until_date,
            page: 0,
        }
    }

    /// Same filter, following page.
    pub fn next_page(&self) -> Self {
        Self {
            page: self.page + 1,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> String {
        // Serializing a struct of strings and an integer cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self, OaiError> {
        let json = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| OaiError::BadResumptionToken)?;
        serde_json::from_slice(&json).map_err(|_| OaiError::BadResumptionToken)
    }
}
