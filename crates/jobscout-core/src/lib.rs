//! Canonical job model and source descriptors for Job Scout.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobscout-core";

/// How a configured source is reached: a structured JSON API or a raw
/// career page that needs text extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Api,
    Html,
}

/// One configured origin of job postings. Loaded once per run, immutable
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub base_url: String,
    pub kind: SourceKind,
    pub api_url: Option<String>,
    pub keywords: Option<String>,
}

impl Source {
    pub fn api(name: &str, base_url: &str, api_url: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.to_string(),
            kind: SourceKind::Api,
            api_url: Some(api_url.to_string()),
            keywords: None,
        }
    }

    pub fn html(name: &str, base_url: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.to_string(),
            kind: SourceKind::Html,
            api_url: None,
            keywords: None,
        }
    }
}

/// A job posting in the canonical schema every source is normalized into.
///
/// Every field defaults to the empty string except `date_posted`, which is
/// absent rather than empty when a source carries no posting date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CanonicalJob {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub date_posted: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub job_type: String,
}

impl CanonicalJob {
    /// Two records with the same identity key are the same posting,
    /// regardless of other field differences.
    pub fn identity_key(&self) -> String {
        identity_key(&self.title, &self.company, &self.location)
    }
}

/// Lowercase-trimmed `title|company|location` triple.
pub fn identity_key(title: &str, company: &str, location: &str) -> String {
    format!(
        "{}|{}|{}",
        title.trim().to_lowercase(),
        company.trim().to_lowercase(),
        location.trim().to_lowercase()
    )
}

/// Best-effort record shape coming back from the external extraction or
/// normalization service. Every field is optional; conversion into
/// [`CanonicalJob`] happens at exactly one boundary so vendor and service
/// shape assumptions do not leak into the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct JobDraft {
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub date_posted: Option<String>,
    pub source: Option<String>,
    pub job_type: Option<String>,
}

impl JobDraft {
    /// Apply canonical defaults: missing strings become empty, `source`
    /// falls back to the configured source name, `date_posted` stays absent
    /// rather than turning into an empty string.
    pub fn into_canonical(self, source_name: &str) -> CanonicalJob {
        CanonicalJob {
            title: self.title.unwrap_or_default(),
            company: self.company.unwrap_or_default(),
            location: self.location.unwrap_or_default(),
            url: self.url.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            date_posted: self.date_posted.filter(|d| !d.trim().is_empty()),
            source: match self.source {
                Some(s) if !s.trim().is_empty() => s,
                _ => source_name.to_string(),
            },
            job_type: self.job_type.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_key_is_case_and_whitespace_insensitive() {
        assert_eq!(
            identity_key("Foo", "Bar", "NYC"),
            identity_key(" foo ", " bar ", "nyc")
        );
    }

    #[test]
    fn identity_key_separates_fields() {
        assert_ne!(identity_key("a|b", "c", ""), identity_key("a", "b|c", ""));
    }

    #[test]
    fn draft_defaults_fill_source_and_keep_date_absent() {
        let draft = JobDraft {
            title: Some("Engineer".to_string()),
            date_posted: Some("  ".to_string()),
            ..JobDraft::default()
        };
        let job = draft.into_canonical("Acme Careers");
        assert_eq!(job.title, "Engineer");
        assert_eq!(job.source, "Acme Careers");
        assert_eq!(job.company, "");
        assert_eq!(job.date_posted, None);
    }

    #[test]
    fn draft_keeps_explicit_source() {
        let draft = JobDraft {
            source: Some("Lever board".to_string()),
            ..JobDraft::default()
        };
        assert_eq!(draft.into_canonical("fallback").source, "Lever board");
    }
}
