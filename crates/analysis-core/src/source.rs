//! The source a job analyzes (scholar profile, code-host account, ...).

use std::fmt;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

/// Upstream the job pulls a subject from.
///
/// Kept open-ended (`Other`) rather than a closed enum: the closed
/// per-source vocabulary of card types lives in the [`crate::planner`]
/// registration table, not here. Adding a source only means registering a
/// new planning table entry, never an enum variant (Open Question (a) in
/// the governing specification).
///
/// Serializes as its lowercase tag string (`"github"`, `"scholar"`, ...)
/// rather than as a tagged object, so `Other` round-trips as plain text too.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    Scholar,
    Github,
    Linkedin,
    Twitter,
    OpenReview,
    HuggingFace,
    YouTube,
    /// Any source not yet given a first-class variant.
    Other(String),
}

impl Serialize for Source {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.tag())
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Err(D::Error::custom("source tag must not be empty"));
        }
        Ok(Source::from(raw))
    }
}

impl Source {
    /// Stable lowercase tag used in cache keys, table lookups, and logs.
    pub fn tag(&self) -> &str {
        match self {
            Source::Scholar => "scholar",
            Source::Github => "github",
            Source::Linkedin => "linkedin",
            Source::Twitter => "twitter",
            Source::OpenReview => "openreview",
            Source::HuggingFace => "huggingface",
            Source::YouTube => "youtube",
            Source::Other(tag) => tag.as_str(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl From<&str> for Source {
    fn from(value: &str) -> Self {
        match value {
            "scholar" => Source::Scholar,
            "github" => Source::Github,
            "linkedin" => Source::Linkedin,
            "twitter" => Source::Twitter,
            "openreview" => Source::OpenReview,
            "huggingface" => Source::HuggingFace,
            "youtube" => Source::YouTube,
            other => Source::Other(other.to_string()),
        }
    }
}

impl From<String> for Source {
    fn from(value: String) -> Self {
        Source::from(value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_sources_round_trip_through_tag() {
        for s in [
            Source::Scholar,
            Source::Github,
            Source::Linkedin,
            Source::Twitter,
            Source::OpenReview,
            Source::HuggingFace,
            Source::YouTube,
        ] {
            let tag = s.tag().to_string();
            assert_eq!(Source::from(tag.as_str()), s);
        }
    }

    #[test]
    fn unknown_source_is_preserved_verbatim() {
        let s = Source::from("mastodon");
        assert_eq!(s, Source::Other("mastodon".to_string()));
        assert_eq!(s.tag(), "mastodon");
    }

    #[test]
    fn display_matches_tag() {
        assert_eq!(Source::Github.to_string(), "github");
    }
}

impl PartialEq<&str> for Source {
    fn eq(&self, other: &&str) -> bool {
        self.tag() == *other
    }
}
