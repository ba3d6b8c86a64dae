//! Video filter: decides whether a discovered video qualifies for processing.
//!
//! Criteria are evaluated in a fixed order and combined with AND semantics.
//! Unset criteria do not constrain, and a metric the platform did not report
//! does not reject a video either.

use crate::config::FilterSettings;
use crate::error::{Result, VidwikiError};
use crate::source::VideoMetadata;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Filter criteria, validated on construction of a [`VideoFilter`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterCriteria {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub min_duration_seconds: Option<u32>,
    pub max_duration_seconds: Option<u32>,
    pub min_views: Option<u64>,
    pub min_likes: Option<u64>,
    pub include_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
}

impl FilterCriteria {
    pub fn from_settings(settings: &FilterSettings) -> Self {
        Self {
            start: settings.start,
            end: settings.end,
            min_duration_seconds: settings.min_duration_seconds,
            max_duration_seconds: settings.max_duration_seconds,
            min_views: settings.min_views,
            min_likes: settings.min_likes,
            include_keywords: settings.include_keywords.clone(),
            exclude_keywords: settings.exclude_keywords.clone(),
            include_tags: settings.include_tags.clone(),
            exclude_tags: settings.exclude_tags.clone(),
        }
    }

    /// Reject inverted ranges.
    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(VidwikiError::Config(format!(
                    "filter start {} is after end {}",
                    start, end
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_duration_seconds, self.max_duration_seconds) {
            if min > max {
                return Err(VidwikiError::Config(format!(
                    "filter minimum duration {}s exceeds maximum {}s",
                    min, max
                )));
            }
        }
        Ok(())
    }
}

/// The first criterion a video failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    PublishedBefore(DateTime<Utc>),
    PublishedAfter(DateTime<Utc>),
    TooShort { duration: u32, min: u32 },
    TooLong { duration: u32, max: u32 },
    TooFewViews { views: u64, min: u64 },
    TooFewLikes { likes: u64, min: u64 },
    NoIncludedKeyword,
    ExcludedKeyword(String),
    NoIncludedTag,
    ExcludedTag(String),
    Predicate(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::PublishedBefore(start) => write!(f, "published before {}", start),
            Rejection::PublishedAfter(end) => write!(f, "published after {}", end),
            Rejection::TooShort { duration, min } => {
                write!(f, "duration {}s below {}s", duration, min)
            }
            Rejection::TooLong { duration, max } => {
                write!(f, "duration {}s above {}s", duration, max)
            }
            Rejection::TooFewViews { views, min } => write!(f, "{} views below {}", views, min),
            Rejection::TooFewLikes { likes, min } => write!(f, "{} likes below {}", likes, min),
            Rejection::NoIncludedKeyword => {
                write!(f, "no required keyword in title or description")
            }
            Rejection::ExcludedKeyword(k) => write!(f, "contains excluded keyword '{}'", k),
            Rejection::NoIncludedTag => write!(f, "no required tag"),
            Rejection::ExcludedTag(t) => write!(f, "has excluded tag '{}'", t),
            Rejection::Predicate(name) => write!(f, "failed predicate '{}'", name),
        }
    }
}

/// A named custom criterion.
pub trait Predicate: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, metadata: &VideoMetadata) -> bool;
}

/// Video has a non-empty description.
pub struct HasDescription;

impl Predicate for HasDescription {
    fn name(&self) -> &str {
        "has_description"
    }

    fn matches(&self, metadata: &VideoMetadata) -> bool {
        metadata
            .description
            .as_deref()
            .is_some_and(|d| !d.trim().is_empty())
    }
}

/// Video has at least one tag.
pub struct HasTags;

impl Predicate for HasTags {
    fn name(&self) -> &str {
        "has_tags"
    }

    fn matches(&self, metadata: &VideoMetadata) -> bool {
        !metadata.tags.is_empty()
    }
}

/// The platform reported a duration.
pub struct KnownDuration;

impl Predicate for KnownDuration {
    fn name(&self) -> &str {
        "known_duration"
    }

    fn matches(&self, metadata: &VideoMetadata) -> bool {
        metadata.duration_seconds.is_some()
    }
}

/// Named predicates that configuration may refer to.
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    predicates: BTreeMap<String, Arc<dyn Predicate>>,
}

impl PredicateRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in predicates.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HasDescription));
        registry.register(Arc::new(HasTags));
        registry.register(Arc::new(KnownDuration));
        registry
    }

    /// Add a predicate, replacing any with the same name.
    pub fn register(&mut self, predicate: Arc<dyn Predicate>) {
        self.predicates.insert(predicate.name().to_string(), predicate);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Predicate>> {
        self.predicates.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.predicates.keys().map(|k| k.as_str()).collect()
    }
}

/// Decides whether videos qualify for processing.
#[derive(Clone)]
pub struct VideoFilter {
    criteria: FilterCriteria,
    predicates: Vec<Arc<dyn Predicate>>,
}

impl VideoFilter {
    /// Build a filter without custom predicates.
    pub fn new(criteria: FilterCriteria) -> Result<Self> {
        criteria.validate()?;
        Ok(Self {
            criteria,
            predicates: Vec::new(),
        })
    }

    /// Build a filter from configuration, resolving custom predicates by name.
    pub fn from_settings(settings: &FilterSettings, registry: &PredicateRegistry) -> Result<Self> {
        let mut filter = Self::new(FilterCriteria::from_settings(settings))?;
        for name in &settings.custom {
            let predicate = registry.get(name).ok_or_else(|| {
                VidwikiError::Config(format!(
                    "Unknown filter predicate '{}' (available: {})",
                    name,
                    registry.names().join(", ")
                ))
            })?;
            filter.predicates.push(predicate);
        }
        Ok(filter)
    }

    pub fn with_predicate(mut self, predicate: Arc<dyn Predicate>) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn criteria(&self) -> &FilterCriteria {
        &self.criteria
    }

    /// Whether the video satisfies every configured criterion.
    pub fn matches(&self, metadata: &VideoMetadata) -> bool {
        match self.evaluate(metadata) {
            Ok(()) => true,
            Err(rejection) => {
                debug!("Rejected {}: {}", metadata.id, rejection);
                false
            }
        }
    }

    /// Evaluate the criteria in order, returning the first one that fails.
    pub fn evaluate(&self, metadata: &VideoMetadata) -> std::result::Result<(), Rejection> {
        let c = &self.criteria;

        if let Some(published) = metadata.published_at {
            if let Some(start) = c.start.filter(|start| published < *start) {
                return Err(Rejection::PublishedBefore(start));
            }
            if let Some(end) = c.end.filter(|end| published > *end) {
                return Err(Rejection::PublishedAfter(end));
            }
        }

        if let Some(duration) = metadata.duration_seconds {
            if let Some(min) = c.min_duration_seconds.filter(|min| duration < *min) {
                return Err(Rejection::TooShort { duration, min });
            }
            if let Some(max) = c.max_duration_seconds.filter(|max| duration > *max) {
                return Err(Rejection::TooLong { duration, max });
            }
        }

        if let (Some(views), Some(min)) = (metadata.view_count, c.min_views) {
            if views < min {
                return Err(Rejection::TooFewViews { views, min });
            }
        }
        if let (Some(likes), Some(min)) = (metadata.like_count, c.min_likes) {
            if likes < min {
                return Err(Rejection::TooFewLikes { likes, min });
            }
        }

        if !c.include_keywords.is_empty() || !c.exclude_keywords.is_empty() {
            let text = metadata.searchable_text().to_lowercase();
            if !c.include_keywords.is_empty()
                && !c.include_keywords.iter().any(|k| text.contains(&k.to_lowercase()))
            {
                return Err(Rejection::NoIncludedKeyword);
            }
            if let Some(k) = c.exclude_keywords.iter().find(|k| text.contains(&k.to_lowercase())) {
                return Err(Rejection::ExcludedKeyword(k.clone()));
            }
        }

        if !c.include_tags.is_empty() || !c.exclude_tags.is_empty() {
            let tags: Vec<String> = metadata.tags.iter().map(|t| t.to_lowercase()).collect();
            let has_tag = |wanted: &String| tags.contains(&wanted.to_lowercase());
            if !c.include_tags.is_empty() && !c.include_tags.iter().any(has_tag) {
                return Err(Rejection::NoIncludedTag);
            }
            if let Some(t) = c.exclude_tags.iter().find(|t| has_tag(t)) {
                return Err(Rejection::ExcludedTag(t.clone()));
            }
        }

        if let Some(p) = self.predicates.iter().find(|p| !p.matches(metadata)) {
            return Err(Rejection::Predicate(p.name().to_string()));
        }

        Ok(())
    }

    /// Keep only the videos that match.
    pub fn filter_batch(&self, videos: Vec<VideoMetadata>) -> Vec<VideoMetadata> {
        let total = videos.len();
        let accepted: Vec<VideoMetadata> = videos.into_iter().filter(|v| self.matches(v)).collect();
        info!("Filter accepted {} of {} videos", accepted.len(), total);
        accepted
    }
}
