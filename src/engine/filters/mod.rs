//! Endpoint filter.
//!
//! Decides whether an observed URL (protocol-push path) or a raw log line
//! (log-tail path) targets one of the monitored API endpoints. Both paths
//! share a single pattern set so the backends cannot drift apart.

use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use thiserror::Error;

/// Product API endpoints monitored when no explicit pattern set is given.
pub const DEFAULT_ENDPOINT_PATTERNS: &[&str] = &[
    r"shopee\.tw/api/v4/pdp/get_pc",
    r"shopee\.tw/api/v4/item/get",
    r"shopee\.tw/api/v4/product/get_shop_info",
];

static DEFAULT_FILTER: Lazy<EndpointFilter> = Lazy::new(|| {
    EndpointFilter::new(DEFAULT_ENDPOINT_PATTERNS.iter().copied())
        .unwrap_or_else(|err| panic!("invalid built-in endpoint pattern: {}", err))
});

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid endpoint pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Match-any predicate over a fixed set of endpoint patterns.
///
/// Matching is case-sensitive over the whole URL, host and path alike.
/// Stateless after construction, so a shared reference can be used from any
/// thread.
#[derive(Debug, Clone)]
pub struct EndpointFilter {
    sources: Vec<String>,
    patterns: Vec<Regex>,
    line_set: RegexSet,
}

impl EndpointFilter {
    /// Build a filter from regular expressions.
    pub fn new<I, S>(patterns: I) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sources: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let compiled = sources
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| FilterError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let line_set = RegexSet::new(&sources).map_err(|source| FilterError::InvalidPattern {
            pattern: sources.join(" | "),
            source,
        })?;

        Ok(Self {
            sources,
            patterns: compiled,
            line_set,
        })
    }

    /// Build a filter from literal path substrings.
    pub fn from_substrings<I, S>(substrings: I) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(
            substrings
                .into_iter()
                .map(|literal| regex::escape(literal.as_ref())),
        )
    }

    /// Does `url` target a monitored endpoint?
    pub fn matches(&self, url: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(url))
    }

    /// Coarse single-pass check of a free-text log line.
    pub fn matches_line(&self, line: &str) -> bool {
        self.line_set.is_match(line)
    }

    /// Source text of the first pattern matching `url`, if any.
    pub fn matching_pattern(&self, url: &str) -> Option<&str> {
        self.patterns
            .iter()
            .position(|pattern| pattern.is_match(url))
            .map(|idx| self.sources[idx].as_str())
    }

    pub fn patterns(&self) -> &[String] {
        &self.sources
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl Default for EndpointFilter {
    fn default() -> Self {
        DEFAULT_FILTER.clone()
    }
}
