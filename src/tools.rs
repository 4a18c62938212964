//! Agent tool artifacts and their selection by series and architecture.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while parsing or selecting tools.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolsError {
    /// No tools satisfied the filter.
    #[error("no matching tools available")]
    NoMatches,
    /// A tools descriptor did not have the `version-series-arch` shape.
    #[error("invalid tools binary {0:?}: expected version-series-arch")]
    InvalidBinary(String),
}

/// A single downloadable agent tools tarball.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tools {
    /// Agent version, for example `1.4.2`.
    pub version: String,
    /// Operating system series the build targets.
    pub series: String,
    /// CPU architecture the build targets.
    pub arch: String,
    /// Where the tarball can be downloaded from, if known.
    pub url: Option<String>,
}

impl Tools {
    /// The `version-series-arch` triple identifying this build.
    #[must_use]
    pub fn binary(&self) -> String { format!("{}-{}-{}", self.version, self.series, self.arch) }
}

impl fmt::Display for Tools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.binary()) }
}

impl FromStr for Tools {
    type Err = ToolsError;

    /// Parse `version-series-arch`, optionally followed by `=url`.
    ///
    /// The version may itself contain dashes; series and arch may not.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (binary, url) = match s.split_once('=') {
            Some((binary, url)) => (binary.trim(), Some(url.trim().to_owned())),
            None => (s.trim(), None),
        };
        let mut parts = binary.rsplitn(3, '-');
        let (Some(arch), Some(series), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ToolsError::InvalidBinary(s.to_owned()));
        };
        if [arch, series, version].iter().any(|part| part.is_empty()) {
            return Err(ToolsError::InvalidBinary(s.to_owned()));
        }
        Ok(Self {
            version: version.to_owned(),
            series: series.to_owned(),
            arch: arch.to_owned(),
            url,
        })
    }
}

/// Criteria tools must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolsFilter {
    /// Required series, if any.
    pub series: Option<String>,
    /// Required architecture, if any.
    pub arch: Option<String>,
}

impl ToolsFilter {
    fn accepts(&self, tools: &Tools) -> bool {
        self.series.as_ref().is_none_or(|series| *series == tools.series)
            && self.arch.as_ref().is_none_or(|arch| *arch == tools.arch)
    }
}

/// An ordered collection of available tools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsList(Vec<Tools>);

impl ToolsList {
    /// Wrap a list of tools.
    #[must_use]
    pub const fn new(tools: Vec<Tools>) -> Self { Self(tools) }

    /// Parse a comma-separated list of tools descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`ToolsError::InvalidBinary`] for the first malformed entry.
    ///
    /// # Examples
    ///
    /// ```
    /// use clusterboot::tools::ToolsList;
    ///
    /// let list = ToolsList::parse("1.0.0-jammy-amd64, 1.0.0-jammy-arm64").expect("valid list");
    /// assert_eq!(list.len(), 2);
    /// ```
    pub fn parse(text: &str) -> Result<Self, ToolsError> {
        text.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Tools that satisfy `filter`, in their original order.
    ///
    /// # Errors
    ///
    /// Returns [`ToolsError::NoMatches`] if nothing matches.
    pub fn matching(&self, filter: &ToolsFilter) -> Result<Self, ToolsError> {
        let matched: Vec<Tools> = self
            .0
            .iter()
            .filter(|tools| filter.accepts(tools))
            .cloned()
            .collect();
        if matched.is_empty() {
            return Err(ToolsError::NoMatches);
        }
        Ok(Self(matched))
    }

    /// Number of tools in the list.
    #[must_use]
    pub const fn len(&self) -> usize { self.0.len() }

    /// Whether the list is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Iterate over the tools.
    pub fn iter(&self) -> impl Iterator<Item = &Tools> { self.0.iter() }
}
