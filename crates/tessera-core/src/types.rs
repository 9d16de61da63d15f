use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TesseraError;

/// Open, schema-less metadata attached to cache entries and point payloads.
///
/// A `BTreeMap` keeps serialization order stable.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Connectivity counts for one file, as reported by the graph store.
///
/// Missing data is represented by [`GraphMetrics::default`] (all zero).
///
/// # Examples
///
/// ```
/// use tessera_core::GraphMetrics;
///
/// let metrics = GraphMetrics::default();
/// assert!(metrics.is_empty());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMetrics {
    /// Calls into this file's functions from elsewhere.
    pub incoming_calls: u64,
    /// Calls this file's functions make.
    pub outgoing_calls: u64,
    /// Number of other files connected through calls.
    pub related_count: u64,
}

impl GraphMetrics {
    /// `true` when every count is zero.
    pub fn is_empty(&self) -> bool {
        self.incoming_calls == 0 && self.outgoing_calls == 0 && self.related_count == 0
    }
}

/// Named neighbours of a file in the call graph, each list capped by the
/// query that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNeighbors {
    /// Functions elsewhere that call into this file.
    #[serde(default)]
    pub called_by: Vec<String>,
    /// Functions this file calls.
    #[serde(default)]
    pub calls_to: Vec<String>,
    /// Modules connected through calls in either direction.
    #[serde(default)]
    pub related_modules: Vec<String>,
}

impl GraphNeighbors {
    /// `true` when every list is empty.
    pub fn is_empty(&self) -> bool {
        self.called_by.is_empty() && self.calls_to.is_empty() && self.related_modules.is_empty()
    }
}

/// Weights for fusing semantic similarity with graph signals.
///
/// Each weight lies in `[0, 1]`; they are combined as a weighted linear sum
/// and are not required to total 1.
///
/// # Examples
///
/// ```
/// use tessera_core::ScoreWeights;
///
/// let weights = ScoreWeights::default();
/// assert_eq!(weights.semantic, 0.6);
/// assert!(ScoreWeights::new(1.5, 0.0, 0.0, 0.0).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    /// Weight of the vector similarity score.
    #[serde(default = "default_semantic_weight")]
    pub semantic: f64,
    /// Weight of normalized incoming call count.
    #[serde(default = "default_incoming_weight")]
    pub incoming: f64,
    /// Weight of normalized outgoing call count.
    #[serde(default = "default_outgoing_weight")]
    pub outgoing: f64,
    /// Weight of normalized related-file count.
    #[serde(default = "default_connections_weight")]
    pub connections: f64,
}

fn default_semantic_weight() -> f64 {
    0.6
}

fn default_incoming_weight() -> f64 {
    0.2
}

fn default_outgoing_weight() -> f64 {
    0.1
}

fn default_connections_weight() -> f64 {
    0.1
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            semantic: default_semantic_weight(),
            incoming: default_incoming_weight(),
            outgoing: default_outgoing_weight(),
            connections: default_connections_weight(),
        }
    }
}

impl ScoreWeights {
    /// Build weights, rejecting any value outside `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Config`] when a weight is out of range or NaN.
    pub fn new(
        semantic: f64,
        incoming: f64,
        outgoing: f64,
        connections: f64,
    ) -> Result<Self, TesseraError> {
        let weights = Self {
            semantic,
            incoming,
            outgoing,
            connections,
        };
        weights.validate()?;
        Ok(weights)
    }

    /// Check that every weight lies in `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Config`] naming the offending weight.
    pub fn validate(&self) -> Result<(), TesseraError> {
        for (name, value) in [
            ("semantic", self.semantic),
            ("incoming", self.incoming),
            ("outgoing", self.outgoing),
            ("connections", self.connections),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TesseraError::Config(format!(
                    "score weight '{name}' must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Relevance band derived from a hybrid score.
///
/// # Examples
///
/// ```
/// use tessera_core::RelevanceLabel;
///
/// assert_eq!(RelevanceLabel::Excellent.to_string(), "excellent");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelevanceLabel {
    /// Strong match.
    Excellent,
    /// Good match.
    Good,
    /// Partial match.
    Fair,
    /// Weak match.
    Weak,
}

impl fmt::Display for RelevanceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelevanceLabel::Excellent => write!(f, "excellent"),
            RelevanceLabel::Good => write!(f, "good"),
            RelevanceLabel::Fair => write!(f, "fair"),
            RelevanceLabel::Weak => write!(f, "weak"),
        }
    }
}

/// Score thresholds for [`RelevanceLabel`] bands.
///
/// A score at or above `excellent` is labeled Excellent, and so on downward;
/// anything below `fair` is Weak.
///
/// # Examples
///
/// ```
/// use tessera_core::{LabelThresholds, RelevanceLabel};
///
/// let t = LabelThresholds::default();
/// assert_eq!(t.label(0.85), RelevanceLabel::Excellent);
/// assert_eq!(t.label(0.6), RelevanceLabel::Good);
/// assert_eq!(t.label(0.1), RelevanceLabel::Weak);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelThresholds {
    /// Lower bound of the Excellent band.
    #[serde(default = "default_excellent")]
    pub excellent: f64,
    /// Lower bound of the Good band.
    #[serde(default = "default_good")]
    pub good: f64,
    /// Lower bound of the Fair band.
    #[serde(default = "default_fair")]
    pub fair: f64,
}

fn default_excellent() -> f64 {
    0.8
}

fn default_good() -> f64 {
    0.6
}

fn default_fair() -> f64 {
    0.4
}

impl Default for LabelThresholds {
    fn default() -> Self {
        Self {
            excellent: default_excellent(),
            good: default_good(),
            fair: default_fair(),
        }
    }
}

impl LabelThresholds {
    /// Label a score.
    pub fn label(&self, score: f64) -> RelevanceLabel {
        if score >= self.excellent {
            RelevanceLabel::Excellent
        } else if score >= self.good {
            RelevanceLabel::Good
        } else if score >= self.fair {
            RelevanceLabel::Fair
        } else {
            RelevanceLabel::Weak
        }
    }
}

/// A single ranked search result.
///
/// # Examples
///
/// ```
/// use tessera_core::{GraphMetrics, GraphNeighbors, RelevanceLabel, SearchResult};
///
/// let result = SearchResult {
///     source_path: "src/auth.rs".into(),
///     semantic_score: 0.91,
///     graph_metrics: GraphMetrics::default(),
///     hybrid_score: 0.91,
///     relevance_label: RelevanceLabel::Excellent,
///     neighbors: GraphNeighbors::default(),
///     preview: None,
///     indexed_at: None,
/// };
/// assert!(result.hybrid_score > 0.9);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    /// File identity (repository-relative path).
    pub source_path: String,
    /// Vector similarity in `[0, 1]`.
    pub semantic_score: f64,
    /// Graph connectivity for the file (zero when unknown or disabled).
    pub graph_metrics: GraphMetrics,
    /// Fused ranking key.
    pub hybrid_score: f64,
    /// Band derived from `hybrid_score`.
    pub relevance_label: RelevanceLabel,
    /// Named callers, callees, and related modules, when graph data was fetched.
    #[serde(default, skip_serializing_if = "GraphNeighbors::is_empty")]
    pub neighbors: GraphNeighbors,
    /// Leading excerpt of the file, when the store has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    /// When the file was last embedded, when the store has it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<String>,
}

/// Kind of change reported by a version-control diff.
///
/// # Examples
///
/// ```
/// use tessera_core::ChangeKind;
///
/// assert!(ChangeKind::Modified.needs_reindex());
/// assert!(!ChangeKind::Deleted.needs_reindex());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    /// New file.
    Added,
    /// Existing file modified.
    Modified,
    /// File removed.
    Deleted,
    /// File renamed from another path.
    Renamed {
        /// Original path before rename.
        from: String,
    },
    /// File copied from another path.
    Copied,
    /// Mode or type change (e.g. regular file to symlink).
    TypeChanged,
}

impl ChangeKind {
    /// Whether a file with this change needs a fresh embedding.
    ///
    /// Deletions never do: the stale cache entry simply becomes inert.
    pub fn needs_reindex(&self) -> bool {
        !matches!(self, ChangeKind::Deleted)
    }
}

/// A single file-level change between two revisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    /// Path relative to the repository root.
    pub path: String,
    /// What happened to the file.
    pub kind: ChangeKind,
}

/// Output format for command results.
///
/// # Examples
///
/// ```
/// use tessera_core::OutputFormat;
///
/// let fmt: OutputFormat = "json".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Json);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// JSON output.
    Json,
    /// Markdown output.
    Markdown,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Markdown => write!(f, "markdown"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            _ => Err(format!(
                "unknown output format: '{s}' (expected text, json, or markdown)"
            )),
        }
    }
}

/// Stable identity of a file within a repository: the path relative to
/// `root` with `/` separators. Falls back to the full path (without its
/// root component) when `path` is outside `root`.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use tessera_core::file_identity;
///
/// let id = file_identity(Path::new("/repo"), Path::new("/repo/src/lib.rs"));
/// assert_eq!(id, "src/lib.rs");
/// ```
pub fn file_identity(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_reject_out_of_range() {
        assert!(ScoreWeights::new(0.5, 0.5, 0.5, 0.5).is_ok());
        assert!(ScoreWeights::new(-0.1, 0.0, 0.0, 0.0).is_err());
        assert!(ScoreWeights::new(0.0, 0.0, 1.01, 0.0).is_err());
        assert!(ScoreWeights::new(f64::NAN, 0.0, 0.0, 0.0).is_err());
    }

    #[test]
    fn weights_deserialize_with_defaults() {
        let weights: ScoreWeights = toml::from_str("semantic = 0.9").unwrap();
        assert_eq!(weights.semantic, 0.9);
        assert_eq!(weights.incoming, 0.2);
        assert_eq!(weights.connections, 0.1);
    }

    #[test]
    fn label_boundaries_are_inclusive() {
        let t = LabelThresholds::default();
        assert_eq!(t.label(0.8), RelevanceLabel::Excellent);
        assert_eq!(t.label(0.79), RelevanceLabel::Good);
        assert_eq!(t.label(0.4), RelevanceLabel::Fair);
        assert_eq!(t.label(0.39), RelevanceLabel::Weak);
    }

    #[test]
    fn search_result_serializes_camel_case() {
        let result = SearchResult {
            source_path: "a.rs".into(),
            semantic_score: 0.5,
            graph_metrics: GraphMetrics {
                incoming_calls: 2,
                outgoing_calls: 1,
                related_count: 0,
            },
            hybrid_score: 0.4,
            relevance_label: RelevanceLabel::Fair,
            neighbors: GraphNeighbors::default(),
            preview: None,
            indexed_at: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["sourcePath"], "a.rs");
        assert_eq!(json["graphMetrics"]["incomingCalls"], 2);
        assert_eq!(json["relevanceLabel"], "fair");
        assert!(json.get("preview").is_none());
        assert!(json.get("neighbors").is_none());

        let with_names = SearchResult {
            neighbors: GraphNeighbors {
                called_by: vec!["login".into()],
                ..GraphNeighbors::default()
            },
            ..result
        };
        let json = serde_json::to_value(&with_names).unwrap();
        assert_eq!(json["neighbors"]["calledBy"][0], "login");
        assert_eq!(json["neighbors"]["callsTo"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn only_deletions_skip_reindex() {
        assert!(ChangeKind::Added.needs_reindex());
        assert!(ChangeKind::Renamed { from: "a".into() }.needs_reindex());
        assert!(ChangeKind::TypeChanged.needs_reindex());
        assert!(ChangeKind::Copied.needs_reindex());
        assert!(!ChangeKind::Deleted.needs_reindex());
    }

    #[test]
    fn output_format_parses() {
        assert_eq!("md".parse::<OutputFormat>().unwrap(), OutputFormat::Markdown);
        assert!("sarif".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn identity_outside_root_keeps_full_path() {
        let id = file_identity(Path::new("/repo"), Path::new("/elsewhere/x.rs"));
        assert_eq!(id, "elsewhere/x.rs");
    }
}
