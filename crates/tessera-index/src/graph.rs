//! Code-graph gateway used to enrich search results.
//!
//! The graph store is optional. [`NullGraphStore`] stands in when it is
//! disabled, and every adapter reports missing data as zero metrics rather
//! than an error.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tessera_core::{GraphConfig, GraphMetrics, GraphNeighbors, TesseraError};
use tracing::debug;

/// Deepest call-chain traversal [`GraphStoreGateway::related`] accepts.
pub const MAX_RELATED_DEPTH: usize = 5;

/// Entity counts held by the graph store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphStatistics {
    /// Module nodes.
    pub modules: u64,
    /// Function nodes.
    pub functions: u64,
    /// Procedure nodes.
    pub procedures: u64,
    /// CALLS relationships.
    pub calls: u64,
}

/// Connectivity lookups by file identity.
#[async_trait]
pub trait GraphStoreGateway: Send + Sync {
    /// Metrics for `file_identity`, all zero when the graph has no data for it.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::GraphStore`] or
    /// [`TesseraError::ServiceUnavailable`] only when the store itself is
    /// unreachable or rejects the query.
    async fn metrics(&self, file_identity: &str) -> Result<GraphMetrics, TesseraError>;

    /// Up to `limit` names per list of callers, callees, and related modules.
    ///
    /// # Errors
    ///
    /// As for [`metrics`](Self::metrics).
    async fn neighbors(
        &self,
        file_identity: &str,
        limit: usize,
    ) -> Result<GraphNeighbors, TesseraError>;

    /// Files reachable from `file_identity` through at most `depth` calls in
    /// either direction, excluding the file itself. At most `limit` paths,
    /// sorted.
    ///
    /// # Errors
    ///
    /// As for [`metrics`](Self::metrics).
    async fn related(
        &self,
        file_identity: &str,
        depth: usize,
        limit: usize,
    ) -> Result<Vec<String>, TesseraError>;

    /// Entity counts for status reporting.
    ///
    /// # Errors
    ///
    /// As for [`metrics`](Self::metrics).
    async fn statistics(&self) -> Result<GraphStatistics, TesseraError>;
}

/// Graph store that knows nothing: every file has zero connectivity.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullGraphStore;

#[async_trait]
impl GraphStoreGateway for NullGraphStore {
    async fn metrics(&self, _file_identity: &str) -> Result<GraphMetrics, TesseraError> {
        Ok(GraphMetrics::default())
    }

    async fn neighbors(
        &self,
        _file_identity: &str,
        _limit: usize,
    ) -> Result<GraphNeighbors, TesseraError> {
        Ok(GraphNeighbors::default())
    }

    async fn related(
        &self,
        _file_identity: &str,
        _depth: usize,
        _limit: usize,
    ) -> Result<Vec<String>, TesseraError> {
        Ok(Vec::new())
    }

    async fn statistics(&self) -> Result<GraphStatistics, TesseraError> {
        Ok(GraphStatistics::default())
    }
}

const CALLS_QUERY: &str = "
MATCH (m:Module)
WHERE m.file_path ENDS WITH $path
OPTIONAL MATCH (m)-[:CONTAINS]->(f)
WHERE f:Function OR f:Procedure
OPTIONAL MATCH (f)<-[incoming:CALLS]-()
OPTIONAL MATCH (f)-[outgoing:CALLS]->()
RETURN count(DISTINCT incoming) AS incoming_calls,
       count(DISTINCT outgoing) AS outgoing_calls
";

const RELATED_QUERY: &str = "
MATCH (m1:Module)
WHERE m1.file_path ENDS WITH $path
MATCH (m1)-[:CONTAINS]->(f1)-[:CALLS]-(f2)<-[:CONTAINS]-(m2:Module)
WHERE m2 <> m1
RETURN count(DISTINCT m2) AS related_count
";

const CALLERS_QUERY: &str = "
MATCH (m:Module)
WHERE m.file_path ENDS WITH $path
MATCH (m)-[:CONTAINS]->(target)
MATCH (source)-[:CALLS]->(target)
RETURN DISTINCT source.name AS name
ORDER BY name
LIMIT $limit
";

const CALLEES_QUERY: &str = "
MATCH (m:Module)
WHERE m.file_path ENDS WITH $path
MATCH (m)-[:CONTAINS]->(source)
MATCH (source)-[:CALLS]->(target)
RETURN DISTINCT target.name AS name
ORDER BY name
LIMIT $limit
";

const RELATED_MODULES_QUERY: &str = "
MATCH (m1:Module)
WHERE m1.file_path ENDS WITH $path
MATCH (m1)-[:CONTAINS]->(f1)-[:CALLS]-(f2)<-[:CONTAINS]-(m2:Module)
WHERE m2 <> m1
RETURN DISTINCT m2.name AS name
ORDER BY name
LIMIT $limit
";

const STATISTICS_QUERIES: [&str; 4] = [
    "MATCH (m:Module) RETURN count(m) AS count",
    "MATCH (f:Function) RETURN count(f) AS count",
    "MATCH (p:Procedure) RETURN count(p) AS count",
    "MATCH ()-[r:CALLS]->() RETURN count(r) AS count",
];

/// Variable-length bounds cannot be query parameters, so the depth is
/// validated and spliced into the pattern.
fn related_files_query(depth: usize) -> String {
    format!(
        "
MATCH (m1:Module)
WHERE m1.file_path ENDS WITH $path
MATCH (m1)-[:CONTAINS]->(f1)
MATCH (f1)-[:CALLS*1..{depth}]-(f2)
MATCH (m2:Module)-[:CONTAINS]->(f2)
WHERE m2 <> m1 AND m2.file_path IS NOT NULL
RETURN DISTINCT m2.file_path AS path
ORDER BY path
LIMIT $limit
"
    )
}

#[derive(Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Deserialize)]
struct TxResult {
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Deserialize)]
struct TxRow {
    row: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct TxError {
    code: String,
    message: String,
}

impl TxResponse {
    fn count(&self, statement: usize, column: usize) -> u64 {
        self.results
            .get(statement)
            .and_then(|r| r.data.first())
            .and_then(|d| d.row.get(column))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
    }

    fn strings(&self, statement: usize, column: usize) -> Vec<String> {
        self.results
            .get(statement)
            .map(|r| {
                r.data
                    .iter()
                    .filter_map(|d| d.row.get(column))
                    .filter_map(serde_json::Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// [`GraphStoreGateway`] over Neo4j's HTTP transactional endpoint.
///
/// # Examples
///
/// ```
/// use tessera_core::GraphConfig;
/// use tessera_index::graph::Neo4jGraphStore;
///
/// let store = Neo4jGraphStore::with_config(&GraphConfig::default()).unwrap();
/// ```
pub struct Neo4jGraphStore {
    client: reqwest::Client,
    endpoint: String,
    user: Option<String>,
    password: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for Neo4jGraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Neo4jGraphStore")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Neo4jGraphStore {
    /// Create a client from a [`GraphConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Config`] if the HTTP client cannot be built.
    pub fn with_config(config: &GraphConfig) -> Result<Self, TesseraError> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TesseraError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/db/{}/tx/commit",
                config.url.trim_end_matches('/'),
                config.database
            ),
            user: config.user.clone(),
            password: config.password.clone(),
            timeout,
        })
    }

    async fn run(&self, statements: serde_json::Value) -> Result<TxResponse, TesseraError> {
        let body = json!({ "statements": statements });
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TesseraError::ServiceUnavailable(format!(
                    "graph query timed out after {}s",
                    self.timeout.as_secs()
                ))
            } else {
                TesseraError::GraphStore(format!("graph request failed: {e}"))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(TesseraError::GraphStore(format!(
                "graph store returned {status}"
            )));
        }

        let parsed: TxResponse = response
            .json()
            .await
            .map_err(|e| TesseraError::GraphStore(format!("failed to parse graph response: {e}")))?;
        if let Some(err) = parsed.errors.first() {
            return Err(TesseraError::GraphStore(format!(
                "{}: {}",
                err.code, err.message
            )));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl GraphStoreGateway for Neo4jGraphStore {
    async fn metrics(&self, file_identity: &str) -> Result<GraphMetrics, TesseraError> {
        let parsed = self
            .run(json!([
                { "statement": CALLS_QUERY, "parameters": { "path": file_identity } },
                { "statement": RELATED_QUERY, "parameters": { "path": file_identity } },
            ]))
            .await?;

        let metrics = GraphMetrics {
            incoming_calls: parsed.count(0, 0),
            outgoing_calls: parsed.count(0, 1),
            related_count: parsed.count(1, 0),
        };
        debug!(file = file_identity, ?metrics, "fetched graph metrics");
        Ok(metrics)
    }

    async fn neighbors(
        &self,
        file_identity: &str,
        limit: usize,
    ) -> Result<GraphNeighbors, TesseraError> {
        if limit == 0 {
            return Ok(GraphNeighbors::default());
        }
        let parameters = json!({ "path": file_identity, "limit": limit });
        let parsed = self
            .run(json!([
                { "statement": CALLERS_QUERY, "parameters": parameters },
                { "statement": CALLEES_QUERY, "parameters": parameters },
                { "statement": RELATED_MODULES_QUERY, "parameters": parameters },
            ]))
            .await?;

        Ok(GraphNeighbors {
            called_by: parsed.strings(0, 0),
            calls_to: parsed.strings(1, 0),
            related_modules: parsed.strings(2, 0),
        })
    }

    async fn related(
        &self,
        file_identity: &str,
        depth: usize,
        limit: usize,
    ) -> Result<Vec<String>, TesseraError> {
        if !(1..=MAX_RELATED_DEPTH).contains(&depth) {
            return Err(TesseraError::Config(format!(
                "related depth must be within 1..={MAX_RELATED_DEPTH}, got {depth}"
            )));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }
        let parsed = self
            .run(json!([{
                "statement": related_files_query(depth),
                "parameters": { "path": file_identity, "limit": limit },
            }]))
            .await?;
        let paths = parsed.strings(0, 0);
        debug!(file = file_identity, depth, found = paths.len(), "fetched related files");
        Ok(paths)
    }

    async fn statistics(&self) -> Result<GraphStatistics, TesseraError> {
        let statements: Vec<_> = STATISTICS_QUERIES
            .iter()
            .map(|statement| json!({ "statement": statement }))
            .collect();
        let parsed = self.run(serde_json::Value::Array(statements)).await?;
        Ok(GraphStatistics {
            modules: parsed.count(0, 0),
            functions: parsed.count(1, 0),
            procedures: parsed.count(2, 0),
            calls: parsed.count(3, 0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_store_reports_zero() {
        let metrics = NullGraphStore.metrics("src/lib.rs").await.unwrap();
        assert!(metrics.is_empty());
    }

    #[test]
    fn tx_response_extracts_counts() {
        let body = r#"{
            "results": [
                {"columns": ["incoming_calls", "outgoing_calls"], "data": [{"row": [7, 3], "meta": [null, null]}]},
                {"columns": ["related_count"], "data": [{"row": [2], "meta": [null]}]}
            ],
            "errors": []
        }"#;
        let parsed: TxResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.count(0, 0), 7);
        assert_eq!(parsed.count(0, 1), 3);
        assert_eq!(parsed.count(1, 0), 2);
    }

    #[test]
    fn missing_rows_count_as_zero() {
        let parsed: TxResponse =
            serde_json::from_str(r#"{"results": [{"data": []}], "errors": []}"#).unwrap();
        assert_eq!(parsed.count(0, 0), 0);
        assert_eq!(parsed.count(1, 0), 0);
    }

    #[tokio::test]
    async fn null_store_has_no_neighbours_or_related_files() {
        assert!(NullGraphStore.neighbors("src/lib.rs", 10).await.unwrap().is_empty());
        assert!(NullGraphStore.related("src/lib.rs", 2, 10).await.unwrap().is_empty());
        assert_eq!(
            NullGraphStore.statistics().await.unwrap(),
            GraphStatistics::default()
        );
    }

    #[test]
    fn tx_response_collects_name_columns() {
        let body = r#"{
            "results": [
                {"columns": ["name"], "data": [{"row": ["login"]}, {"row": ["logout"]}]},
                {"columns": ["name"], "data": []},
                {"columns": ["name"], "data": [{"row": ["Session"]}, {"row": [null]}]}
            ],
            "errors": []
        }"#;
        let parsed: TxResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.strings(0, 0), vec!["login", "logout"]);
        assert!(parsed.strings(1, 0).is_empty());
        assert_eq!(parsed.strings(2, 0), vec!["Session"]);
        assert!(parsed.strings(3, 0).is_empty());
    }

    #[test]
    fn related_query_splices_depth() {
        let query = related_files_query(3);
        assert!(query.contains("[:CALLS*1..3]"));
        assert!(query.contains("LIMIT $limit"));
    }

    #[tokio::test]
    async fn related_rejects_depth_out_of_range() {
        let store = Neo4jGraphStore::with_config(&GraphConfig::default()).unwrap();
        for depth in [0, MAX_RELATED_DEPTH + 1] {
            let err = store.related("src/lib.rs", depth, 10).await.unwrap_err();
            assert!(matches!(err, TesseraError::Config(_)));
        }
    }

    #[test]
    fn endpoint_includes_database() {
        let config = GraphConfig {
            url: "http://graph:7474/".into(),
            database: "code".into(),
            ..GraphConfig::default()
        };
        let store = Neo4jGraphStore::with_config(&config).unwrap();
        assert_eq!(store.endpoint, "http://graph:7474/db/code/tx/commit");
    }
}
