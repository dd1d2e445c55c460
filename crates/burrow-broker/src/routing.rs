//! Domain → agent routing table.
//!
//! The table is read from a JSON file:
//!
//! ```json
//! {
//!   "routes": {
//!     "app.example.com": { "agentId": "office", "targetPort": 8080, "description": "intranet" }
//!   }
//! }
//! ```
//!
//! Domains are matched case-insensitively.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Where requests for a domain go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub agent_id: String,
    pub target_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RoutesFile {
    #[serde(default)]
    routes: HashMap<String, Route>,
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Failed to read routes file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse routes file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Lookup and reload contract used by the gateway.
pub trait DomainRouter: Send + Sync {
    fn route_for_domain(&self, domain: &str) -> Option<Route>;

    /// Re-read the backing store. Returns the number of routes now loaded.
    fn reload(&self) -> Result<usize, RoutingError>;
}

/// [`DomainRouter`] backed by a JSON file.
pub struct FileDomainRouter {
    path: PathBuf,
    routes: RwLock<HashMap<String, Route>>,
}

impl FileDomainRouter {
    /// Load `path`. A missing file yields an empty table; a malformed one is
    /// an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RoutingError> {
        let router = Self {
            path: path.into(),
            routes: RwLock::new(HashMap::new()),
        };
        router.reload()?;
        Ok(router)
    }

    /// In-memory table, mostly for tests.
    pub fn from_routes(routes: impl IntoIterator<Item = (String, Route)>) -> Self {
        Self {
            path: PathBuf::new(),
            routes: RwLock::new(normalize(routes.into_iter().collect())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_file(&self) -> Result<Option<HashMap<String, Route>>, RoutingError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(RoutingError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let file: RoutesFile =
            serde_json::from_str(&content).map_err(|source| RoutingError::Parse {
                path: self.path.clone(),
                source,
            })?;
        Ok(Some(normalize(file.routes)))
    }
}

impl DomainRouter for FileDomainRouter {
    fn route_for_domain(&self, domain: &str) -> Option<Route> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&domain.to_ascii_lowercase())
            .cloned()
    }

    fn reload(&self) -> Result<usize, RoutingError> {
        let Some(fresh) = self.read_file()? else {
            let kept = self.len();
            warn!(
                path = %self.path.display(),
                routes = kept,
                "Routes file not found, keeping current table"
            );
            return Ok(kept);
        };
        let count = fresh.len();
        *self.routes.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        info!(path = %self.path.display(), routes = count, "Routes loaded");
        Ok(count)
    }
}

fn normalize(routes: HashMap<String, Route>) -> HashMap<String, Route> {
    routes
        .into_iter()
        .map(|(domain, route)| (domain.trim().to_ascii_lowercase(), route))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ROUTES: &str = r#"{
        "routes": {
            "App.Example.com": { "agentId": "office", "targetPort": 8080, "description": "intranet" },
            "api.example.com": { "agentId": "office", "targetPort": 9000 }
        }
    }"#;

    #[test]
    fn lookup_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.json");
        std::fs::write(&path, ROUTES).unwrap();

        let router = FileDomainRouter::load(&path).unwrap();
        assert_eq!(router.len(), 2);
        let route = router.route_for_domain("app.EXAMPLE.com").unwrap();
        assert_eq!(route.agent_id, "office");
        assert_eq!(route.target_port, 8080);
        assert_eq!(route.description.as_deref(), Some("intranet"));
        assert!(router.route_for_domain("unknown.example.com").is_none());
    }

    #[test]
    fn missing_file_starts_empty_and_keeps_table_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.json");
        let router = FileDomainRouter::load(&path).unwrap();
        assert!(router.is_empty());

        std::fs::write(&path, ROUTES).unwrap();
        assert_eq!(router.reload().unwrap(), 2);

        std::fs::remove_file(&path).unwrap();
        assert_eq!(router.reload().unwrap(), 2);
        assert!(router.route_for_domain("api.example.com").is_some());
    }

    #[test]
    fn malformed_file_is_an_error_and_keeps_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.json");
        std::fs::write(&path, ROUTES).unwrap();
        let router = FileDomainRouter::load(&path).unwrap();

        std::fs::write(&path, "{ \"routes\": [").unwrap();
        assert!(matches!(
            router.reload().unwrap_err(),
            RoutingError::Parse { .. }
        ));
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn reload_replaces_removed_routes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.json");
        std::fs::write(&path, ROUTES).unwrap();
        let router = FileDomainRouter::load(&path).unwrap();

        std::fs::write(
            &path,
            r#"{"routes":{"new.example.com":{"agentId":"lab","targetPort":80}}}"#,
        )
        .unwrap();
        assert_eq!(router.reload().unwrap(), 1);
        assert!(router.route_for_domain("api.example.com").is_none());
        assert_eq!(
            router.route_for_domain("new.example.com").unwrap().agent_id,
            "lab"
        );
    }
}
