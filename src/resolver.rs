use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::directory::ServerDirectory;
use crate::error::{PeakError, Result};
use crate::models::{Point, ReportKind};
use crate::store::SampleStore;

/// The series to sum for one report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub label: String,
    pub kind: ReportKind,
    pub members: Vec<String>,
}

impl Bucket {
    pub fn server(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            kind: ReportKind::Server,
            members: vec![name],
        }
    }

    pub fn group(id: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            label: id.into(),
            kind: ReportKind::Group,
            members,
        }
    }
}

/// Maps user-supplied names onto the series to aggregate.
#[derive(Clone)]
pub struct SeriesResolver {
    store: Arc<dyn SampleStore>,
    directory: Arc<dyn ServerDirectory>,
}

impl SeriesResolver {
    pub fn new(store: Arc<dyn SampleStore>, directory: Arc<dyn ServerDirectory>) -> Self {
        Self { store, directory }
    }

    /// A group id resolves to the group's current members, otherwise a
    /// registered server resolves to itself.
    pub async fn resolve(&self, identifier: &str) -> Result<Bucket> {
        if self.store.group_exists(identifier).await? {
            let members = self.store.group_members(identifier).await?;
            debug!("Resolved group {} to {} servers", identifier, members.len());
            return Ok(Bucket::group(identifier, members));
        }

        if self.directory.is_registered(identifier) {
            return Ok(Bucket::server(identifier));
        }

        Err(PeakError::UnknownIdentifier(identifier.to_string()))
    }

    /// One bucket per group with members, sorted by group id, followed by one
    /// bucket per series in `sampled` that belongs to no group.
    pub fn partition(
        memberships: &BTreeMap<String, Vec<String>>,
        sampled: &BTreeMap<String, Vec<Point>>,
    ) -> Vec<Bucket> {
        let grouped: BTreeSet<&str> = memberships.values().flatten().map(String::as_str).collect();

        let mut buckets: Vec<Bucket> = memberships
            .iter()
            .map(|(id, members)| Bucket::group(id.clone(), members.clone()))
            .collect();
        buckets.extend(
            sampled
                .keys()
                .filter(|series| !grouped.contains(series.as_str()))
                .map(|series| Bucket::server(series.clone())),
        );

        buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::store::DuckDbStore;
    use pretty_assertions::assert_eq;

    async fn resolver() -> SeriesResolver {
        let store = Arc::new(DuckDbStore::open_in_memory().unwrap());
        store.create_group("survival").await.unwrap();
        store.add_member("survival", "s1").await.unwrap();
        store.add_member("survival", "s2").await.unwrap();

        let directory = Arc::new(InMemoryDirectory::with_servers(["lobby", "s1", "s2"]));
        SeriesResolver::new(store, directory)
    }

    #[tokio::test]
    async fn test_resolve_group() {
        let bucket = resolver().await.resolve("survival").await.unwrap();
        assert_eq!(bucket, Bucket::group("survival", vec!["s1".into(), "s2".into()]));
    }

    #[tokio::test]
    async fn test_resolve_server() {
        let bucket = resolver().await.resolve("lobby").await.unwrap();
        assert_eq!(bucket, Bucket::server("lobby"));
    }

    #[tokio::test]
    async fn test_resolve_unknown() {
        let err = resolver().await.resolve("nether").await.unwrap_err();
        assert!(matches!(err, PeakError::UnknownIdentifier(name) if name == "nether"));
    }

    #[test]
    fn test_partition() {
        let mut memberships = BTreeMap::new();
        memberships.insert("pvp".to_string(), vec!["p1".to_string()]);
        memberships.insert("main".to_string(), vec!["m1".to_string(), "m2".to_string()]);

        let mut sampled = BTreeMap::new();
        for series in ["p1", "m1", "lobby", "hub"] {
            sampled.insert(series.to_string(), vec![Point::new(1, 1)]);
        }

        let buckets = SeriesResolver::partition(&memberships, &sampled);
        let labels: Vec<(&str, ReportKind)> =
            buckets.iter().map(|b| (b.label.as_str(), b.kind)).collect();
        assert_eq!(
            labels,
            vec![
                ("main", ReportKind::Group),
                ("pvp", ReportKind::Group),
                ("hub", ReportKind::Server),
                ("lobby", ReportKind::Server),
            ]
        );
        assert_eq!(buckets[0].members, vec!["m1", "m2"]);
    }
}
