use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Outcome, Sample, Window};

pub mod duckdb;

pub use self::duckdb::DuckDbStore;

/// Persistence for player-count samples and server groups.
///
/// A server belongs to at most one group; membership is keyed by server.
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Appends samples in one transaction and returns how many were written.
    async fn insert_samples(&self, samples: &[Sample]) -> Result<usize>;

    /// Samples with `window.start <= timestamp <= window.end`, optionally
    /// restricted to `series`, ordered by timestamp then insertion order.
    async fn samples_in_window(&self, window: Window, series: Option<&[String]>) -> Result<Vec<Sample>>;

    /// The latest sample strictly before `timestamp` for each series.
    async fn last_samples_before(&self, timestamp: i64, series: Option<&[String]>) -> Result<Vec<Sample>>;

    /// Deletes samples with `timestamp <= cutoff`. With `keep_latest`, each
    /// series keeps its latest sample at or before the cutoff when that
    /// sample holds a non-zero value, so the value it carries survives.
    async fn prune_through(&self, cutoff: i64, keep_latest: bool) -> Result<u64>;

    async fn list_groups(&self) -> Result<Vec<String>>;

    async fn group_exists(&self, id: &str) -> Result<bool>;

    async fn group_members(&self, id: &str) -> Result<Vec<String>>;

    /// Group id to member servers, for groups with at least one member.
    async fn memberships(&self) -> Result<BTreeMap<String, Vec<String>>>;

    /// `AlreadyExists` when a group with the same id ignoring ASCII case exists.
    async fn create_group(&self, id: &str) -> Result<Outcome<()>>;

    /// Removes the group and all of its memberships.
    async fn delete_group(&self, id: &str) -> Result<Outcome<()>>;

    /// Puts `series` into `group`, moving it out of any other group.
    async fn add_member(&self, group: &str, series: &str) -> Result<Outcome<()>>;

    /// `NotFound` when the group is missing or `series` is not in it.
    async fn remove_member(&self, group: &str, series: &str) -> Result<Outcome<()>>;
}
