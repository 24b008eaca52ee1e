//! Request pipeline: resolve the window, resolve the series, fetch samples,
//! aggregate. Also the group management surface and name suggestions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::aggregator::{compute_peak, group_by_series};
use crate::cache::{CacheLoader, RefreshingCache};
use crate::clock::Clock;
use crate::directory::ServerDirectory;
use crate::error::{PeakError, Result};
use crate::metrics::QueryTimer;
use crate::models::{is_valid_group_name, Group, Outcome, PeakReport, Point, Window};
use crate::period;
use crate::resolver::{Bucket, SeriesResolver};
use crate::store::SampleStore;

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub cache_ttl: Duration,
    pub cache_refresh_margin: Duration,
    /// Load the last sample before each window so series that were only
    /// written on change still hold their value when the window opens.
    pub carry_in: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            cache_refresh_margin: Duration::from_secs(10),
            carry_in: false,
        }
    }
}

struct GroupListLoader {
    store: Arc<dyn SampleStore>,
}

#[async_trait]
impl CacheLoader<Vec<String>> for GroupListLoader {
    async fn load(&self) -> Result<Vec<String>> {
        self.store.list_groups().await
    }
}

pub struct PeakService {
    store: Arc<dyn SampleStore>,
    directory: Arc<dyn ServerDirectory>,
    resolver: SeriesResolver,
    groups: RefreshingCache<Vec<String>>,
    clock: Arc<dyn Clock>,
    carry_in: bool,
}

impl PeakService {
    pub fn new(
        store: Arc<dyn SampleStore>,
        directory: Arc<dyn ServerDirectory>,
        clock: Arc<dyn Clock>,
        options: ServiceOptions,
    ) -> Self {
        let groups = RefreshingCache::new(
            "groups",
            Arc::new(GroupListLoader { store: store.clone() }),
            clock.clone(),
            options.cache_ttl,
            options.cache_refresh_margin,
        );

        Self {
            resolver: SeriesResolver::new(store.clone(), directory.clone()),
            store,
            directory,
            groups,
            clock,
            carry_in: options.carry_in,
        }
    }

    pub fn window_for(&self, month: Option<u32>) -> Result<Window> {
        let now = period::local_time(self.clock.now_millis())?;
        period::resolve_window(month, &now)
    }

    /// Peak of a group (summed over its members) or of a single server.
    pub async fn compute_group_or_series_peak(&self, identifier: &str, month: Option<u32>) -> Result<PeakReport> {
        let timer = QueryTimer::new("show");
        let report = self.show(identifier, month).await;
        if report.is_err() {
            timer.fail();
        }
        report
    }

    /// Peaks of every group with members and of every ungrouped server that
    /// has samples in the window or carries a value into it.
    pub async fn list_peaks(&self, month: Option<u32>) -> Result<Vec<PeakReport>> {
        let timer = QueryTimer::new("list");
        let reports = self.list(month).await;
        if reports.is_err() {
            timer.fail();
        }
        reports
    }

    #[instrument(skip(self))]
    async fn show(&self, identifier: &str, month: Option<u32>) -> Result<PeakReport> {
        let window = self.window_for(month)?;
        let bucket = self.resolver.resolve(identifier).await?;
        let series = self.load_series(window, Some(&bucket.members)).await?;
        let report = aggregate(&bucket, &series, window);

        info!(
            "Peak of {} for {}: {:?}",
            identifier,
            period::format_timestamp(window.start),
            report.result
        );
        Ok(report)
    }

    #[instrument(skip(self))]
    async fn list(&self, month: Option<u32>) -> Result<Vec<PeakReport>> {
        let window = self.window_for(month)?;
        let series = self.load_series(window, None).await?;
        let memberships = self.store.memberships().await?;

        let reports = SeriesResolver::partition(&memberships, &series)
            .iter()
            .map(|bucket| aggregate(bucket, &series, window))
            .collect();

        Ok(reports)
    }

    async fn load_series(&self, window: Window, members: Option<&[String]>) -> Result<BTreeMap<String, Vec<Point>>> {
        let mut samples = if self.carry_in {
            self.store.last_samples_before(window.start, members).await?
        } else {
            Vec::new()
        };
        samples.extend(self.store.samples_in_window(window, members).await?);

        Ok(group_by_series(samples))
    }

    pub async fn list_groups(&self) -> Result<Vec<String>> {
        self.store.list_groups().await
    }

    pub async fn group_info(&self, name: &str) -> Result<Outcome<Group>> {
        validate_group_name(name)?;
        if !self.store.group_exists(name).await? {
            return Ok(Outcome::NotFound);
        }

        let members = self.store.group_members(name).await?;
        Ok(Outcome::Applied(Group {
            id: name.to_string(),
            members,
        }))
    }

    pub async fn create_group(&self, name: &str) -> Result<Outcome<()>> {
        validate_group_name(name)?;
        let outcome = self.store.create_group(name).await?;
        self.after_mutation(&outcome);
        Ok(outcome)
    }

    pub async fn delete_group(&self, name: &str) -> Result<Outcome<()>> {
        validate_group_name(name)?;
        let outcome = self.store.delete_group(name).await?;
        self.after_mutation(&outcome);
        Ok(outcome)
    }

    pub async fn add_member(&self, group: &str, server: &str) -> Result<Outcome<()>> {
        self.validate_member(group, server)?;
        let outcome = self.store.add_member(group, server).await?;
        self.after_mutation(&outcome);
        Ok(outcome)
    }

    pub async fn remove_member(&self, group: &str, server: &str) -> Result<Outcome<()>> {
        self.validate_member(group, server)?;
        let outcome = self.store.remove_member(group, server).await?;
        self.after_mutation(&outcome);
        Ok(outcome)
    }

    /// Registered servers and cached group names starting with `prefix`,
    /// ignoring case. Never waits for the group cache.
    pub fn suggest(&self, prefix: &str) -> Vec<String> {
        let mut names: BTreeSet<String> = self.directory.names().into_iter().collect();
        names.extend(self.groups.get().unwrap_or_default());
        filter_prefix(names, prefix)
    }

    pub fn suggest_groups(&self, prefix: &str) -> Vec<String> {
        filter_prefix(self.groups.get().unwrap_or_default(), prefix)
    }

    pub fn group_cache(&self) -> &RefreshingCache<Vec<String>> {
        &self.groups
    }

    fn validate_member(&self, group: &str, server: &str) -> Result<()> {
        if !self.directory.is_registered(server) {
            return Err(PeakError::UnknownIdentifier(server.to_string()));
        }
        validate_group_name(group)
    }

    fn after_mutation<T>(&self, outcome: &Outcome<T>) {
        if outcome.is_applied() {
            self.groups.invalidate();
        }
    }
}

fn validate_group_name(name: &str) -> Result<()> {
    if is_valid_group_name(name) {
        Ok(())
    } else {
        Err(PeakError::InvalidGroupName(name.to_string()))
    }
}

fn aggregate(bucket: &Bucket, series: &BTreeMap<String, Vec<Point>>, window: Window) -> PeakReport {
    let members = bucket
        .members
        .iter()
        .filter_map(|member| series.get(member).cloned());

    PeakReport {
        label: bucket.label.clone(),
        kind: bucket.kind,
        window,
        result: compute_peak(members, window),
    }
}

fn filter_prefix(names: impl IntoIterator<Item = String>, prefix: &str) -> Vec<String> {
    let prefix = prefix.to_lowercase();
    names
        .into_iter()
        .filter(|name| name.to_lowercase().starts_with(&prefix))
        .collect()
}
