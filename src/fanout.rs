//! Day-by-day parallel replay.
//!
//! Long periods are split into calendar days. Each day is replayed by its
//! own [`CorrelationEngine`] on tokio's blocking pool; workers share only the
//! read-only [`DocumentStore`] and hand back their merged map when done.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ArchiveConfig;
use crate::correlation::{CorrelationEngine, RelaySnapshot};
use crate::store::DocumentStore;
use crate::util::{days_between, floor_to_hour, normalize_fingerprint};
use crate::Error;

/// The merged relays of one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayResult {
    /// Midnight of the day.
    pub day: DateTime<Utc>,
    /// Relays seen that day, keyed by fingerprint.
    pub relays: BTreeMap<String, RelaySnapshot>,
}

/// Fingerprints picked from a set of day results.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Selection {
    /// The snapshot from the latest day each fingerprint was seen in.
    pub found: BTreeMap<String, RelaySnapshot>,
    /// Requested fingerprints seen on no day.
    pub missing: BTreeSet<String>,
    /// Requested values that are not fingerprints at all, as given.
    pub invalid: BTreeSet<String>,
}

/// Replays `[start, end]` one calendar day at a time, one worker per day.
///
/// Day windows do not overlap: the first starts at `start`'s hour, the last
/// ends at `end`, and the ones in between cover midnight to 23:00.
///
/// # Errors
///
/// - [`Error::InvalidConfig`] if `config` is inconsistent.
/// - [`Error::OutOfRange`] if `[start, end]` leaves the configured timespan.
/// - [`Error::Worker`] if a worker panicked.
/// - Any error a worker's replay returned.
pub async fn correlate_by_day(
    config: &ArchiveConfig,
    store: Arc<dyn DocumentStore>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<DayResult>, Error> {
    config.validate()?;
    if !config.covers(start, end) {
        let requested = if start < config.start || start > end { start } else { end };
        return Err(Error::OutOfRange {
            requested,
            start: config.start,
            end: config.end,
        });
    }

    let mut workers = JoinSet::new();
    for day in days_between(start, end) {
        let window_start = std::cmp::max(day, floor_to_hour(start));
        let window_end = std::cmp::min(day + TimeDelta::hours(23), end);
        let day_config = config.for_window(window_start, window_end)?;
        let store = Arc::clone(&store);

        debug!(%window_start, %window_end, "spawning day worker");
        workers.spawn_blocking(move || -> Result<DayResult, Error> {
            let mut engine = CorrelationEngine::from_config(&day_config, store)?;
            let relays = engine.correlate(window_start, window_end)?;
            Ok(DayResult { day, relays })
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = workers.join_next().await {
        let result = joined.map_err(|e| Error::Worker(e.to_string()))??;
        results.push(result);
    }
    results.sort_by_key(|result| result.day);

    info!(days = results.len(), "replayed days");
    Ok(results)
}

/// For each fingerprint, the snapshot from the latest day that lists it.
///
/// Fingerprints are compared case-insensitively and may carry a `$`
/// prefix. Values that are not 40 hex digits land in
/// [`Selection::invalid`].
pub fn latest_for_fingerprints<I, S>(days: &[DayResult], fingerprints: I) -> Selection
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut selection = Selection::default();
    for requested in fingerprints {
        let Some(fingerprint) = normalize_fingerprint(requested.as_ref()) else {
            warn!(fingerprint = requested.as_ref(), "ignoring malformed fingerprint");
            selection.invalid.insert(requested.as_ref().to_string());
            continue;
        };
        let latest = days
            .iter()
            .filter_map(|day| day.relays.get(&fingerprint).map(|relay| (day.day, relay)))
            .max_by_key(|(day, _)| *day);

        match latest {
            Some((_, relay)) => {
                selection.found.insert(fingerprint, relay.clone());
            }
            None => {
                selection.missing.insert(fingerprint);
            }
        }
    }
    selection
}
