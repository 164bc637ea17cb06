//! Threshold alarms over aggregated site series

use crate::{
    dataset::Variable,
    reduce::ReducedSeries,
    scheduler::{Aggregation, SiteResults},
};
use serde::Deserialize;

/// Maximum acceptable value per variable
///
/// Values strictly above a threshold raise an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// In °C
    pub temperature_max: f64,
    /// In m above geoid
    pub sea_surface_height_max: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            temperature_max: 15.,
            sea_surface_height_max: 1.,
        }
    }
}

impl Thresholds {
    /// Threshold for `variable`
    pub fn get(&self, variable: Variable) -> f64 {
        match variable {
            Variable::Temperature => self.temperature_max,
            Variable::SeaSurfaceHeight => self.sea_surface_height_max,
        }
    }
}

/// A threshold breach for one variable at one site
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmEvent {
    #[allow(missing_docs)]
    pub site_name: String,
    #[allow(missing_docs)]
    pub variable: Variable,
    /// Human readable description of the breach
    pub message: String,
}

/// Scan every site's series against `thresholds`
///
/// Emits at most one event per (site, variable), however many timestamps
/// exceed the threshold. Events are ordered by site in the order of
/// `results`, then temperature before sea surface height. Missing values
/// never raise an alarm, and a value equal to its threshold does not either.
pub fn evaluate(results: &SiteResults, thresholds: &Thresholds) -> Vec<AlarmEvent> {
    results
        .iter()
        .flat_map(|(site_name, series)| evaluate_site(site_name, series, thresholds))
        .collect()
}

fn evaluate_site<'a>(
    site_name: &'a str,
    series: &'a ReducedSeries,
    thresholds: &'a Thresholds,
) -> impl Iterator<Item = AlarmEvent> + 'a {
    Variable::ALL.into_iter().filter_map(move |variable| {
        let limit = thresholds.get(variable);
        let (peak, exceeding) = series
            .values(variable)
            .flatten()
            .filter(|value| *value > limit)
            .fold((f64::NEG_INFINITY, 0usize), |(peak, n), v| (peak.max(v), n + 1));

        (exceeding > 0).then(|| AlarmEvent {
            site_name: site_name.to_string(),
            variable,
            message: format!(
                "{site_name}: {variable} threshold exceeded at {exceeding} of {} timestamps (peak {peak:.2} {unit} > {limit:.2} {unit})",
                series.len(),
                unit = variable.unit(),
            ),
        })
    })
}

/// Alarm status of one site, for display
#[derive(Debug, Clone, PartialEq)]
pub enum SiteStatus {
    /// The site has no data, so nothing can be said about its thresholds
    Unavailable {
        #[allow(missing_docs)]
        site_name: String,
        /// Why there is no data
        reason: String,
    },
    /// At least one variable breached its threshold
    Alarm {
        #[allow(missing_docs)]
        site_name: String,
        #[allow(missing_docs)]
        events: Vec<AlarmEvent>,
    },
    /// Every value that was available is within thresholds
    WithinThresholds {
        #[allow(missing_docs)]
        site_name: String,
    },
}

impl SiteStatus {
    #[allow(missing_docs)]
    pub fn site_name(&self) -> &str {
        match self {
            SiteStatus::Unavailable { site_name, .. }
            | SiteStatus::Alarm { site_name, .. }
            | SiteStatus::WithinThresholds { site_name } => site_name,
        }
    }
}

/// One status per site in `site_order`, from an aggregation and the events
/// [`evaluate`] produced for it
///
/// A site with a result is an alarm if it has events, and otherwise within
/// thresholds only if its series holds at least one value. A series with no
/// values, a failed site, and a site in neither the results nor the failures
/// are all [`SiteStatus::Unavailable`], never [`SiteStatus::WithinThresholds`].
pub fn site_statuses<'a>(
    site_order: impl IntoIterator<Item = &'a str>,
    aggregation: &Aggregation,
    events: &[AlarmEvent],
) -> Vec<SiteStatus> {
    site_order
        .into_iter()
        .map(|site_name| {
            // results first: a repeated name fails, but its first occurrence may still succeed
            let Some(series) = aggregation.results.get(site_name) else {
                let reason = aggregation
                    .failures
                    .iter()
                    .find(|f| f.site_name == site_name)
                    .map_or_else(|| String::from("no result"), |f| f.error.to_string());
                return SiteStatus::Unavailable {
                    site_name: site_name.to_string(),
                    reason,
                };
            };

            let site_events: Vec<_> = events
                .iter()
                .filter(|e| e.site_name == site_name)
                .cloned()
                .collect();
            if !site_events.is_empty() {
                SiteStatus::Alarm {
                    site_name: site_name.to_string(),
                    events: site_events,
                }
            } else if !series.has_values() {
                SiteStatus::Unavailable {
                    site_name: site_name.to_string(),
                    reason: String::from("no data in window"),
                }
            } else {
                SiteStatus::WithinThresholds {
                    site_name: site_name.to_string(),
                }
            }
        })
        .collect()
}
