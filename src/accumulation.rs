// 🔄 Accumulation Engine - one bounded, resumable run
//
// measure → decide → fetch → insert-if-absent → re-measure, per source, in a
// fixed order. A run never asks any source for more than the budget and never
// assumes it finishes the job: targets are reached over repeated runs.
//
// Each stage is isolated. A failing stage is recorded in the RunReport and the
// remaining stages still run.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

use crate::adapters::transit::{current_variant, next_tag, ROTATION_CURSOR};
use crate::adapters::weather::{plan_weather_slots, WEATHER_CURSOR};
use crate::adapters::{fetch_at_boundary, AdapterSet, CrimeQuery};
use crate::config::{AdapterStatus, Config};
use crate::db::{
    count_rows, get_cursor, insert_crimes, insert_transit_stops, insert_weather, known_crime_ids, set_cursor,
    Table, TableCounts,
};
use crate::linkage::{assign_default_location, crimes_pending_geocode, link_matches, release_default_locations};
use crate::seed::{seed_locations, seed_transit_stops, SeedReport};

// ============================================================================
// QUOTA POLICY
// ============================================================================

/// What to do for a source whose target is already met
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RefreshPolicy {
    Skip,
    Batch(usize),
}

impl RefreshPolicy {
    pub fn from_batch(batch: usize) -> Self {
        if batch == 0 {
            RefreshPolicy::Skip
        } else {
            RefreshPolicy::Batch(batch)
        }
    }
}

/// request = min(budget, max(0, target - current)); a met target falls back
/// to the refresh policy, still capped by the budget.
pub fn plan_request(budget: usize, target: usize, current: usize, policy: RefreshPolicy) -> usize {
    let deficit = target.saturating_sub(current);
    if deficit > 0 {
        return deficit.min(budget);
    }

    match policy {
        RefreshPolicy::Skip => 0,
        RefreshPolicy::Batch(n) => n.min(budget),
    }
}

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Crimes,
    Locations,
    Weather,
    Transit,
    Seed,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Crimes => "crimes",
            Stage::Locations => "locations",
            Stage::Weather => "weather",
            Stage::Transit => "transit",
            Stage::Seed => "seed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StageStatus {
    Ran,
    /// Nothing requested this run (target met under RefreshPolicy::Skip)
    Skipped,
    Disabled { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub requested: usize,
    /// Records the source returned. Always 0 for the synthetic seed.
    pub fetched: usize,
    /// Re-measured row delta, not the number of records handed to insert
    pub inserted: usize,
}

impl StageReport {
    fn new(stage: Stage, status: StageStatus) -> Self {
        StageReport {
            stage,
            status,
            requested: 0,
            fetched: 0,
            inserted: 0,
        }
    }

    fn ran(stage: Stage, requested: usize, fetched: usize, inserted: usize) -> Self {
        StageReport {
            stage,
            status: StageStatus::Ran,
            requested,
            fetched,
            inserted,
        }
    }
}

/// Crime ↔ location bookkeeping of the locations stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkageSummary {
    pub released: usize,
    pub geocoded: usize,
    pub defaulted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub counts_before: TableCounts,
    pub counts_after: TableCounts,
    pub stages: Vec<StageReport>,
    pub linkage: LinkageSummary,
}

impl RunReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn failed_stages(&self) -> Vec<Stage> {
        self.stages
            .iter()
            .filter(|s| matches!(s.status, StageStatus::Failed { .. }))
            .map(|s| s.stage)
            .collect()
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct AccumulationEngine {
    config: Config,
    adapters: AdapterSet,
    policy: RefreshPolicy,
}

impl AccumulationEngine {
    pub fn new(config: Config, adapters: AdapterSet) -> Self {
        let policy = RefreshPolicy::from_batch(config.refresh_batch);
        AccumulationEngine {
            config,
            adapters,
            policy,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn quota(&self, target: usize, current: usize) -> usize {
        plan_request(self.config.budget, target, current, self.policy)
    }

    /// One accumulation run: crimes → locations → weather → transit → seed
    pub fn run(&mut self, conn: &Connection) -> Result<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let counts_before = TableCounts::read(conn)?;

        log::info!(
            "🔄 Run {} started (budget {}, month {})",
            run_id,
            self.config.budget,
            self.config.target_month
        );

        let mut linkage = LinkageSummary::default();
        let mut stages = Vec::new();

        stages.push(isolate(Stage::Crimes, self.run_crimes(conn)));
        stages.push(isolate(Stage::Locations, self.run_locations(conn, &mut linkage)));
        stages.push(isolate(Stage::Weather, self.run_weather(conn)));
        stages.push(isolate(Stage::Transit, self.run_transit(conn)));
        stages.push(isolate(Stage::Seed, self.run_seed(conn)));

        for stage in &stages {
            log::info!(
                "   {:<10} {:?}: requested {}, fetched {}, inserted {}",
                stage.stage.name(),
                stage.status,
                stage.requested,
                stage.fetched,
                stage.inserted
            );
        }

        let counts_after = TableCounts::read(conn)?;
        log::info!(
            "✅ Run {} finished: crimes {}, locations {}, weather {}, transit stops {}",
            run_id,
            counts_after.crimes,
            counts_after.locations,
            counts_after.weather,
            counts_after.transit_stops
        );

        Ok(RunReport {
            run_id,
            started_at,
            counts_before,
            counts_after,
            stages,
            linkage,
        })
    }

    fn run_crimes(&mut self, conn: &Connection) -> Result<StageReport> {
        let before = count_rows(conn, Table::Crimes)?;
        let requested = self.quota(self.config.targets.crimes, before);
        if requested == 0 {
            return Ok(StageReport::new(Stage::Crimes, StageStatus::Skipped));
        }

        let query = CrimeQuery {
            area: self.config.crime_area.clone(),
            month: self.config.target_month.clone(),
            skip_ids: known_crime_ids(conn, &self.config.target_month)?,
        };
        let crimes = fetch_at_boundary(&mut self.adapters.crime, requested, &query);
        insert_crimes(conn, &crimes)?;

        let after = count_rows(conn, Table::Crimes)?;
        Ok(StageReport::ran(Stage::Crimes, requested, crimes.len(), after - before))
    }

    /// release → geocode → default assignment. The default step always runs,
    /// so every crime leaves this stage with a location.
    fn run_locations(&mut self, conn: &Connection, linkage: &mut LinkageSummary) -> Result<StageReport> {
        let before = count_rows(conn, Table::Locations)?;
        let requested = self.quota(self.config.targets.locations, before);
        let centre = self.config.crime_area.centre();

        let mut fetched = 0;
        let status = match self.adapters.geocode.as_mut() {
            None => StageStatus::Disabled {
                reason: disabled_reason(self.config.geocode_status()),
            },
            Some(_) if requested == 0 => StageStatus::Skipped,
            Some(geocoder) => {
                // Crimes never tried take the batch first; released ones fill what is left
                let mut pending = crimes_pending_geocode(conn, requested)?;
                let room = requested - pending.len();
                if self.config.targets.locations > before && room > 0 {
                    linkage.released = release_default_locations(conn, self.config.release_limit.min(room))?;
                    if linkage.released > 0 {
                        pending = crimes_pending_geocode(conn, requested)?;
                    }
                }

                let matches = fetch_at_boundary(geocoder, requested, &pending);
                fetched = matches.len();
                linkage.geocoded = link_matches(conn, &matches)?;
                StageStatus::Ran
            }
        };

        linkage.defaulted = assign_default_location(conn, centre)?;

        let after = count_rows(conn, Table::Locations)?;
        Ok(StageReport {
            stage: Stage::Locations,
            status,
            requested,
            fetched,
            inserted: after - before,
        })
    }

    fn run_weather(&mut self, conn: &Connection) -> Result<StageReport> {
        let before = count_rows(conn, Table::Weather)?;
        let requested = self.quota(self.config.targets.weather, before);
        if requested == 0 {
            return Ok(StageReport::new(Stage::Weather, StageStatus::Skipped));
        }

        let cursor = get_cursor(conn, WEATHER_CURSOR)?;
        let slots = plan_weather_slots(conn, &self.config.month_days(), requested, cursor.as_deref())?;
        let rows = fetch_at_boundary(&mut self.adapters.weather, requested, &slots);
        if let Some(last) = slots.last() {
            set_cursor(conn, WEATHER_CURSOR, &last.cursor_value())?;
        }
        insert_weather(conn, &rows)?;

        let after = count_rows(conn, Table::Weather)?;
        Ok(StageReport::ran(Stage::Weather, requested, rows.len(), after - before))
    }

    fn run_transit(&mut self, conn: &Connection) -> Result<StageReport> {
        let before = count_rows(conn, Table::TransitStops)?;
        let requested = self.quota(self.config.targets.transit_stops, before);

        let transit = match self.adapters.transit.as_mut() {
            None => {
                let reason = disabled_reason(self.config.transit_status());
                return Ok(StageReport::new(Stage::Transit, StageStatus::Disabled { reason }));
            }
            Some(_) if requested == 0 => return Ok(StageReport::new(Stage::Transit, StageStatus::Skipped)),
            Some(transit) => transit,
        };

        let cursor = get_cursor(conn, ROTATION_CURSOR)?;
        let variant = current_variant(cursor.as_deref());
        let stops = fetch_at_boundary(transit, requested, variant);
        set_cursor(conn, ROTATION_CURSOR, next_tag(variant))?;
        insert_transit_stops(conn, &stops)?;

        let after = count_rows(conn, Table::TransitStops)?;
        Ok(StageReport::ran(Stage::Transit, requested, stops.len(), after - before))
    }

    /// Synthetic top-up of whatever the real sources left short
    fn run_seed(&mut self, conn: &Connection) -> Result<StageReport> {
        if !self.config.seed_synthetic {
            return Ok(StageReport::new(Stage::Seed, StageStatus::Skipped));
        }

        let budget = self.config.budget;
        let targets = self.config.targets;

        let locations_short = targets.locations.saturating_sub(count_rows(conn, Table::Locations)?);
        let stops_short = targets.transit_stops.saturating_sub(count_rows(conn, Table::TransitStops)?);
        let requested = locations_short.min(budget) + stops_short.min(budget);

        let seeded = SeedReport {
            locations: seed_locations(conn, locations_short.min(budget))?,
            transit_stops: seed_transit_stops(conn, stops_short.min(budget))?,
        };
        log::debug!("seeded {:?}", seeded);

        // Nothing is fetched for synthetic rows
        Ok(StageReport::ran(Stage::Seed, requested, 0, seeded.locations + seeded.transit_stops))
    }
}

fn disabled_reason(status: AdapterStatus) -> String {
    match status {
        AdapterStatus::Disabled { reason } => reason,
        AdapterStatus::Enabled => "adapter not configured".to_string(),
    }
}

fn isolate(stage: Stage, result: Result<StageReport>) -> StageReport {
    result.unwrap_or_else(|e| {
        log::error!("❌ Stage {} failed: {:#}", stage.name(), e);
        StageReport::new(stage, StageStatus::Failed { error: format!("{:#}", e) })
    })
}
