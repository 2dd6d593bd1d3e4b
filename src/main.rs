use anyhow::{Context, Result};
use env_logger::Env;
use rusqlite::Connection;

use crime_weather::{
    export_csv, run_analysis, run_backfill, setup_database, AccumulationEngine, AdapterSet, Config, StageStatus,
};

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    log::info!("🗄️  crime-weather {} - accumulation run", crime_weather::VERSION);

    let config = Config::from_env().context("Invalid configuration")?;

    // 1. Setup database (+ backfill anything older runs left behind)
    let conn = Connection::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    setup_database(&conn)?;
    run_backfill(&conn)?;
    log::info!("✓ Database ready: {}", config.db_path.display());

    // 2. Accumulate
    let export_dir = config.export_dir.clone();
    let adapters = AdapterSet::from_config(&config).context("Failed to build HTTP clients")?;
    let mut engine = AccumulationEngine::new(config, adapters);
    let report = engine.run(&conn)?;

    for stage in &report.stages {
        if let StageStatus::Failed { error } = &stage.status {
            log::warn!("⚠️  {} did not complete this run: {}", stage.stage.name(), error);
        }
    }

    // 3. Analysis (failure here never undoes the accumulation)
    match run_analysis(&conn) {
        Ok(analysis) => {
            if let Some(dir) = export_dir {
                if let Err(e) = export_csv(&analysis, &dir) {
                    log::error!("❌ CSV export failed: {:#}", e);
                }
            }
        }
        Err(e) => log::error!("❌ Analysis failed: {:#}", e),
    }

    let targets = engine.config().targets;
    let counts = report.counts_after;
    log::info!(
        "🎯 Progress: crimes {}/{}, locations {}/{}, weather {}/{}, transit stops {}/{}",
        counts.crimes,
        targets.crimes,
        counts.locations,
        targets.locations,
        counts.weather,
        targets.weather,
        counts.transit_stops,
        targets.transit_stops
    );

    Ok(())
}
