#![forbid(unsafe_code)]

//! Maintenance worker for the tracing store: drains the spatial-update queue
//! into dirty cell marks, refreshes stale cache cells, and exposes the
//! offline rebuild and history commands for operators.

use nr_core::geom::Point3;
use nr_storage::SqliteStore;
use serde::Serialize;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug)]
struct WorkerConfig {
    storage_dir: PathBuf,
    project_id: i64,
    poll_ms: u64,
    batch: usize,
    once: bool,
}

#[derive(Debug, Serialize)]
struct WatchTick {
    ts: String,
    project_id: i64,
    updates_drained: usize,
    cells_marked: usize,
    cells_refreshed: usize,
}

fn usage() -> &'static str {
    "nr_worker — maintenance worker for the neurite tracing store\n\n\
USAGE:\n\
  nr_worker COMMAND [--storage-dir DIR] [--project ID] [OPTIONS]\n\n\
COMMANDS:\n\
  watch               drain spatial updates and refresh dirty cells in a loop\n\
                      [--poll-ms MS] [--batch N] [--once]\n\
  rebuild-edges       recompute all materialized edges of the project\n\
  rebuild-summaries   recompute all skeleton summaries of the project\n\
  warm-cache          build cache cells covering a box\n\
                      --grid ID --min X,Y,Z --max X,Y,Z\n\
  refresh-dirty       rebuild dirty cache cells --grid ID [--batch N]\n\
  history             toggle history tracking: history on|off\n\
  truncate-history    drop shadow rows: --before-ms T\n\
  check               run the startup consistency check and report\n\n\
NOTES:\n\
  - NR_STORAGE_DIR and NR_PROJECT_ID are honored as defaults.\n\
  - watch exits after one pass with --once; otherwise it polls forever.\n"
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn ts() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "-".to_string())
}

fn log(message: &str) {
    eprintln!("[{}] {message}", ts());
}

fn parse_point(raw: &str) -> Result<Point3, String> {
    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("expected X,Y,Z, got '{raw}'"));
    }
    let mut v = [0.0f64; 3];
    for (slot, part) in v.iter_mut().zip(&parts) {
        *slot = part
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("'{part}' is not a number"))?;
    }
    Ok(Point3::new(v[0], v[1], v[2]))
}

struct ParsedArgs {
    command: String,
    config: WorkerConfig,
    grid_id: Option<i64>,
    min: Option<Point3>,
    max: Option<Point3>,
    before_ms: Option<i64>,
    toggle: Option<String>,
}

fn parse_args() -> Result<ParsedArgs, String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty() || args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", usage());
        std::process::exit(if args.is_empty() { 2 } else { 0 });
    }

    let command = args[0].clone();
    let mut storage_dir: Option<PathBuf> = env_var("NR_STORAGE_DIR").map(PathBuf::from);
    let mut project_id: i64 = env_var("NR_PROJECT_ID")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut poll_ms: u64 = 1000;
    let mut batch: usize = 200;
    let mut once = false;
    let mut grid_id: Option<i64> = None;
    let mut min: Option<Point3> = None;
    let mut max: Option<Point3> = None;
    let mut before_ms: Option<i64> = None;
    let mut toggle: Option<String> = None;

    let mut i = 1usize;
    while i < args.len() {
        let a = args[i].as_str();
        match a {
            "--storage-dir" => {
                i += 1;
                let v = args.get(i).ok_or("--storage-dir requires DIR")?;
                storage_dir = Some(PathBuf::from(v));
            }
            "--project" => {
                i += 1;
                let v = args.get(i).ok_or("--project requires ID")?;
                project_id = v
                    .parse::<i64>()
                    .map_err(|_| "--project must be an integer id")?;
            }
            "--poll-ms" => {
                i += 1;
                let v = args.get(i).ok_or("--poll-ms requires MS")?;
                poll_ms = v
                    .parse::<u64>()
                    .map_err(|_| "--poll-ms must be an integer (milliseconds)")?;
            }
            "--batch" => {
                i += 1;
                let v = args.get(i).ok_or("--batch requires N")?;
                batch = v
                    .parse::<usize>()
                    .map_err(|_| "--batch must be a positive integer")?;
            }
            "--once" => once = true,
            "--grid" => {
                i += 1;
                let v = args.get(i).ok_or("--grid requires ID")?;
                grid_id = Some(
                    v.parse::<i64>()
                        .map_err(|_| "--grid must be an integer id")?,
                );
            }
            "--min" => {
                i += 1;
                let v = args.get(i).ok_or("--min requires X,Y,Z")?;
                min = Some(parse_point(v)?);
            }
            "--max" => {
                i += 1;
                let v = args.get(i).ok_or("--max requires X,Y,Z")?;
                max = Some(parse_point(v)?);
            }
            "--before-ms" => {
                i += 1;
                let v = args.get(i).ok_or("--before-ms requires T")?;
                before_ms = Some(
                    v.parse::<i64>()
                        .map_err(|_| "--before-ms must be an integer timestamp")?,
                );
            }
            "on" | "off" if command == "history" => toggle = Some(a.to_string()),
            other => return Err(format!("unknown argument '{other}'\n\n{}", usage())),
        }
        i += 1;
    }

    let storage_dir = storage_dir.ok_or("--storage-dir (or NR_STORAGE_DIR) is required")?;
    Ok(ParsedArgs {
        command,
        config: WorkerConfig {
            storage_dir,
            project_id,
            poll_ms,
            batch,
            once,
        },
        grid_id,
        min,
        max,
        before_ms,
        toggle,
    })
}

fn require_project(config: &WorkerConfig) -> Result<i64, String> {
    if config.project_id <= 0 {
        return Err("--project (or NR_PROJECT_ID) is required".to_string());
    }
    Ok(config.project_id)
}

fn watch(store: &mut SqliteStore, config: &WorkerConfig) -> Result<(), String> {
    let project_id = require_project(config)?;
    loop {
        let drained = store
            .process_spatial_updates(project_id, config.batch)
            .map_err(|e| e.to_string())?;
        let mut cells_refreshed = 0usize;
        for grid in store
            .list_grid_caches(project_id)
            .map_err(|e| e.to_string())?
        {
            if store.dirty_cell_count(grid.id).map_err(|e| e.to_string())? > 0 {
                cells_refreshed += store
                    .refresh_dirty_cells(grid.id, config.batch)
                    .map_err(|e| e.to_string())?;
            }
        }

        if drained.updates_drained > 0 || cells_refreshed > 0 {
            let tick = WatchTick {
                ts: ts(),
                project_id,
                updates_drained: drained.updates_drained,
                cells_marked: drained.cells_marked,
                cells_refreshed,
            };
            match serde_json::to_string(&tick) {
                Ok(line) => eprintln!("{line}"),
                Err(e) => log(&format!("tick serialization failed: {e}")),
            }
        }
        if config.once {
            return Ok(());
        }
        if drained.updates_drained == 0 && cells_refreshed == 0 {
            sleep(Duration::from_millis(config.poll_ms));
        }
    }
}

fn run(parsed: ParsedArgs) -> Result<(), String> {
    let mut store = SqliteStore::open(&parsed.config.storage_dir).map_err(|e| e.to_string())?;

    match parsed.command.as_str() {
        "watch" => watch(&mut store, &parsed.config),
        "rebuild-edges" => {
            let project_id = require_project(&parsed.config)?;
            let report = store.rebuild_edges(project_id).map_err(|e| e.to_string())?;
            log(&format!(
                "edges rebuilt: treenode {} -> {}, connector {} -> {}",
                report.treenode_edges_before,
                report.treenode_edges_after,
                report.connector_edges_before,
                report.connector_edges_after,
            ));
            Ok(())
        }
        "rebuild-summaries" => {
            let project_id = require_project(&parsed.config)?;
            let report = store
                .rebuild_skeleton_summaries(project_id)
                .map_err(|e| e.to_string())?;
            log(&format!(
                "summaries rebuilt: {} -> {}",
                report.summaries_before, report.summaries_after,
            ));
            Ok(())
        }
        "warm-cache" => {
            let grid_id = parsed.grid_id.ok_or("--grid is required")?;
            let min = parsed.min.ok_or("--min is required")?;
            let max = parsed.max.ok_or("--max is required")?;
            let written = store
                .warm_grid_cache(grid_id, min, max)
                .map_err(|e| e.to_string())?;
            log(&format!("warmed {written} cells of grid {grid_id}"));
            Ok(())
        }
        "refresh-dirty" => {
            let grid_id = parsed.grid_id.ok_or("--grid is required")?;
            let refreshed = store
                .refresh_dirty_cells(grid_id, parsed.config.batch)
                .map_err(|e| e.to_string())?;
            log(&format!("refreshed {refreshed} cells of grid {grid_id}"));
            Ok(())
        }
        "history" => {
            let toggle = parsed.toggle.ok_or("history requires on|off")?;
            let changed = if toggle == "on" {
                store.enable_history_tracking().map_err(|e| e.to_string())?
            } else {
                store.disable_history_tracking().map_err(|e| e.to_string())?
            };
            log(&format!(
                "history tracking {toggle} ({})",
                if changed { "changed" } else { "already set" }
            ));
            Ok(())
        }
        "truncate-history" => {
            let before_ms = parsed.before_ms.ok_or("--before-ms is required")?;
            let removed = store
                .truncate_history(before_ms)
                .map_err(|e| e.to_string())?;
            log(&format!("removed {removed} shadow rows"));
            Ok(())
        }
        "check" => {
            let report = store.startup_check().map_err(|e| e.to_string())?;
            for repair in &report.repairs {
                log(&format!("repaired: {repair}"));
            }
            for warning in &report.warnings {
                log(&format!("warning: {warning}"));
            }
            if report.is_clean() {
                log("store is clean");
            }
            Ok(())
        }
        other => Err(format!("unknown command '{other}'\n\n{}", usage())),
    }
}

fn main() {
    let parsed = match parse_args() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };
    if let Err(e) = run(parsed) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
