use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use std::{env, fs};

use anyhow::Result;
use chrono::DateTime;
use env_logger::Builder;
use log::{LevelFilter, debug, error, info};

use metassembly_pipelines::cli::{parse, Arguments};
use metassembly_pipelines::config::defs::RunConfig;
use metassembly_pipelines::pipelines::meta_assembly;
use metassembly_pipelines::utils::system::{compute_max_parallel, detect_cores_and_load};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n MetAssembly\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}\n", dir);

    let max_parallel = match args.max_parallel {
        Some(n) => n,
        None => {
            let (physical_cores, cpu_load) = detect_cores_and_load().await;
            let n = compute_max_parallel(physical_cores, cpu_load, args.threads);
            debug!(
                "Detected {} physical cores; CPU load {}%; running up to {} stages at once with {} threads each",
                physical_cores, cpu_load, n, args.threads
            );
            n
        }
    };

    let out_dir = setup_output_dir(&args, &dir)?;
    info!("Publishing to {}", out_dir.display());

    let run_config = match RunConfig::from_args(args, dir, out_dir, max_parallel) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
            std::process::exit(1);
        }
    };

    match meta_assembly::run(run_config).await {
        Ok(report) => {
            info!("Summary: {}", report.summary_csv.display());
            match &report.merged_gtf {
                Some(gtf) => info!("Merged assembly: {}", gtf.display()),
                None => info!("Merged assembly: none, no sample reached assembly"),
            }
            info!("Tool versions: {}", report.versions.display());
            if !report.dropped.is_empty() {
                info!("Dropped by the quality gate: {}", report.dropped.join(", "));
            }
        }
        Err(e) => {
            error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
            std::process::exit(1);
        }
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


/// Sets up output directory
/// If `out_dir` is specified from args, uses it;
/// otherwise, creates a directory named `metassembly_YYYYMMDD`.
/// Ensures the directory exists.
///
/// # Arguments
/// * `args` - The parsed command-line arguments.
/// * `cwd` - The current working directory.
/// # Returns
/// path to the output directory.
fn setup_output_dir(args: &Arguments, cwd: &Path) -> Result<PathBuf> {
    let out_dir = match &args.out_dir {
        Some(out) => {
            let path = PathBuf::from(out);
            if path.is_absolute() {
                path
            } else {
                cwd.join(path)
            }
        }
        None => {
            let timestamp = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .ok()
                .and_then(|d| DateTime::from_timestamp(d.as_secs() as i64, 0))
                .map(|dt| dt.format("%Y%m%d").to_string())
                .unwrap_or_else(|| "19700101".to_string());
            cwd.join(format!("metassembly_{}", timestamp))
        }
    };
    fs::create_dir_all(&out_dir)?;
    Ok(out_dir)
}
