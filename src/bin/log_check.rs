//! log_check - verify a detection log written by detectd
//!
//! Checks that:
//! - the header is the fixed four-column header
//! - every confidence is written with two decimals and lies in [threshold, 1]
//! - each frame's rows are adjacent and match the count they declare
//! - time buckets never go backwards, apart from wrapping past midnight

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use dronewatch::log::verify_log_with;

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "log_check", about = "Verify a dronewatch detection log")]
struct Args {
    /// Path to the detection log CSV
    #[arg(long, default_value = "detections_log.csv", env = "DRONEWATCH_LOG_PATH")]
    log: PathBuf,

    /// Lowest confidence the pipeline was configured to keep
    #[arg(long, default_value_t = 0.30)]
    threshold: f32,

    /// Print every row as it is checked
    #[arg(short, long)]
    verbose: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = ui::Ui::new(ui::UiMode::parse(&args.ui), std::io::stderr().is_terminal());

    println!("log_check: checking {}", args.log.display());
    let summary = {
        let stage = ui.stage("Verify detection log");
        verify_log_with(&args.log, args.threshold, |line, record| {
            if line % 500 == 0 {
                stage.progress(&format!("{} rows", line - 1));
            }
            if args.verbose {
                println!(
                    "  line {}: {} {} {:.2} ({} in frame)",
                    line,
                    record.time_bucket,
                    record.class_label,
                    record.confidence,
                    record.detections_in_frame
                );
            }
        })?
    };

    println!("rows: {}", summary.rows);
    println!("frames with detections: {}", summary.frames);
    match (summary.first_bucket, summary.last_bucket) {
        (Some(first), Some(last)) => println!("time span: {} .. {}", first, last),
        _ => println!("time span: empty log"),
    }
    if summary.day_rollovers > 0 {
        println!("day rollovers: {}", summary.day_rollovers);
    }
    for (class, count) in &summary.classes {
        println!("  {}: {}", class, count);
    }
    println!("OK");
    Ok(())
}
