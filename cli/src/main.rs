use anyhow::Context;
use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use log::{error, warn};
use rgfsck_checker::{CancelState, CancelToken, CheckReport, Checker, FileDevice, LoggingProgress, PassStatus};
use rgfsck_core::{CheckOptions, ExitStatus, FsckError, RepairMode};
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rgfsck")]
#[command(about = "Check and repair an rgfs filesystem", long_about = None)]
struct Cli {
    /// Repair automatically without asking
    #[arg(short = 'p', short_alias = 'a')]
    preen: bool,
    /// Check even if the filesystem is marked clean or looks shared
    #[arg(short, long)]
    force: bool,
    /// Answer no to every question; the device is opened read-only
    #[arg(short = 'n', conflicts_with = "yes")]
    no: bool,
    /// Answer yes to every question
    #[arg(short = 'y')]
    yes: bool,
    /// More log output; repeat for more
    #[arg(short, action = ArgAction::Count)]
    verbose: u8,
    /// Less log output; repeat for less
    #[arg(short, action = ArgAction::Count, conflicts_with = "verbose")]
    quiet: u8,
    /// JSON file with check options; flags override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
    /// Block device or image file to check
    device: PathBuf,
}

impl Cli {
    fn options(&self) -> anyhow::Result<CheckOptions> {
        let mut options = match &self.config {
            Some(path) => CheckOptions::from_json_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => CheckOptions::default(),
        };
        if self.preen {
            options.preen = true;
            options.repair_mode = RepairMode::Yes;
        }
        if self.force {
            options.force = true;
        }
        if self.yes {
            options.repair_mode = RepairMode::Yes;
        }
        if self.no {
            options.repair_mode = RepairMode::No;
        }
        Ok(options)
    }

    fn log_filter(&self, options: &CheckOptions) -> String {
        let level = match (self.verbose, self.quiet) {
            (0, 0) => return options.log_level.clone().unwrap_or_else(|| "info".to_string()),
            (1, _) => "debug",
            (v, _) if v > 1 => "trace",
            (_, 1) => "warn",
            _ => "error",
        };
        level.to_string()
    }
}

fn ask_interrupt() -> CancelState {
    let stdin = std::io::stdin();
    let mut line = String::new();
    eprint!("\nInterrupted. Abort, skip the rest of this pass, or continue (a/s/c)? ");
    loop {
        let _ = std::io::stderr().flush();
        line.clear();
        match stdin.read_line(&mut line) {
            Ok(0) | Err(_) => return CancelState::Abort,
            Ok(_) => {}
        }
        match line.trim() {
            "a" | "A" => return CancelState::Abort,
            "s" | "S" => return CancelState::SkipPass,
            "c" | "C" => return CancelState::Continue,
            _ => eprint!("Please answer a, s or c: "),
        }
    }
}

async fn watch_interrupts(cancel: CancelToken) {
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        let answer = tokio::task::spawn_blocking(ask_interrupt)
            .await
            .unwrap_or(CancelState::Abort);
        match answer {
            CancelState::Continue => continue,
            CancelState::SkipPass => cancel.request(CancelState::SkipPass),
            CancelState::Abort => {
                cancel.request(CancelState::Abort);
                return;
            }
        }
    }
}

fn print_report(cli: &Cli, report: &CheckReport) -> anyhow::Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let device = cli.device.display();
    if report.skipped_clean {
        println!("{}: clean", device);
        return Ok(());
    }
    for pass in &report.passes {
        if pass.status != PassStatus::Completed {
            println!("{}: {:?}", pass.pass.name(), pass.status);
        }
    }
    println!(
        "{}: {} errors found, {} errors corrected",
        device, report.errors_found, report.errors_corrected
    );
    Ok(())
}

async fn run(cli: &Cli) -> anyhow::Result<ExitStatus> {
    let options = cli.options()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_filter(&options))).init();
    options.validate()?;

    let device = FileDevice::open(&cli.device, options.writable())
        .with_context(|| format!("Failed to open {}", cli.device.display()))?;

    let cancel = CancelToken::new();
    tokio::spawn(watch_interrupts(cancel.clone()));

    let checker = Checker::new(Box::new(device), options)
        .with_cancel_token(cancel)
        .with_progress(Box::new(LoggingProgress::new()));
    let report = tokio::task::spawn_blocking(move || checker.run())
        .await
        .context("Checker task failed")??;

    print_report(cli, &report)?;
    Ok(report.status)
}

/// Exit status for a run that ended in an error
fn failure_status(err: &anyhow::Error) -> ExitStatus {
    match err.downcast_ref::<FsckError>() {
        Some(FsckError::Usage(_)) | Some(FsckError::Configuration(_)) => ExitStatus::UsageError,
        Some(FsckError::Canceled) => ExitStatus::Canceled,
        _ => ExitStatus::FatalError,
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => ExitStatus::UsageError.code(),
            };
            std::process::exit(code);
        }
    };

    let status = match run(&cli).await {
        Ok(status) => status,
        Err(e) => {
            let status = failure_status(&e);
            if log::log_enabled!(log::Level::Error) {
                error!("{:#}", e);
            } else {
                eprintln!("Error: {:#}", e);
            }
            status
        }
    };
    if status == ExitStatus::Canceled {
        warn!("Check canceled");
    }
    std::process::exit(status.code());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yes_and_no_conflict() {
        let err = Cli::try_parse_from(["rgfsck", "-y", "-n", "disk.img"]).err();
        assert!(matches!(err.map(|e| e.kind()), Some(ErrorKind::ArgumentConflict)));
    }

    #[test]
    fn test_a_is_preen() {
        let cli = Cli::try_parse_from(["rgfsck", "-a", "disk.img"]).unwrap();
        let options = cli.options().unwrap();
        assert!(options.preen);
        assert_eq!(options.repair_mode, RepairMode::Yes);
    }

    #[test]
    fn test_preen_with_no_stays_read_only() {
        let cli = Cli::try_parse_from(["rgfsck", "-p", "-n", "disk.img"]).unwrap();
        let options = cli.options().unwrap();
        assert!(!options.writable());
    }

    #[test]
    fn test_verbosity_filter() {
        let options = CheckOptions::default();
        let cli = Cli::try_parse_from(["rgfsck", "-vv", "disk.img"]).unwrap();
        assert_eq!(cli.log_filter(&options), "trace");
        let cli = Cli::try_parse_from(["rgfsck", "-q", "disk.img"]).unwrap();
        assert_eq!(cli.log_filter(&options), "warn");
        let cli = Cli::try_parse_from(["rgfsck", "disk.img"]).unwrap();
        assert_eq!(cli.log_filter(&options), "info");
    }

    #[test]
    fn test_usage_errors_map_to_usage_status() {
        let err = anyhow::Error::from(FsckError::Usage("preen refused".to_string()));
        assert_eq!(failure_status(&err), ExitStatus::UsageError);
        let err = anyhow::Error::from(FsckError::Corrupt("bad superblock".to_string()));
        assert_eq!(failure_status(&err), ExitStatus::FatalError);
    }
}
