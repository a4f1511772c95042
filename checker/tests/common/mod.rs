// Shared helpers for the checker integration tests
#![allow(dead_code)]

use rgfsck_checker::{AutoNo, AutoYes, CheckReport, Checker, FsImage, ImageBuilder, RepairDecision};
use rgfsck_core::{CheckOptions, ExitStatus, RepairMode};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A 256-block filesystem with 1 KiB blocks in a single region
pub fn small_image() -> FsImage {
    init_logging();
    ImageBuilder::new(1024, 256).build().expect("build image")
}

pub fn options(mode: RepairMode) -> CheckOptions {
    CheckOptions {
        repair_mode: mode,
        ..Default::default()
    }
}

pub fn run(image: &FsImage, options: CheckOptions, decisions: Box<dyn RepairDecision>) -> CheckReport {
    Checker::new(Box::new(image.device()), options)
        .with_decisions(decisions)
        .run()
        .expect("checker run")
}

/// Run with every repair accepted
pub fn repair(image: &FsImage) -> CheckReport {
    run(image, options(RepairMode::Yes), Box::new(AutoYes))
}

/// Read-only run
pub fn check(image: &FsImage) -> CheckReport {
    run(image, options(RepairMode::No), Box::new(AutoNo))
}

pub fn assert_clean(image: &FsImage) {
    let report = check(image);
    assert_eq!(report.errors_found, 0, "filesystem still inconsistent: {:?}", report);
    assert_eq!(report.status, ExitStatus::Ok);
}

/// Repairs must be complete and leave a filesystem a second run accepts
pub fn repair_fully(image: &FsImage) -> CheckReport {
    let report = repair(image);
    assert!(report.errors_found > 0, "expected damage to be found");
    assert_eq!(report.errors_found, report.errors_corrected, "{:?}", report);
    assert_eq!(report.status, ExitStatus::ErrorsCorrected);
    assert_clean(image);
    report
}
