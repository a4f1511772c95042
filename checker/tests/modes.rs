// Run modes: read-only, preen, interrupts, file-backed devices

mod common;

use common::{check, init_logging, options, small_image};
use rgfsck_checker::{
    AutoNo, AutoYes, CancelState, CancelToken, Checker, FileDevice, FnProgress, ImageBuilder, PassId, PassProgress,
    PassStatus,
};
use rgfsck_core::{CheckOptions, ExitStatus, FsckError, RepairMode};
use std::collections::BTreeSet;
use std::io::Write;
use std::sync::{Arc, Mutex};

fn preen_options() -> CheckOptions {
    CheckOptions {
        preen: true,
        ..options(RepairMode::Yes)
    }
}

#[test]
fn test_read_only_run_leaves_device_untouched() {
    let mut image = small_image();
    let root = image.root();
    let file = image.create_file(root, "a", 1).unwrap();
    image.update_inode(file, |ip| ip.nlink = 4).unwrap();
    let before = image.device().snapshot().unwrap();

    let report = check(&image);
    assert_eq!(report.status, ExitStatus::ErrorsUncorrected);
    assert_eq!(report.exit_code(), 4);
    assert_eq!(report.errors_found, 1);
    assert_eq!(report.errors_corrected, 0);
    assert_eq!(image.device().snapshot().unwrap(), before);
}

#[test]
fn test_preen_refused_for_cluster_lock_protocol() {
    init_logging();
    let image = ImageBuilder::new(1024, 256).lock_proto("lock_dlm").build().unwrap();
    let before = image.device().snapshot().unwrap();

    let result = Checker::new(Box::new(image.device()), preen_options()).run();
    assert!(matches!(result, Err(FsckError::Usage(_))));
    assert_eq!(image.device().snapshot().unwrap(), before);

    let forced = CheckOptions {
        force: true,
        ..preen_options()
    };
    let report = Checker::new(Box::new(image.device()), forced).run().unwrap();
    assert_eq!(report.status, ExitStatus::Ok);
    assert_eq!(image.read_superblock().unwrap().lock_proto, "lock_dlm");
}

#[test]
fn test_preen_skips_clean_filesystem() {
    init_logging();
    let mut image = ImageBuilder::new(1024, 256).clean(true).build().unwrap();
    let root = image.root();
    let file = image.create_file(root, "a", 1).unwrap();
    image.update_inode(file, |ip| ip.nlink = 4).unwrap();

    let report = Checker::new(Box::new(image.device()), preen_options()).run().unwrap();
    assert!(report.skipped_clean);
    assert!(report.passes.is_empty());
    assert_eq!(report.status, ExitStatus::Ok);
    assert_eq!(image.inode(file).unwrap().nlink, 4);

    // Forcing checks it anyway
    let forced = CheckOptions {
        force: true,
        ..preen_options()
    };
    let report = Checker::new(Box::new(image.device()), forced).run().unwrap();
    assert!(!report.skipped_clean);
    assert_eq!(report.status, ExitStatus::ErrorsCorrected);
    assert_eq!(image.inode(file).unwrap().nlink, 1);
}

#[test]
fn test_preen_cannot_ask() {
    let image = small_image();
    let options = CheckOptions {
        preen: true,
        ..options(RepairMode::Ask)
    };
    let result = Checker::new(Box::new(image.device()), options).run();
    assert!(matches!(result, Err(FsckError::Configuration(_))));
}

#[test]
fn test_leftover_fsck_lock_protocol_restored() {
    let mut image = small_image();
    image.update_superblock(|sb| sb.lock_proto = "fsck_nolock".to_string()).unwrap();

    let report = Checker::new(Box::new(image.device()), options(RepairMode::Yes))
        .with_decisions(Box::new(AutoYes))
        .run()
        .unwrap();
    assert_eq!(report.status, ExitStatus::Ok);
    assert_eq!(image.read_superblock().unwrap().lock_proto, "lock_nolock");
}

#[test]
fn test_abort_cancels_run() {
    let mut image = small_image();
    let root = image.root();
    image.create_file(root, "a", 1).unwrap();
    let token = CancelToken::new();
    token.request(CancelState::Abort);

    let report = Checker::new(Box::new(image.device()), options(RepairMode::Yes))
        .with_decisions(Box::new(AutoYes))
        .with_cancel_token(token)
        .run()
        .unwrap();
    assert_eq!(report.status, ExitStatus::Canceled);
    assert_eq!(report.exit_code(), 32);
    assert_eq!(report.passes.len(), 1);
    assert_eq!(report.passes[0].status, PassStatus::Aborted);

    let sb = image.read_superblock().unwrap();
    assert_eq!(sb.lock_proto, "lock_nolock");
    assert!(!sb.is_clean());
}

#[test]
fn test_skip_moves_on_to_next_pass() {
    let image = small_image();
    let token = CancelToken::new();
    token.request(CancelState::SkipPass);

    let report = Checker::new(Box::new(image.device()), options(RepairMode::No))
        .with_decisions(Box::new(AutoNo))
        .with_cancel_token(token.clone())
        .run()
        .unwrap();
    assert_eq!(report.passes.len(), PassId::ALL.len());
    assert_eq!(report.passes[0].status, PassStatus::Skipped);
    assert!(report.passes[1..].iter().all(|p| p.status == PassStatus::Completed));
    assert_eq!(token.poll(), CancelState::Continue);
}

#[test]
fn test_progress_reported_for_each_pass() {
    let mut image = small_image();
    let root = image.root();
    image.mkdir(root, "d").unwrap();
    let seen: Arc<Mutex<BTreeSet<&'static str>>> = Arc::new(Mutex::new(BTreeSet::new()));
    let sink = Arc::clone(&seen);
    let progress = FnProgress::new(move |p: &PassProgress| {
        sink.lock().unwrap().insert(p.pass.name());
    });

    let report = Checker::new(Box::new(image.device()), options(RepairMode::No))
        .with_decisions(Box::new(AutoNo))
        .with_progress(Box::new(progress))
        .run()
        .unwrap();
    assert_eq!(report.status, ExitStatus::Ok);
    let seen = seen.lock().unwrap();
    for pass in ["Pass1", "Pass2", "Pass3", "Pass4", "Pass5"] {
        assert!(seen.contains(pass), "no progress from {}", pass);
    }
}

#[test]
fn test_repair_through_file_device() {
    let mut image = small_image();
    let root = image.root();
    let dir = image.mkdir(root, "d").unwrap();
    let file = image.create_file(dir, "f", 2).unwrap();
    image.update_inode(file, |ip| ip.nlink = 4).unwrap();
    image.update_inode(dir, |ip| ip.entries = 9).unwrap();

    let mut disk = tempfile::NamedTempFile::new().unwrap();
    disk.write_all(&image.device().snapshot().unwrap()).unwrap();
    disk.flush().unwrap();

    let device = FileDevice::open(disk.path(), true).unwrap();
    let report = Checker::new(Box::new(device), options(RepairMode::Yes))
        .with_decisions(Box::new(AutoYes))
        .run()
        .unwrap();
    assert_eq!(report.status, ExitStatus::ErrorsCorrected);
    assert_eq!(report.errors_found, 2);

    let device = FileDevice::open(disk.path(), false).unwrap();
    let report = Checker::new(Box::new(device), options(RepairMode::No)).run().unwrap();
    assert_eq!(report.status, ExitStatus::Ok);
}

#[test]
fn test_damaged_superblock_is_fatal() {
    let image = small_image();
    image.write_block(0, &vec![0u8; 1024]).unwrap();
    let result = Checker::new(Box::new(image.device()), options(RepairMode::No)).run();
    assert!(matches!(result, Err(FsckError::Corrupt(_))));
}
