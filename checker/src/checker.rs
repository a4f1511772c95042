// Check pipeline: load, run the passes in order, report

use crate::cancel::CancelToken;
use crate::context::FsckContext;
use crate::decision::{AutoNo, AutoYes, Prompt, RepairDecision, RepairStats};
use crate::device::BlockDevice;
use crate::format::superblock::SB_FLAG_CLEAN;
use crate::init::{block_mounters, open_context, preen_is_safe, restore_mounters};
use crate::passes::{self, PassId, PassStatus};
use crate::progress::{NoOpProgress, ProgressReporter};
use log::{error, info, warn};
use rgfsck_core::{CheckOptions, ExitStatus, FsckError, RepairMode, Result};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct PassResult {
    pub pass: PassId,
    pub status: PassStatus,
}

/// Outcome of one checker run
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub passes: Vec<PassResult>,
    pub errors_found: u64,
    pub errors_corrected: u64,
    /// The check was skipped because the filesystem is marked clean
    pub skipped_clean: bool,
    pub status: ExitStatus,
}

impl CheckReport {
    fn clean_skip() -> Self {
        Self {
            passes: Vec::new(),
            errors_found: 0,
            errors_corrected: 0,
            skipped_clean: true,
            status: ExitStatus::Ok,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status.code()
    }
}

pub struct Checker {
    device: Box<dyn BlockDevice>,
    options: CheckOptions,
    decisions: Option<Box<dyn RepairDecision>>,
    cancel: CancelToken,
    progress: Box<dyn ProgressReporter>,
}

impl Checker {
    pub fn new(device: Box<dyn BlockDevice>, options: CheckOptions) -> Self {
        Self {
            device,
            options,
            decisions: None,
            cancel: CancelToken::new(),
            progress: Box::new(NoOpProgress),
        }
    }

    /// Answer repair questions with `decisions` instead of the source the
    /// repair mode implies
    pub fn with_decisions(mut self, decisions: Box<dyn RepairDecision>) -> Self {
        self.decisions = Some(decisions);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    fn default_decisions(options: &CheckOptions) -> Box<dyn RepairDecision> {
        match options.repair_mode {
            RepairMode::Yes => Box::new(AutoYes),
            RepairMode::No => Box::new(AutoNo),
            RepairMode::Ask => Box::new(Prompt::stdio()),
        }
    }

    pub fn run(self) -> Result<CheckReport> {
        self.options.validate()?;
        let decisions = match self.decisions {
            Some(d) => d,
            None => Self::default_decisions(&self.options),
        };
        let options = self.options;
        let writable = options.writable();

        let mut ctx = open_context(self.device, options, decisions)?;
        ctx.set_cancel_token(self.cancel);
        ctx.set_progress(self.progress);

        if ctx.options.preen && !ctx.options.force {
            if !preen_is_safe(&ctx.sb) {
                return Err(FsckError::Usage(format!(
                    "lock protocol '{}' allows cluster mounts; refusing to preen without force",
                    ctx.sb.lock_proto
                )));
            }
            if ctx.sb.is_clean() {
                info!("Filesystem is clean");
                return Ok(CheckReport::clean_skip());
            }
        }

        let restore = if writable { Some(block_mounters(&mut ctx)?) } else { None };
        let outcome = run_passes(&mut ctx);

        if let Some(proto) = restore {
            let stats = ctx.stats();
            let finished = matches!(&outcome, Ok(results) if results.iter().all(|r| r.status == PassStatus::Completed));
            if finished && stats.errors_found == stats.errors_corrected {
                ctx.sb.flags |= SB_FLAG_CLEAN;
            } else {
                ctx.sb.flags &= !SB_FLAG_CLEAN;
            }
            if let Err(e) = restore_mounters(&mut ctx, proto) {
                error!("Unable to restore the lock protocol: {}", e);
                if outcome.is_ok() {
                    return Err(e);
                }
            }
            ctx.sync()?;
        }

        let passes = outcome?;
        Ok(build_report(&ctx, passes))
    }
}

fn build_report(ctx: &FsckContext, passes: Vec<PassResult>) -> CheckReport {
    let RepairStats { errors_found, errors_corrected } = ctx.stats();
    let aborted = passes.iter().any(|p| p.status == PassStatus::Aborted);
    let status = if aborted {
        ExitStatus::Canceled
    } else {
        ExitStatus::from_counts(errors_found, errors_corrected)
    };
    CheckReport {
        passes,
        errors_found,
        errors_corrected,
        skipped_clean: false,
        status,
    }
}

fn run_pass(ctx: &mut FsckContext, pass: PassId) -> Result<PassStatus> {
    match pass {
        PassId::Pass1 => passes::pass1::run(ctx),
        PassId::Pass1b => passes::pass1b::run(ctx),
        PassId::Pass2 => passes::pass2::run(ctx),
        PassId::Pass3 => passes::pass3::run(ctx),
        PassId::Pass4 => passes::pass4::run(ctx),
        PassId::Pass5 => passes::pass5::run(ctx),
    }
}

fn run_passes(ctx: &mut FsckContext) -> Result<Vec<PassResult>> {
    let mut results = Vec::with_capacity(PassId::ALL.len());
    for pass in PassId::ALL {
        info!("Starting {}: {}", pass.name(), pass.title());
        ctx.progress().pass_started(pass);
        let status = run_pass(ctx, pass)?;
        ctx.clear_skip();
        ctx.progress().pass_finished(pass, status);
        results.push(PassResult { pass, status });

        match status {
            PassStatus::Completed => info!("{} complete", pass.name()),
            PassStatus::Skipped => warn!("{} interrupted", pass.name()),
            PassStatus::Aborted => {
                warn!("{} interrupted", pass.name());
                break;
            }
        }
    }
    Ok(results)
}
