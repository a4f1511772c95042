// Offline consistency checker and repairer for rgfs filesystems

pub mod blockmap;
pub mod cancel;
pub mod checker;
pub mod context;
pub mod decision;
pub mod device;
pub mod dir;
pub mod dirtree;
pub mod dups;
pub mod format;
pub mod image;
pub mod init;
pub mod invalidate;
pub mod links;
pub mod lost_found;
pub mod passes;
pub mod progress;
pub mod walker;

pub use blockmap::{BlockMap, BlockTag};
pub use cancel::{CancelState, CancelToken};
pub use checker::{CheckReport, Checker, PassResult};
pub use context::FsckContext;
pub use decision::{AutoNo, AutoYes, Prompt, RepairDecision, RepairStats, Scripted};
pub use device::{BlockDevice, FileDevice, MemoryDevice};
pub use image::{FsImage, ImageBuilder};
pub use passes::{PassId, PassStatus};
pub use progress::{FnProgress, LoggingProgress, NoOpProgress, PassProgress, ProgressReporter};
