pub mod backups;
pub mod log_analysis;
pub mod process;
pub mod recovery;
pub mod transfer;
pub mod watcher;

pub use process::{ensure_target_idle, ProcessInspector, SystemInspector};
pub use recovery::{run_recovery, NativeDialogPrompt, SelfRelauncher};
pub use transfer::{cleanup_staging, TransferPipeline};
pub use watcher::{AlertPrompt, InstanceLock, RecoveryLauncher, Watcher, WatcherState};
