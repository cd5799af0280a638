//! rootstrap library
//!
//! Installation orchestration engine: storage preparation, chrooted command
//! execution, package installation, system configuration and boot loader
//! setup, driven by a declarative `InstallationConfig`.

pub mod bootloader;
pub mod chroot;
pub mod command;
pub mod config_file;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod install_state;
pub mod installer;
pub mod mounts;
pub mod packages;
pub mod process_guard;
pub mod progress;
pub mod storage;
pub mod sysconfig;
pub mod types;

// Re-export main types for convenience
pub use chroot::ChrootManager;
pub use command::{CommandOutput, CommandRunner, CommandSpec, RecordingRunner, Reply, SystemRunner};
pub use config_file::{DiskPlan, InstallationConfig, PackageConfig, PartitionEntry, UserConfig};
pub use error::{InstallError, Outcome};
pub use hardware::HostPaths;
pub use install_state::{InstallStage, InstallTransitionError, StageTracker};
pub use installer::{InstallOutcome, InstallationContext, InstallationResult, Installer};
pub use process_guard::{ChildRegistry, CommandProcessGroup};
pub use progress::{CancellationToken, ProgressReporter, ProgressSink};
pub use types::{Filesystem, FirmwareMode, PartitionMethod};

// Storage engine
pub use engine::storage::{calculate_storage_plan, StorageOp, StoragePlan};
