mod config;
mod counter;
mod daemon;
mod fs_utils;
mod layout;
mod orchestrate;
mod transaction;

pub use config::{extract_config, ExtractSummary};
pub use counter::ByteCounter;
pub use daemon::{notify_daemon, DaemonNotification};
pub use layout::RootLayout;
pub use orchestrate::{
    install_packages, is_first_install, ArtifactReport, InstallOptions, InstallReport,
};
pub use transaction::{install_artifact, ArtifactOutcome};

#[cfg(test)]
mod tests;
