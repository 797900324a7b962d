mod meta;
mod package;
mod version;

pub use meta::PackageMeta;
pub use package::{split_full_name, PackageRef, DEFAULT_ARCH, KNOWN_ARCHES};
pub use version::compare_versions;
