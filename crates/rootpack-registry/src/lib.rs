mod config;
mod resolve;
mod source;

pub use config::{load_repository_config, parse_repository_config, RepositoryConfig, RepositoryEntry};
pub use resolve::{resolve_metadata, ResolveError, ResolvedMetadata};
pub use source::{
    image_artifact_path, meta_artifact_path, ArtifactReader, Repository, RepositoryLocation,
    RepositorySet,
};
