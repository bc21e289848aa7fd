//! Revsync Core Library
//!
//! Revision-based file replication between a publisher and its replicas:
//! - Revision model and commit-pointer storage
//! - Ref-counted publishing with expiring sessions
//! - Session token wire codec
//! - Replication client with a background update loop
//! - Atomic single-source and index/taxonomy installs

pub mod error;
pub mod directory;
pub mod source_factory;
pub mod revision;
pub mod commit;
pub mod index_revision;
pub mod session;
pub mod replicator;
pub mod handler;
pub mod index_handler;
pub mod index_and_taxonomy_handler;
pub mod update_thread;
pub mod client;
pub mod config;

pub use error::{ReplicationError, Result};
pub use directory::{Directory, FsDirectory, RamDirectory};
pub use source_factory::{PerSessionDirectoryFactory, SourceDirectoryFactory};
pub use revision::{Revision, RevisionFile, SourceFiles};
pub use commit::{CommitPoint, CommitStore};
pub use index_revision::{IndexAndTaxonomyRevision, IndexRevision, INDEX_SOURCE, TAXONOMY_SOURCE};
pub use session::SessionToken;
pub use replicator::{LocalReplicator, RefCountedRevision, Replicator, DEFAULT_SESSION_EXPIRATION_THRESHOLD};
pub use handler::{CommitCallback, CopiedFiles, InstalledState, ReplicationHandler, SourceDirectories};
pub use index_handler::IndexReplicationHandler;
pub use index_and_taxonomy_handler::IndexAndTaxonomyReplicationHandler;
pub use client::{ReplicationClient, UpdateOutcome};
pub use config::ReplicationConfig;
