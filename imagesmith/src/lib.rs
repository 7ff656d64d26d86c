//! # Imagesmith
//!
//! Build orchestration for reproducible, hardened golden machine images.
//!
//! One build takes a template describing a guest and drives it through a
//! fixed lifecycle:
//!
//! - **Provisioning**: serve the bootstrap document over HTTP and create the guest
//! - **Boot injection**: type the installer boot command at the guest console
//! - **Install watching**: poll until the guest's command channel answers
//! - **Remote provisioning**: run an external provisioner against the guest
//! - **Finalization**: shut the guest down, convert it to an artifact and
//!   record it in an append-only JSON manifest
//!
//! Every resource a build acquires is released exactly once, whether the
//! build succeeds, fails or is cancelled. Independent builds run
//! concurrently without sharing guests, ports or credentials.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use imagesmith::prelude::*;
//!
//! let config = TemplateLoader::new()
//!     .with_var_file("site.vars.json")
//!     .load(Path::new("rhel9-cis.json"))?;
//!
//! let report = BuildCoordinator::new()
//!     .with_event_sink(Arc::new(ConsoleEventSink::stdout()))
//!     .run(BuildJob::new(config), Arc::new(CancellationToken::new()))
//!     .await?;
//! println!("built {}", report.artifact.id);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod boot;
pub mod cancellation;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod driver;
pub mod errors;
pub mod events;
pub mod finalize;
pub mod observability;
pub mod remote;
pub mod retry;
pub mod server;
pub mod testing;
pub mod utils;
pub mod watcher;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::boot::{BootInjectionPolicy, BootInjector, BootSequence, KeyInput};
    pub use crate::cancellation::{CancellationToken, CleanupRegistry};
    pub use crate::config::{
        validate, BuildConfig, BuildTemplate, ConnectionCredentials, Redactor, TemplateLoader,
    };
    pub use crate::coordinator::{BuildCoordinator, BuildReport, ResourceScope};
    pub use crate::core::{
        Artifact, ArtifactFile, BuildEvent, BuildJob, BuildState, EventKind, StateRecord,
    };
    pub use crate::driver::{GuestDriver, GuestInstance, GuestSpec, PowerState};
    pub use crate::errors::{BuildError, BuildFailure, ConfigurationError, TeardownReport};
    pub use crate::events::{
        CollectingEventSink, ConsoleEventSink, EventSink, LoggingEventSink, NoOpEventSink,
    };
    pub use crate::finalize::{Finalizer, ManifestEntry};
    pub use crate::remote::{ChannelTarget, ProvisionerSpec, RemoteExecutor};
    pub use crate::retry::RetryConfig;
    pub use crate::server::{ArtifactServer, ServerConfig};
    pub use crate::utils::{generate_build_id, iso_timestamp};
    pub use crate::watcher::{ChannelProbe, InstallWatcher, ProbeOutcome};
}
