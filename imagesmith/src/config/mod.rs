//! Build templates, variables, credentials and `Init` validation.

mod loader;
pub mod secrets;
pub mod template;
mod validate;
pub mod variables;

pub use loader::{BuildConfig, TemplateLoader};
pub use secrets::{ConnectionCredentials, Redactor, Secret, REDACTED};
pub use template::{
    ArtifactConfig, BootConfig, BuildTemplate, CommunicatorConfig, HttpConfig, ShutdownConfig,
    SourceConfig,
};
pub use validate::{validate, Preflight};
pub use variables::VariableSet;
