//! Loads a template file into a resolved [`BuildConfig`].

use super::secrets::{ConnectionCredentials, Redactor};
use super::template::BuildTemplate;
use super::variables::VariableSet;
use crate::errors::ConfigurationError;
use crate::finalize::ManifestConfig;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// A template with every variable resolved, ready for one build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Identifier of the build this configuration belongs to.
    pub build_id: Uuid,
    /// The template file it came from.
    pub template_path: PathBuf,
    /// The resolved template.
    pub template: BuildTemplate,
    /// Scrubs this build's sensitive values from text.
    pub redactor: Redactor,
}

impl BuildConfig {
    /// Credentials for the command channel.
    #[must_use]
    pub fn credentials(&self) -> ConnectionCredentials {
        let c = &self.template.source.communicator;
        ConnectionCredentials {
            username: c.username.clone(),
            password: c.password.clone(),
            private_key_file: c.private_key_file.clone(),
        }
    }

    /// Full path of the bootstrap document.
    #[must_use]
    pub fn bootstrap_path(&self) -> PathBuf {
        let http = &self.template.source.http;
        http.directory.join(&http.bootstrap_document)
    }

    /// The manifest file, if one is configured.
    #[must_use]
    pub fn manifest_path(&self) -> Option<&Path> {
        self.template.manifest.as_ref().map(|m| m.path.as_path())
    }
}

/// Collects variable sources and loads templates.
///
/// Precedence, lowest first: template defaults, var files in the order
/// given, `KEY=VALUE` assignments, the credentials file.
#[derive(Debug, Clone, Default)]
pub struct TemplateLoader {
    var_files: Vec<PathBuf>,
    assignments: Vec<String>,
    credentials_file: Option<PathBuf>,
    manifest_override: Option<PathBuf>,
}

impl TemplateLoader {
    /// Creates a loader with no overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a JSON variable file.
    #[must_use]
    pub fn with_var_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.var_files.push(path.into());
        self
    }

    /// Adds a `KEY=VALUE` assignment.
    #[must_use]
    pub fn with_var(mut self, assignment: impl Into<String>) -> Self {
        self.assignments.push(assignment.into());
        self
    }

    /// Sets the vault-style credentials file. All of its values are sensitive.
    #[must_use]
    pub fn with_credentials_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_file = Some(path.into());
        self
    }

    /// Records artifacts in `path` regardless of the template's manifest block.
    #[must_use]
    pub fn with_manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_override = Some(path.into());
        self
    }

    /// Loads `path` under a fresh build identifier.
    pub fn load(&self, path: &Path) -> Result<BuildConfig, ConfigurationError> {
        self.load_with_id(path, crate::utils::generate_build_id())
    }

    /// Loads `path` under the given build identifier.
    pub fn load_with_id(&self, path: &Path, build_id: Uuid) -> Result<BuildConfig, ConfigurationError> {
        let field = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::new(format!("cannot read template: {e}")).with_field(&field)
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|e| {
            ConfigurationError::new(format!("template is not valid JSON: {e}")).with_field(&field)
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let mut config = self.load_value(value, &base_dir, build_id)?;
        config.template_path = path.to_path_buf();
        Ok(config)
    }

    /// Resolves an already parsed template. Relative paths are taken from `base_dir`.
    pub fn load_value(
        &self,
        value: Value,
        base_dir: &Path,
        build_id: Uuid,
    ) -> Result<BuildConfig, ConfigurationError> {
        let Value::Object(mut document) = value else {
            return Err(ConfigurationError::new("template must be a JSON object"));
        };

        let declared = match document.remove("variables") {
            Some(Value::Object(map)) => map,
            None | Some(Value::Null) => Map::new(),
            Some(_) => {
                return Err(ConfigurationError::new("variables must be an object")
                    .with_field("variables"))
            }
        };
        let sensitive: Vec<String> = match document.remove("sensitive_variables") {
            Some(v) => serde_json::from_value(v).map_err(|e| {
                ConfigurationError::new(format!("sensitive_variables: {e}"))
                    .with_field("sensitive_variables")
            })?,
            None => Vec::new(),
        };

        let mut vars = VariableSet::from_template(&declared, &sensitive);
        for file in &self.var_files {
            vars.merge_file(file, false)?;
        }
        for assignment in &self.assignments {
            vars.set_assignment(assignment)?;
        }
        if let Some(ref creds) = self.credentials_file {
            vars.merge_file(creds, true)?;
        }
        vars.ensure_complete()?;

        let redactor = vars.redactor();
        let resolved = vars.interpolate(Value::Object(document), build_id)?;
        let mut template: BuildTemplate = serde_json::from_value(resolved).map_err(|e| {
            ConfigurationError::new(format!("invalid template: {}", redactor.redact(&e.to_string())))
        })?;
        template.variables = declared;
        template.sensitive_variables = sensitive;
        let redactor = match template.source.communicator.password {
            Some(ref password) => redactor.with_secret(password),
            None => redactor,
        };

        if let Some(ref path) = self.manifest_override {
            match template.manifest {
                Some(ref mut manifest) => manifest.path.clone_from(path),
                None => template.manifest = Some(ManifestConfig::new(path.clone())),
            }
        }
        resolve_paths(&mut template, base_dir);

        debug!(
            build_id = %build_id,
            guest = %template.source.guest_name,
            sensitive_values = redactor.len(),
            "Template resolved"
        );

        Ok(BuildConfig {
            build_id,
            template_path: base_dir.join("template.json"),
            template,
            redactor,
        })
    }
}

fn resolve_paths(template: &mut BuildTemplate, base: &Path) {
    let join = |p: &mut PathBuf| {
        if p.is_relative() {
            *p = base.join(&*p);
        }
    };

    join(&mut template.source.http.directory);
    if let Some(ref mut key) = template.source.communicator.private_key_file {
        join(key);
    }
    if let Some(ref mut dir) = template.source.artifact.output_directory {
        join(dir);
    }
    if let Some(ref mut dir) = template.provisioner.working_dir {
        join(dir);
    }
    if let Some(ref mut manifest) = template.manifest {
        join(&mut manifest.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBuild;
    use serde_json::json;

    #[test]
    fn test_load_resolves_variables_and_paths() {
        let fixture = TestBuild::new();
        let config = TemplateLoader::new()
            .with_var("guest_name=rhel9-cli")
            .load(&fixture.template_path())
            .unwrap();

        assert_eq!(config.template.source.guest_name, "rhel9-cli");
        assert!(config.template.source.http.directory.is_absolute());
        assert!(config.bootstrap_path().ends_with("http/ks.cfg"));
        assert_eq!(config.template_path, fixture.template_path());
    }

    #[test]
    fn test_credentials_file_overrides_and_redacts() {
        let fixture = TestBuild::new();
        let creds = fixture.dir().join("creds.json");
        std::fs::write(&creds, r#"{"ssh_password": "Vault-Pa55"}"#).unwrap();

        let config = TemplateLoader::new()
            .with_var("ssh_password=cli-pass")
            .with_credentials_file(&creds)
            .load(&fixture.template_path())
            .unwrap();

        let password = config.credentials().password.unwrap();
        assert_eq!(password.expose(), "Vault-Pa55");
        assert_eq!(config.redactor.redact("Vault-Pa55"), "<sensitive>");
    }

    #[test]
    fn test_missing_required_variable_fails() {
        let fixture = TestBuild::new();
        let raw = json!({
            "variables": {"ssh_password": null},
            "source": {}
        });
        let err = TemplateLoader::new()
            .load_value(raw, fixture.dir(), Uuid::nil())
            .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("variables.ssh_password"));
    }

    #[test]
    fn test_schema_error_is_redacted() {
        let fixture = TestBuild::new();
        let mut raw = fixture.template_value();
        raw["variables"]["ssh_port"] = json!("Sup3rS3cret");
        raw["sensitive_variables"] = json!(["ssh_port", "ssh_password"]);
        raw["source"]["communicator"]["port"] = json!("${var.ssh_port}");

        let err = TemplateLoader::new()
            .load_value(raw, fixture.dir(), Uuid::nil())
            .unwrap_err();
        assert!(!err.message.contains("Sup3rS3cret"), "{}", err.message);
    }

    #[test]
    fn test_manifest_override() {
        let fixture = TestBuild::new();
        let config = TemplateLoader::new()
            .with_manifest("out/manifest.json")
            .load(&fixture.template_path())
            .unwrap();
        let path = config.manifest_path().unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("out/manifest.json"));
    }

    #[test]
    fn test_unreadable_template() {
        let err = TemplateLoader::new()
            .load(Path::new("/nonexistent/template.json"))
            .unwrap_err();
        assert!(err.message.contains("cannot read template"));
    }
}
