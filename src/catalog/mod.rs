//! Capability catalog — the canonical names a model is expected to call.
//!
//! A capability is an immutable catalog entry: a unique name, an argument
//! schema, and the derived required/optional argument lists. Alongside the
//! capabilities the catalog carries a synonym table mapping each canonical
//! name to the alias strings models emit under prompt pressure (`cat` for
//! `read_file`, and so on). Synonyms are used only for resolution, never
//! as authoritative names.
//!
//! Catalogs can be loaded from YAML files or built from the compiled-in
//! default set of workspace tools.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Argument schema
// ---------------------------------------------------------------------------

/// Schema for a single capability argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgSchema {
    /// Argument type: "string", "integer", "number", "boolean", "array", "object".
    #[serde(rename = "type")]
    pub arg_type: String,

    /// Whether this argument must be present in a well-formed call.
    #[serde(default)]
    pub required: bool,

    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

impl ArgSchema {
    /// A required argument of the given type.
    pub fn required(arg_type: &str) -> Self {
        Self {
            arg_type: arg_type.to_string(),
            required: true,
            description: None,
        }
    }

    /// An optional argument of the given type.
    pub fn optional(arg_type: &str) -> Self {
        Self {
            arg_type: arg_type.to_string(),
            required: false,
            description: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// A canonical capability entry. Names are unique within a catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// Canonical name (e.g., "read_file").
    pub name: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Argument schema keyed by argument name.
    #[serde(default)]
    pub args_schema: HashMap<String, ArgSchema>,
}

impl Capability {
    /// Create a capability with no arguments.
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            args_schema: HashMap::new(),
        }
    }

    /// Builder: add an argument to the schema.
    pub fn with_arg(mut self, name: &str, schema: ArgSchema) -> Self {
        self.args_schema.insert(name.to_string(), schema);
        self
    }

    /// Names of the required arguments, in no particular order.
    pub fn required_args(&self) -> Vec<&str> {
        self.args_schema
            .iter()
            .filter(|(_, s)| s.required)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Names of the optional arguments, in no particular order.
    pub fn optional_args(&self) -> Vec<&str> {
        self.args_schema
            .iter()
            .filter(|(_, s)| !s.required)
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// The capability catalog: an ordered list of capabilities plus the synonym
/// table. Order matters — resolution ties break to the first capability
/// encountered in catalog order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityCatalog {
    /// Capabilities in declaration order.
    pub capabilities: Vec<Capability>,

    /// Alias strings keyed by canonical capability name.
    #[serde(default)]
    pub synonyms: HashMap<String, Vec<String>>,
}

/// Wrapper for YAML deserialization (the catalog is nested under a
/// `catalog:` key).
#[derive(Debug, Deserialize)]
struct CatalogWrapper {
    catalog: CapabilityCatalog,
}

impl CapabilityCatalog {
    /// An empty catalog.
    pub fn empty() -> Self {
        Self {
            capabilities: Vec::new(),
            synonyms: HashMap::new(),
        }
    }

    /// Parse a catalog from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        let wrapper: CatalogWrapper = serde_yaml::from_str(yaml)?;
        Ok(wrapper.catalog)
    }

    /// Parse a catalog from a YAML file path.
    pub fn from_yaml_file(path: &str) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml(&content)?)
    }

    /// Look up a capability by canonical name.
    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.name == name)
    }

    /// Aliases registered for a capability, or an empty slice.
    pub fn aliases(&self, name: &str) -> &[String] {
        self.synonyms.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Builder: append a capability.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Builder: register aliases for a capability name.
    pub fn with_synonyms(mut self, name: &str, aliases: &[&str]) -> Self {
        self.synonyms.insert(
            name.to_string(),
            aliases.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    /// The compiled-in default catalog of workspace tools. This is the
    /// catalog the built-in test battery is written against.
    pub fn default_catalog() -> Self {
        DEFAULT_CATALOG.clone()
    }
}

static DEFAULT_CATALOG: Lazy<CapabilityCatalog> = Lazy::new(|| {
    CapabilityCatalog::empty()
        .with_capability(
            Capability::new("read_file", "Read the contents of a file")
                .with_arg("filepath", ArgSchema::required("string"))
                .with_arg("encoding", ArgSchema::optional("string")),
        )
        .with_synonyms("read_file", &["cat", "file_read", "open_file", "view_file"])
        .with_capability(
            Capability::new("write_file", "Write content to a file")
                .with_arg("filepath", ArgSchema::required("string"))
                .with_arg("content", ArgSchema::required("string"))
                .with_arg("append", ArgSchema::optional("boolean")),
        )
        .with_synonyms("write_file", &["file_write", "save_file", "create_file"])
        .with_capability(
            Capability::new("list_directory", "List the entries of a directory")
                .with_arg("directory", ArgSchema::required("string"))
                .with_arg("recursive", ArgSchema::optional("boolean")),
        )
        .with_synonyms("list_directory", &["ls", "dir", "list_files", "readdir"])
        .with_capability(
            Capability::new("search_code", "Search the workspace for a pattern")
                .with_arg("pattern", ArgSchema::required("string"))
                .with_arg("path", ArgSchema::optional("string"))
                .with_arg("case_sensitive", ArgSchema::optional("boolean")),
        )
        .with_synonyms("search_code", &["grep", "code_search", "find_in_files"])
        .with_capability(
            Capability::new("run_command", "Execute a shell command")
                .with_arg("command", ArgSchema::required("string"))
                .with_arg("cwd", ArgSchema::optional("string"))
                .with_arg("timeout", ArgSchema::optional("integer")),
        )
        .with_synonyms("run_command", &["exec", "shell", "bash", "execute"])
        .with_capability(
            Capability::new("http_request", "Perform an HTTP request")
                .with_arg("url", ArgSchema::required("string"))
                .with_arg("method", ArgSchema::optional("string"))
                .with_arg("body", ArgSchema::optional("object")),
        )
        .with_synonyms("http_request", &["fetch", "curl", "web_request"])
        .with_capability(
            Capability::new("git_status", "Show the working tree status")
                .with_arg("repo_path", ArgSchema::optional("string")),
        )
        .with_synonyms("git_status", &["status", "vcs_status"])
        .with_capability(
            Capability::new("ask_user", "Ask the user a clarifying question")
                .with_arg("question", ArgSchema::required("string")),
        )
        .with_synonyms("ask_user", &["clarify", "request_input", "ask"])
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_names_unique() {
        let catalog = CapabilityCatalog::default_catalog();
        let mut names: Vec<_> = catalog.capabilities.iter().map(|c| &c.name).collect();
        let before = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), before);
    }

    #[test]
    fn test_required_and_optional_args() {
        let catalog = CapabilityCatalog::default_catalog();
        let read_file = catalog.get("read_file").unwrap();
        assert_eq!(read_file.required_args(), vec!["filepath"]);
        assert_eq!(read_file.optional_args(), vec!["encoding"]);
    }

    #[test]
    fn test_aliases_lookup() {
        let catalog = CapabilityCatalog::default_catalog();
        assert!(catalog.aliases("read_file").contains(&"cat".to_string()));
        assert!(catalog.aliases("no_such_capability").is_empty());
    }

    #[test]
    fn test_parse_catalog_yaml() {
        let yaml = r#"
catalog:
  capabilities:
    - name: "deploy_service"
      description: "Deploy a service to an environment"
      args_schema:
        service:
          type: "string"
          required: true
        environment:
          type: "string"
          required: false
  synonyms:
    deploy_service:
      - "deploy"
      - "ship_it"
"#;
        let catalog = CapabilityCatalog::from_yaml(yaml).unwrap();
        assert_eq!(catalog.capabilities.len(), 1);
        let cap = catalog.get("deploy_service").unwrap();
        assert_eq!(cap.required_args(), vec!["service"]);
        assert_eq!(catalog.aliases("deploy_service"), &["deploy", "ship_it"]);
    }
}
