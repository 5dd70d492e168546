use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};
use serde::de::DeserializeOwned;

/// Load a configuration value from a file using the config crate.
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config<T: DeserializeOwned>(config_path: &str) -> Result<T> {
    load_config_sync(config_path)
}

/// Load a configuration value synchronously
pub fn load_config_sync<T: DeserializeOwned>(config_path: &str) -> Result<T> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml, // Default to YAML
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::models::{ClientConfig, ServerConfig};

    #[tokio::test]
    async fn test_load_yaml_server_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3000"
virtual_hosts:
  - name: "*"
    host: "127.0.0.1"
    port: 3000
    resolvers:
      - endpoints:
          - prefix: "/static"
            pattern: "/**"
            methods: ["GET"]
        static_root: "./static"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config: ServerConfig = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.virtual_hosts.len(), 1);
        assert_eq!(config.virtual_hosts[0].resolvers[0].endpoints.len(), 1);
    }

    #[tokio::test]
    async fn test_load_json_client_config() {
        let json_content = r#"
{
  "connection_limit": 4,
  "retry_budget": 2,
  "acquire_timeout": "10s",
  "request_timeout": "30s",
  "nodes": [
    { "host": "backend", "port": 8080 }
  ]
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config: ClientConfig = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.connection_limit, 4);
        assert_eq!(config.retry_budget, 2);
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.node_addresses()[0].port(), 8080);
    }
}
