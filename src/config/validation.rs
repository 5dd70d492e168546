use std::net::SocketAddr;

use eyre::Result;
use regex::Regex;

use crate::config::models::{ClientConfig, ServerConfig, VirtualHostConfig};
use crate::core::routing::WILDCARD_NAME;

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    /// The server must refuse to start without a default host
    #[error("No default host configured: register a virtual host named \"*\"")]
    NoDefaultHost,

    #[error("Host conflict detected: {message}")]
    HostConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator, run at startup before any listener binds.
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.virtual_hosts.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "virtual_hosts".to_string(),
            });
        } else {
            for host in &config.virtual_hosts {
                if let Err(mut host_errors) = Self::validate_virtual_host(host) {
                    errors.append(&mut host_errors);
                }
            }

            if let Err(e) = Self::check_default_host(&config.virtual_hosts) {
                errors.push(e);
            }
            if let Err(mut conflicts) = Self::check_name_conflicts(&config.virtual_hosts) {
                errors.append(&mut conflicts);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate client pool configuration
    pub fn validate_client(config: &ClientConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.connection_limit == 0 {
            errors.push(ValidationError::InvalidField {
                field: "connection_limit".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if config.retry_budget == 0 {
            errors.push(ValidationError::InvalidField {
                field: "retry_budget".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        for node in &config.nodes {
            if node.host.is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: "nodes.host".to_string(),
                    message: "Node host cannot be empty".to_string(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_virtual_host(host: &VirtualHostConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if host.name.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "virtual_hosts.name".to_string(),
            });
        } else if host.name != WILDCARD_NAME
            && let Err(e) = Self::validate_host_name(&host.name, "name")
        {
            errors.push(e);
        }

        for alias in &host.aliases {
            if let Err(e) = Self::validate_host_name(alias, "aliases") {
                errors.push(e);
            }
        }

        // A secure host needs loadable TLS material before it can serve.
        if host.secure {
            match &host.tls {
                None => errors.push(ValidationError::InvalidTls {
                    message: format!(
                        "Host '{}' has a secure address but no TLS configuration",
                        host.name
                    ),
                }),
                Some(tls) => {
                    if !std::path::Path::new(&tls.cert_path).exists() {
                        errors.push(ValidationError::InvalidTls {
                            message: format!("Certificate file does not exist: {}", tls.cert_path),
                        });
                    }
                    if !std::path::Path::new(&tls.key_path).exists() {
                        errors.push(ValidationError::InvalidTls {
                            message: format!("Private key file does not exist: {}", tls.key_path),
                        });
                    }
                }
            }
        }

        for resolver in &host.resolvers {
            if resolver.endpoints.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("host '{}' resolver endpoints", host.name),
                });
            }
            for endpoint in &resolver.endpoints {
                if !endpoint.prefix.starts_with('/') {
                    errors.push(ValidationError::InvalidField {
                        field: format!("endpoint prefix: {}", endpoint.prefix),
                        message: "Endpoint prefixes must start with '/'".to_string(),
                    });
                }
            }
            if resolver.dispatcher.is_some() == resolver.static_root.is_some() {
                errors.push(ValidationError::InvalidField {
                    field: format!("host '{}' resolver", host.name),
                    message: "Exactly one of 'dispatcher' or 'static_root' is required".to_string(),
                });
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn check_default_host(hosts: &[VirtualHostConfig]) -> ValidationResult<()> {
        if hosts.iter().any(|host| host.name == WILDCARD_NAME) {
            Ok(())
        } else {
            Err(ValidationError::NoDefaultHost)
        }
    }

    fn check_name_conflicts(hosts: &[VirtualHostConfig]) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut seen: Vec<String> = Vec::new();

        for host in hosts {
            for name in std::iter::once(&host.name).chain(host.aliases.iter()) {
                let normalized = name.to_lowercase();
                if seen.contains(&normalized) {
                    errors.push(ValidationError::HostConflict {
                        message: format!("Name '{name}' is registered more than once"),
                    });
                } else {
                    seen.push(normalized);
                }
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Validate host name format
    fn validate_host_name(name: &str, field: &str) -> ValidationResult<()> {
        if name.contains("://") {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                message:
                    "Host names should not contain a protocol (use 'example.com', not 'http://example.com')"
                        .to_string(),
            });
        }

        let hostname_regex = Regex::new(
            r"^[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?)*$",
        )
        .expect("invalid hostname regex");

        if !hostname_regex.is_match(name) {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("Invalid hostname format: '{name}'"),
            });
        }

        Ok(())
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
