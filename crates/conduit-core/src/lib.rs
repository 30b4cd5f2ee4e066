//! conduit-core: shared types for the Conduit connector control plane.
//!
//! Identity (`ConnectorId`, `WorkloadKind`), package references, the
//! connector config document, the builtin connector catalog and daemon
//! settings. No I/O beyond reading catalog and settings files.

pub mod catalog;
pub mod config;
pub mod package;
pub mod settings;
pub mod types;

pub use catalog::{CatalogError, ConfigSchema, ConnectorCatalog, ConnectorDefinition, FieldKind};
pub use config::{ConfigError, ConnectorConfig, ProcessingGuarantees, Resources};
pub use package::{PackageError, PackageInput, PackageUrl, STORED_SCHEME};
pub use settings::{DaemonSettings, SettingsError, parse_duration};
pub use types::*;
