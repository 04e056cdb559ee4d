//! Encore App
//!
//! Unified initialization for Encore services: logging + node identity + settings.

pub mod node;

use std::fs;
use std::path::{Path, PathBuf};

use encore_ledger::LedgerError;
use encore_logging::LogLevel;
use encore_settings::{Settings, SettingsError};
use libp2p::identity::Keypair;
use libp2p::PeerId;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub use node::NodeRuntime;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Initialization failed: {0}")]
    InitError(String),
    #[error("Settings error: {0}")]
    SettingsError(#[from] SettingsError),
    #[error("Identity error: {0}")]
    Identity(String),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Application type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppType {
    Cli,
    Daemon,
    Node,
}

impl AppType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cli => "CLI",
            Self::Daemon => "Daemon",
            Self::Node => "Node",
        }
    }
}

/// Initialized application context
pub struct App<T> {
    pub service: String,
    pub app_type: AppType,
    pub keypair: Keypair,
    pub peer_id: PeerId,
    pub settings: Settings<T>,
    pub data_dir: PathBuf,
}

/// Builder for constructing an App with configurable options.
pub struct AppBuilder<T> {
    service: String,
    app_type: AppType,
    log_level: LogLevel,
    skip_logging: bool,
    skip_banner: bool,
    config_path: Option<String>,
    data_dir: Option<PathBuf>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned + Default> AppBuilder<T> {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            app_type: AppType::Cli,
            log_level: LogLevel::Info,
            skip_logging: false,
            skip_banner: false,
            config_path: None,
            data_dir: None,
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn app_type(mut self, app_type: AppType) -> Self {
        self.app_type = app_type;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.log_level = LogLevel::from_verbose(verbose);
        self
    }

    pub fn skip_logging(mut self) -> Self {
        self.skip_logging = true;
        self
    }

    pub fn skip_banner(mut self) -> Self {
        self.skip_banner = true;
        self
    }

    pub fn config_path(mut self, path: &str) -> Self {
        self.config_path = Some(path.to_string());
        self
    }

    /// Override the data directory (identity and ledger).
    pub fn data_dir(mut self, path: &Path) -> Self {
        self.data_dir = Some(path.to_path_buf());
        self
    }

    pub fn build(self) -> Result<App<T>, AppError> {
        // Initialize logging
        if !self.skip_logging {
            let _ = encore_logging::try_init(self.log_level);
        }

        let data_dir = self
            .data_dir
            .unwrap_or_else(|| encore_settings::data_dir(&self.service));

        // Load or generate the node identity
        let keypair = load_or_generate_identity(&data_dir.join("keys").join("identity.key"))?;
        let peer_id = keypair.public().to_peer_id();

        // Load or create settings
        let config_path = self.config_path.as_deref().map(encore_settings::expand_path);
        let settings = Settings::load_or_default(&self.service, config_path.as_deref())?;

        if !self.skip_banner {
            info!(
                "{} {} ({}) starting, peer id {}",
                self.service,
                env!("CARGO_PKG_VERSION"),
                self.app_type.name(),
                peer_id,
            );
        }

        Ok(App {
            service: self.service,
            app_type: self.app_type,
            keypair,
            peer_id,
            settings,
            data_dir,
        })
    }
}

/// Load the ed25519 node identity from `path`, generating and saving one if absent.
pub fn load_or_generate_identity(path: &Path) -> Result<Keypair, AppError> {
    if path.exists() {
        debug!("Loading identity from {}", path.display());
        let bytes = fs::read(path).map_err(|e| AppError::Identity(e.to_string()))?;
        return Keypair::from_protobuf_encoding(&bytes).map_err(|e| AppError::Identity(e.to_string()));
    }

    info!("Generating new identity at {}", path.display());
    let keypair = Keypair::generate_ed25519();
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(|e| AppError::Identity(e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::Identity(e.to_string()))?;
    }
    fs::write(path, bytes).map_err(|e| AppError::Identity(e.to_string()))?;
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, Default)]
    struct TestConfig {
        value: u32,
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_app_type_name() {
        assert_eq!(AppType::Cli.name(), "CLI");
        assert_eq!(AppType::Daemon.name(), "Daemon");
        assert_eq!(AppType::Node.name(), "Node");
    }

    #[test]
    fn test_app_builder() {
        let dir = temp_dir("encore-app-test");
        let config_path = dir.join("settings.json");

        let app: App<TestConfig> = AppBuilder::new("encore-app-test")
            .app_type(AppType::Daemon)
            .skip_logging()
            .skip_banner()
            .config_path(config_path.to_str().unwrap())
            .data_dir(&dir)
            .build()
            .unwrap();

        assert_eq!(app.service, "encore-app-test");
        assert_eq!(app.app_type, AppType::Daemon);
        assert_eq!(app.settings.config.value, 0);
        assert!(config_path.exists());
        assert!(dir.join("keys").join("identity.key").exists());

        // Identity survives a restart.
        let again: App<TestConfig> = AppBuilder::new("encore-app-test")
            .skip_logging()
            .skip_banner()
            .config_path(config_path.to_str().unwrap())
            .data_dir(&dir)
            .build()
            .unwrap();
        assert_eq!(again.peer_id, app.peer_id);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_identity() {
        let dir = temp_dir("encore-identity-test");
        let path = dir.join("identity.key");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&path, b"not a key").unwrap();

        assert!(matches!(
            load_or_generate_identity(&path),
            Err(AppError::Identity(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
