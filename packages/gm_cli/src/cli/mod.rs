pub mod account;
pub mod session;
pub mod status;
pub mod watch;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use gm_link::{CredentialStore, FileCredentialStore, LinkConfig, LinkSession};
use tracing::debug;

const DATA_DIR_NAME: &str = ".gm_link";

/// Data directory plus what is loaded from it once per invocation.
pub struct Workspace {
    data_dir: PathBuf,
    config: LinkConfig,
    store: Arc<FileCredentialStore>,
}

impl Workspace {
    pub fn open(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = LinkConfig::load(&data_dir).context("Failed to load configuration")?;
        let store = FileCredentialStore::open(&data_dir).context("Failed to open credential store")?;
        debug!(data_dir = %data_dir.display(), base_url = %config.api.base_url, "workspace ready");

        Ok(Self {
            data_dir,
            config,
            store: Arc::new(store),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn credentials_path(&self) -> &Path {
        self.store.path()
    }

    /// A session wired to the network transports. Nothing connects until
    /// [`LinkSession::run`] is called.
    pub fn session(&self) -> Result<LinkSession> {
        let store: Arc<dyn CredentialStore> = self.store.clone();
        LinkSession::open(&self.config, store).context("Failed to set up session client")
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(DATA_DIR_NAME))
}

/// Use `given`, or read one line from stdin.
pub fn password_or_prompt(given: Option<String>) -> Result<String> {
    if let Some(password) = given {
        return Ok(password);
    }
    eprint!("Password: ");
    read_password(std::io::stdin().lock())
}

fn read_password(mut input: impl BufRead) -> Result<String> {
    let mut line = String::new();
    input.read_line(&mut line).context("Failed to read password")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("Password must not be empty");
    }
    Ok(password)
}
