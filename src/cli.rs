use {
  crate::{
    config::AppConfig,
    keys::{KeyError, Signer},
  },
  clap::Parser,
  std::path::{Path, PathBuf},
};

#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct CliOpts {
  #[clap(
    long,
    env = "API_CONFIG_PATH",
    default_value = "config.yml",
    help = "path to the YAML configuration file"
  )]
  pub config: PathBuf,

  #[clap(
    long,
    env = "API_SQLITE_PATH",
    default_value = "dapi.db",
    help = "path to the embedded database"
  )]
  pub db: PathBuf,

  #[clap(
    long,
    env = "NODE_CONFIG_PATH",
    help = "JSON file describing the local ML node fleet, merged on first run"
  )]
  pub node_config: Option<PathBuf>,

  #[clap(long, env = "KEY_NAME", help = "name of the signing key")]
  pub key_name: Option<String>,

  #[clap(
    long,
    env = "ACCOUNT_PUBKEY",
    help = "expected account public key, verified against the keyring"
  )]
  pub account_pubkey: Option<String>,

  #[clap(long, env = "KEYRING_BACKEND", help = "keyring backend kind")]
  pub keyring_backend: Option<String>,

  #[clap(
    long,
    env = "KEYRING_PASSWORD",
    hide_env_values = true,
    help = "passphrase for encrypted keyring backends"
  )]
  pub keyring_password: Option<String>,

  #[clap(
    short,
    long,
    parse(from_occurrences),
    help = "Use verbose output (-vv very verbose output)"
  )]
  pub verbose: u64,
}

impl CliOpts {
  /// Environment/CLI identity settings override the YAML ones.
  pub fn apply_to(&self, config: &mut AppConfig) {
    if let Some(key_name) = &self.key_name {
      config.chain_node.signer_key_name = key_name.clone();
    }
    if let Some(pubkey) = &self.account_pubkey {
      config.chain_node.account_public_key = pubkey.clone();
    }
    if let Some(backend) = &self.keyring_backend {
      config.chain_node.keyring_backend = backend.clone();
    }
  }

  /// Loads the participant signing key from the configured keyring.
  pub fn signer(&self, config: &AppConfig) -> Result<Signer, KeyError> {
    let dir = Path::new(&config.chain_node.keyring_dir);
    Signer::from_keyring(dir, &config.chain_node.signer_key_name)
  }

  /// `upgrade-info.json` lands next to the database, where the process
  /// supervisor watches for it.
  pub fn upgrade_info_path(&self) -> PathBuf {
    self
      .db
      .parent()
      .unwrap_or_else(|| Path::new("."))
      .join("upgrade-info.json")
  }
}
