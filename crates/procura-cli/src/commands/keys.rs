//! Key management commands.

use anyhow::{Context, Result};
use clap::Subcommand;
use procura_core::CoreConfig;
use procura_core::crypto::KeyManager;
use uuid::Uuid;

#[derive(Subcommand, Debug)]
pub enum KeysCommand {
    /// Generate and store a keypair for a principal
    Generate {
        /// Principal id (defaults to a fresh UUID)
        #[arg(long)]
        principal: Option<Uuid>,
    },

    /// Print the public key of a principal
    Show {
        /// Principal id
        principal: Uuid,
    },
}

pub fn run(config: &CoreConfig, command: KeysCommand) -> Result<()> {
    let keys = KeyManager::new(&config.keys_dir)
        .with_context(|| format!("opening key directory {}", config.keys_dir.display()))?;

    match command {
        KeysCommand::Generate { principal } => {
            let principal_id = principal.unwrap_or_else(Uuid::new_v4);
            let signer = keys
                .generate_keypair(principal_id)
                .context("generating keypair")?;
            println!("principal: {principal_id}");
            println!("public_key: {}", hex::encode(signer.public_key_bytes()));
            Ok(())
        },
        KeysCommand::Show { principal } => {
            let stored = keys.get_keypair(principal).context("loading keypair")?;
            println!("principal: {principal}");
            println!("public_key: {}", hex::encode(stored.public_key_bytes()));
            Ok(())
        },
    }
}
