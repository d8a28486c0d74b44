//! Mandate and delegation-chain inspection.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use procura_core::CoreConfig;
use procura_core::mandate::Mandate;
use procura_core::store::SqliteStore;
use uuid::Uuid;

use super::format_ts;

#[derive(Subcommand, Debug)]
pub enum MandatesCommand {
    /// Show one mandate
    Show {
        /// Mandate id
        mandate_id: Uuid,
    },

    /// Show a mandate's delegation chain up to the root
    Chain {
        /// Leaf mandate id
        mandate_id: Uuid,
    },

    /// Show the delegation tree below a mandate
    Tree {
        /// Root mandate id
        mandate_id: Uuid,
    },

    /// List mandates held by a subject principal
    List {
        /// Subject principal id
        subject: Uuid,
    },
}

pub fn run(config: &CoreConfig, command: MandatesCommand) -> Result<()> {
    let store = Arc::new(
        SqliteStore::open(&config.store_path)
            .with_context(|| format!("opening store {}", config.store_path.display()))?,
    );

    match command {
        MandatesCommand::Show { mandate_id } => {
            let mandate = store.get_mandate(mandate_id)?;
            print_mandate(&mandate, 0);
            Ok(())
        },
        MandatesCommand::Chain { mandate_id } => {
            let chain = store.get_mandate_chain(mandate_id)?;
            for (idx, mandate) in chain.iter().enumerate() {
                println!("[{}] {}", if idx == 0 { "leaf" } else { "parent" }, mandate.mandate_id);
                print_mandate(mandate, 1);
            }
            Ok(())
        },
        MandatesCommand::Tree { mandate_id } => {
            print_tree(&store, mandate_id, 0)?;
            Ok(())
        },
        MandatesCommand::List { subject } => {
            for mandate in store.mandates_for_subject(subject)? {
                let state = if mandate.is_revoked() { "revoked" } else { "active" };
                println!(
                    "{}  depth={}  {}  [{} .. {}]",
                    mandate.mandate_id,
                    mandate.depth,
                    state,
                    format_ts(mandate.not_before_ms),
                    format_ts(mandate.not_after_ms),
                );
            }
            Ok(())
        },
    }
}

fn print_tree(store: &Arc<SqliteStore>, mandate_id: Uuid, depth: usize) -> Result<()> {
    let mandate = store.get_mandate(mandate_id)?;
    let indent = "  ".repeat(depth);
    let state = if mandate.is_revoked() { " (revoked)" } else { "" };
    println!("{indent}{}{state}", mandate.mandate_id);
    for child in store.mandate_children(mandate_id)? {
        print_tree(store, child, depth + 1)?;
    }
    Ok(())
}

fn print_mandate(mandate: &Mandate, indent: usize) {
    let pad = "  ".repeat(indent);
    println!("{pad}issuer:    {}", mandate.issuer_id);
    println!("{pad}subject:   {}", mandate.subject_id);
    println!(
        "{pad}resources: {}",
        mandate
            .resources
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("{pad}actions:   {}", mandate.actions.join(", "));
    println!(
        "{pad}validity:  {} .. {}",
        format_ts(mandate.not_before_ms),
        format_ts(mandate.not_after_ms),
    );
    println!("{pad}depth:     {}", mandate.depth);
    if let Some(parent) = mandate.parent_mandate_id {
        println!("{pad}parent:    {parent}");
    }
    if let Some(hash) = &mandate.intent_hash {
        println!("{pad}intent:    {}", hex::encode(hash));
    }
    match &mandate.revocation {
        procura_core::mandate::RevocationState::Active => {
            println!("{pad}state:     active");
        },
        procura_core::mandate::RevocationState::Revoked {
            revoked_ms,
            reason,
            revoked_by,
        } => {
            println!(
                "{pad}state:     revoked at {} by {} ({})",
                format_ts(*revoked_ms),
                revoked_by,
                reason
            );
        },
    }
}
