//! CP-017: CLI subcommands — validate, status.
//!
//! Deploying needs a driver registry, so it is only available through the
//! library API; the binary inspects declarations and persisted state.

use crate::core::state::{FileStore, SnapshotStore};
use crate::core::types::{Snapshot, TargetKey};
use crate::core::{graph, parser};
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate compositor.yaml and print the evaluation order
    Validate {
        /// Path to compositor.yaml
        #[arg(short, long, default_value = "compositor.yaml")]
        file: PathBuf,
    },

    /// Show the persisted snapshot of a target
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Project name
        #[arg(short, long)]
        project: String,

        /// Stage name
        #[arg(short, long, default_value = "dev")]
        stage: String,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Status {
            state_dir,
            project,
            stage,
        } => cmd_status(&state_dir, &TargetKey::new(&project, &stage)),
    }
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let decl = parser::parse_declaration_file(file).map_err(|e| e.to_string())?;
    let errors = parser::validate_declaration(&decl);
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        return Err(format!("{} validation error(s)", errors.len()));
    }

    let dag = graph::build_graph(&decl.instances).map_err(|e| e.to_string())?;
    println!(
        "OK: {} ({} instances, {} edges)",
        decl.target(),
        decl.instances.len(),
        dag.edges().count()
    );
    for (i, id) in dag.order().iter().enumerate() {
        let deps = dag.providers_of(id);
        if deps.is_empty() {
            println!("  {}. {} [{}]", i + 1, id, decl.instances[id].type_name);
        } else {
            println!(
                "  {}. {} [{}] after {}",
                i + 1,
                id,
                decl.instances[id].type_name,
                deps.join(", ")
            );
        }
    }
    Ok(())
}

fn cmd_status(state_dir: &Path, target: &TargetKey) -> Result<(), String> {
    let store = FileStore::new(state_dir);
    match store.load(target).map_err(|e| e.to_string())? {
        Some(snapshot) => {
            print_snapshot(&snapshot);
            Ok(())
        }
        None => {
            println!("No state found for {}.", target);
            Ok(())
        }
    }
}

fn print_snapshot(snapshot: &Snapshot) {
    println!("Target: {}", snapshot.target);
    println!("  Generated: {}", snapshot.generated_at);
    println!("  Generator: {}", snapshot.generator);
    println!("  Instances: {}", snapshot.instances.len());
    for (id, entry) in &snapshot.instances {
        let depth = id.matches('.').count();
        let indent = "  ".repeat(depth + 2);
        let short: String = entry.fingerprint.chars().take(19).collect();
        println!("{}{} [{}] {}", indent, id, entry.type_name, short);
    }
}
