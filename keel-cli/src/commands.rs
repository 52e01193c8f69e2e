//! Migration command implementations

use std::num::NonZeroUsize;
use std::path::Path;

use chrono::Utc;
use color_eyre::eyre::{Result, WrapErr};
use keel::migrate::scaffold;
use keel::{Database, MigrationOutcome, MigrationResult, Migrator};

use crate::{Cli, Command};

/// Runs the selected command. Returns `false` if a migration failed.
pub async fn execute(cli: Cli) -> Result<bool> {
    if let Command::Create { name } = &cli.command {
        create(&cli.migrations_dir, name)?;
        return Ok(true);
    }

    let db = Database::connect(&cli.database_url)
        .await
        .wrap_err_with(|| format!("Failed to open database {}", cli.database_url))?;
    let migrator = Migrator::new(db.pool().clone(), &cli.migrations_dir);

    let all_ok = match cli.command {
        Command::Up { steps } => up(&migrator, steps).await?,
        Command::Down { steps } => down(&migrator, steps).await?,
        Command::Status => {
            status(&migrator).await?;
            true
        }
        Command::Create { .. } => true,
    };

    db.close().await;
    Ok(all_ok)
}

async fn up(migrator: &Migrator, steps: Option<NonZeroUsize>) -> Result<bool> {
    let results = migrator
        .up(steps.map(NonZeroUsize::get))
        .await
        .wrap_err("Failed to apply migrations")?;

    if results.is_empty() {
        println!("No pending migrations");
        return Ok(true);
    }
    Ok(print_results(&results))
}

async fn down(migrator: &Migrator, steps: usize) -> Result<bool> {
    let results = migrator
        .down(steps)
        .await
        .wrap_err("Failed to roll back migrations")?;

    if results.is_empty() {
        println!("No migrations to rollback");
        return Ok(true);
    }
    Ok(print_results(&results))
}

fn print_results(results: &[MigrationResult]) -> bool {
    for result in results {
        match &result.outcome {
            MigrationOutcome::Applied => println!("✓ {}", result.name),
            MigrationOutcome::RolledBack => println!("↩ {}", result.name),
            MigrationOutcome::Failed(error) => println!("✗ {}: {error}", result.name),
        }
    }
    !results.iter().any(MigrationResult::is_failed)
}

async fn status(migrator: &Migrator) -> Result<()> {
    let statuses = migrator
        .status()
        .await
        .wrap_err("Failed to read migration status")?;
    let orphaned = migrator
        .orphaned()
        .await
        .wrap_err("Failed to read migration status")?;

    if statuses.is_empty() && orphaned.is_empty() {
        println!("No migrations found");
        return Ok(());
    }

    for status in &statuses {
        let drift = if status.checksum_match {
            ""
        } else {
            " (checksum mismatch!)"
        };
        match status.applied_at {
            Some(applied_at) => println!(
                "✓ {} - applied {}{drift}",
                status.name,
                applied_at.to_rfc3339()
            ),
            None => println!("○ {} - pending{drift}", status.name),
        }
    }
    for record in &orphaned {
        println!(
            "! {} - applied {} (file missing)",
            record.name,
            record.applied_at.to_rfc3339()
        );
    }

    Ok(())
}

fn create(migrations_dir: &Path, name: &str) -> Result<()> {
    let path = scaffold(migrations_dir, name, Utc::now()).wrap_err("Failed to create migration")?;
    println!(
        "Created {}",
        path.file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
    );
    Ok(())
}
