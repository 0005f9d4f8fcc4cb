#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The `crewd` command line: migrations, seeding, backups, and the server
//! itself.

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use tracing::info;

use crew_auth::Role;
use crew_auth::UserCreate;
use crew_metrics::MetricsSink;
use crew_server::ServerConfig;
use crew_store::SessionMode;
use crew_store::Store;

#[derive(Debug, Parser)]
#[command(name = "crewd", about = "Crew ledger server and tooling")]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending schema migrations.
    Migrate {
        #[command(subcommand)]
        direction: MigrateDirection,
    },

    /// Seed initial records.
    Seed {
        #[command(subcommand)]
        target: SeedTarget,
    },

    /// Create or restore database backups.
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Run the HTTP server (the default).
    Serve,
}

#[derive(Debug, Subcommand)]
enum MigrateDirection {
    /// Migrations are forward-only; `up` applies everything pending.
    Up,
}

#[derive(Debug, Subcommand)]
enum SeedTarget {
    /// Create the first administrator and the default bot menu.
    Admin {
        /// Login name for the administrator.
        #[arg(long = "name", value_name = "NAME")]
        name: String,

        /// Web password. At least one of password/PIN must be given.
        #[arg(long = "password", value_name = "PASSWORD")]
        password: Option<String>,

        /// Bot PIN code.
        #[arg(long = "pin", value_name = "PIN")]
        pin: Option<String>,

        /// Telegram account to bind.
        #[arg(long = "telegram-id", value_name = "TELEGRAM_ID")]
        telegram_id: Option<i64>,
    },
}

#[derive(Debug, Subcommand)]
enum BackupAction {
    /// Copy the live database and append the manifest line.
    Create,
    /// Restore a backup file after verifying its manifest checksum.
    Restore {
        /// File name inside the backups directory.
        #[arg(value_name = "FILE")]
        file: String,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = ServerConfig::from_env()?;
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => crew_server::serve(config).await,
        Command::Migrate {
            direction: MigrateDirection::Up,
        } => {
            let store = Store::open(&config.db_path)?;
            let applied = store.migrate()?;
            info!(applied, head = store.migration_head()?, "migrations done");
            Ok(())
        }
        Command::Seed {
            target:
                SeedTarget::Admin {
                    name,
                    password,
                    pin,
                    telegram_id,
                },
        } => seed_admin(&config, name, password, pin, telegram_id),
        Command::Backup { action } => {
            let store = Store::open(&config.db_path)?;
            match action {
                BackupAction::Create => {
                    let entry = crew_backup::create(&store, &config.backups_dir)?;
                    info!(file = %entry.file, sha256 = %entry.sha256, "backup created");
                    Ok(())
                }
                BackupAction::Restore { file } => {
                    crew_backup::restore(&store, &config.backups_dir, &file)?;
                    info!(file, "backup restored");
                    Ok(())
                }
            }
        }
    }
}

fn seed_admin(
    config: &ServerConfig,
    name: String,
    password: Option<String>,
    pin: Option<String>,
    telegram_id: Option<i64>,
) -> Result<()> {
    if password.is_none() && pin.is_none() {
        anyhow::bail!("seed admin needs --password or --pin");
    }
    let store = Store::open(&config.db_path)?;
    store.migrate()?;
    let metrics = Arc::new(MetricsSink::new(config.metrics_dir.clone()));
    let mut auth = crew_auth::AuthConfig::new(config.jwt_secret.clone(), config.admin_secret.clone());
    auth.access_ttl_secs = config.access_ttl_secs;
    auth.refresh_ttl_secs = config.refresh_ttl_secs;

    let mut session = store.session(SessionMode::ReadWrite, metrics)?;
    let user = crew_auth::users::create(
        &mut session,
        &auth,
        "seed",
        UserCreate {
            name,
            telegram_id,
            role: Role::Admin,
            daily_rate: None,
            password,
            pin_code: pin,
        },
    )
    .context("seeding admin user")?;
    crew_worklog::botmenu::seed_defaults(&mut session)?;
    session.commit()?;
    info!(user_id = user.id, name = %user.name, "admin seeded");
    Ok(())
}
