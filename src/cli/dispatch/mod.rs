//! Map validated CLI arguments to an [`Action`].

use crate::cli::actions::{seed_admin, server::Args, Action};
use crate::cli::commands::{self, auth, limits};
use anyhow::{Context, Result};
use std::time::Duration;

/// Map validated CLI matches to an action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    if let Some(keygen) = matches.subcommand_matches(commands::CMD_KEYGEN) {
        let kid = keygen
            .get_one::<String>(commands::ARG_KID)
            .cloned()
            .context("missing required argument: <kid>")?;
        return Ok(Action::Keygen { kid });
    }

    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;
    let seconds = |name: &str, default: u64| {
        Duration::from_secs(matches.get_one::<u64>(name).copied().unwrap_or(default))
    };

    if let Some(seed) = matches.subcommand_matches(commands::CMD_SEED_ADMIN) {
        let email = seed
            .get_one::<String>(commands::ARG_EMAIL)
            .cloned()
            .context("missing required argument: <email>")?;
        return Ok(Action::SeedAdmin(seed_admin::Args {
            dsn,
            db_timeout: seconds("db-timeout-seconds", 3),
            email,
        }));
    }

    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);

    Ok(Action::Server(Args {
        port,
        dsn,
        db_timeout: seconds("db-timeout-seconds", 3),
        idempotency_retention: seconds("idempotency-retention-seconds", 86_400),
        sweep_interval: seconds("sweep-interval-seconds", 60),
        auth: auth::Options::parse(matches)?,
        limits: limits::Options::parse(matches)?,
    }))
}
