use crate::cli::actions::{keygen, seed_admin, server, Action};
use anyhow::Result;

/// Execute the provided action.
/// # Errors
/// Returns an error if the action fails.
pub async fn execute(action: Action) -> Result<()> {
    match action {
        Action::Server(args) => server::execute(args).await,
        Action::Keygen { kid } => keygen::execute(&kid),
        Action::SeedAdmin(args) => seed_admin::execute(args).await,
    }
}
