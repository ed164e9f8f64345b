use crate::keys::generate_key_line;
use anyhow::Result;

/// Print a fresh `kid:secret` line to stdout.
/// # Errors
/// Returns an error if the kid is invalid or the OS RNG fails.
pub fn execute(kid: &str) -> Result<()> {
    let line = generate_key_line(kid)?;
    println!("{line}");
    Ok(())
}
