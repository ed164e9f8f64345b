use anyhow::{anyhow, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;
use std::time::Duration;

pub const ARG_JWT_KEYS: &str = "jwt-keys";
pub const ARG_JWT_SECRET: &str = "jwt-secret";
pub const ARG_JWT_CURRENT_KID: &str = "jwt-current-kid";
pub const ARG_JWT_FALLBACK_KID: &str = "jwt-fallback-kid";
pub const ARG_JWT_ISSUER: &str = "jwt-issuer";
pub const ARG_JWT_AUDIENCE: &str = "jwt-audience";
pub const ARG_ACCESS_TTL_SECONDS: &str = "access-ttl-seconds";
pub const ARG_REFRESH_TTL_SECONDS: &str = "refresh-ttl-seconds";
pub const ARG_CLOCK_SKEW_SECONDS: &str = "clock-skew-seconds";
pub const ARG_FAILED_LOGIN_DELAY_MS: &str = "failed-login-delay-ms";
pub const ARG_ADMIN_REVOKE_TTL_SECONDS: &str = "admin-revoke-ttl-seconds";

/// Kid used for the single secret given through `--jwt-secret`.
pub const LEGACY_KID: &str = "default";

#[derive(Debug)]
pub struct Options {
    /// `kid:secret,kid:secret`.
    pub keys: SecretString,
    pub current_kid: Option<String>,
    pub fallback_kid: Option<String>,
    pub issuer: String,
    pub audience: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub clock_skew: Duration,
    pub failed_login_delay: Duration,
    pub admin_revoke_ttl: Duration,
}

impl Options {
    /// Extract signing and lifetime options.
    ///
    /// # Errors
    /// Returns an error if no signing key is configured.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let keys = match (
            matches.get_one::<String>(ARG_JWT_KEYS),
            matches.get_one::<String>(ARG_JWT_SECRET),
        ) {
            (Some(keys), _) => keys.clone(),
            (None, Some(secret)) => format!("{LEGACY_KID}:{secret}"),
            (None, None) => {
                return Err(anyhow!(
                    "missing required argument: --{ARG_JWT_KEYS} or --{ARG_JWT_SECRET}"
                ))
            }
        };

        let seconds = |name: &str, default: u64| {
            Duration::from_secs(matches.get_one::<u64>(name).copied().unwrap_or(default))
        };

        Ok(Self {
            keys: SecretString::from(keys),
            current_kid: matches.get_one::<String>(ARG_JWT_CURRENT_KID).cloned(),
            fallback_kid: matches.get_one::<String>(ARG_JWT_FALLBACK_KID).cloned(),
            issuer: matches
                .get_one::<String>(ARG_JWT_ISSUER)
                .cloned()
                .unwrap_or_else(|| "warden".to_string()),
            audience: matches
                .get_one::<String>(ARG_JWT_AUDIENCE)
                .cloned()
                .unwrap_or_else(|| "warden-api".to_string()),
            access_ttl: seconds(ARG_ACCESS_TTL_SECONDS, 900),
            refresh_ttl: seconds(ARG_REFRESH_TTL_SECONDS, 2_592_000),
            clock_skew: seconds(ARG_CLOCK_SKEW_SECONDS, 0),
            failed_login_delay: Duration::from_millis(
                matches
                    .get_one::<u64>(ARG_FAILED_LOGIN_DELAY_MS)
                    .copied()
                    .unwrap_or(250),
            ),
            admin_revoke_ttl: seconds(ARG_ADMIN_REVOKE_TTL_SECONDS, 3600),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_key_args(command);
    with_lifetime_args(command)
}

fn with_key_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_JWT_KEYS)
                .long(ARG_JWT_KEYS)
                .help("Signing keys as kid:secret pairs, comma separated")
                .long_help(
                    "Signing keys as kid:secret pairs, comma separated. Secrets must be at \
                     least 32 bytes; generate one with `warden keygen <kid>`.",
                )
                .env("WARDEN_JWT_KEYS")
                .hide_env_values(true)
                .conflicts_with(ARG_JWT_SECRET),
        )
        .arg(
            Arg::new(ARG_JWT_SECRET)
                .long(ARG_JWT_SECRET)
                .help("Single signing secret, registered under kid 'default'")
                .env("WARDEN_JWT_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_JWT_CURRENT_KID)
                .long(ARG_JWT_CURRENT_KID)
                .help("Kid used to sign new tokens (required with several keys)")
                .env("WARDEN_JWT_CURRENT_KID"),
        )
        .arg(
            Arg::new(ARG_JWT_FALLBACK_KID)
                .long(ARG_JWT_FALLBACK_KID)
                .help("Kid used to verify tokens that carry no kid header")
                .env("WARDEN_JWT_FALLBACK_KID"),
        )
        .arg(
            Arg::new(ARG_JWT_ISSUER)
                .long(ARG_JWT_ISSUER)
                .help("Token issuer (iss)")
                .env("WARDEN_JWT_ISSUER")
                .default_value("warden"),
        )
        .arg(
            Arg::new(ARG_JWT_AUDIENCE)
                .long(ARG_JWT_AUDIENCE)
                .help("Token audience (aud)")
                .env("WARDEN_JWT_AUDIENCE")
                .default_value("warden-api"),
        )
}

fn with_lifetime_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ACCESS_TTL_SECONDS)
                .long(ARG_ACCESS_TTL_SECONDS)
                .help("Access token lifetime in seconds")
                .env("WARDEN_ACCESS_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TTL_SECONDS)
                .long(ARG_REFRESH_TTL_SECONDS)
                .help("Refresh token lifetime in seconds")
                .env("WARDEN_REFRESH_TTL_SECONDS")
                .default_value("2592000")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_CLOCK_SKEW_SECONDS)
                .long(ARG_CLOCK_SKEW_SECONDS)
                .help("Leeway applied to iat/exp checks")
                .env("WARDEN_CLOCK_SKEW_SECONDS")
                .default_value("0")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_FAILED_LOGIN_DELAY_MS)
                .long(ARG_FAILED_LOGIN_DELAY_MS)
                .help("Delay before answering a failed login, in milliseconds")
                .env("WARDEN_FAILED_LOGIN_DELAY_MS")
                .default_value("250")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_ADMIN_REVOKE_TTL_SECONDS)
                .long(ARG_ADMIN_REVOKE_TTL_SECONDS)
                .help("Denylist lifetime when an admin revoke omits ttl_seconds")
                .env("WARDEN_ADMIN_REVOKE_TTL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
