use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::time::Duration;

use crate::limits::{AllowList, FailMode};

pub const ARG_RATE_RPS: &str = "rate-rps";
pub const ARG_RATE_BURST: &str = "rate-burst";
pub const ARG_RATE_IDLE_SECONDS: &str = "rate-idle-seconds";
pub const ARG_RATE_WINDOW_LIMIT: &str = "rate-window-limit";
pub const ARG_AUTH_RATE_WINDOW_LIMIT: &str = "auth-rate-window-limit";
pub const ARG_RATE_WINDOW_SECONDS: &str = "rate-window-seconds";
pub const ARG_BRUTE_LIMIT: &str = "brute-limit";
pub const ARG_BRUTE_WINDOW_SECONDS: &str = "brute-window-seconds";
pub const ARG_IDENTITY_RPS: &str = "identity-rps";
pub const ARG_IDENTITY_BURST: &str = "identity-burst";
pub const ARG_ALLOW_CIDR: &str = "allow-cidr";
pub const ARG_TRUSTED_PROXY: &str = "trusted-proxy";
pub const ARG_LIMITER_FAIL_OPEN: &str = "limiter-fail-open";

#[derive(Debug)]
pub struct Options {
    pub rate_rps: f64,
    pub rate_burst: u32,
    pub idle_ttl: Duration,
    pub window_limit: u64,
    pub auth_window_limit: u64,
    pub window: Duration,
    pub brute_limit: u64,
    pub brute_window: Duration,
    pub identity_rps: f64,
    pub identity_burst: u32,
    pub allow: AllowList,
    pub trusted_proxies: AllowList,
    pub fail_mode: FailMode,
}

impl Options {
    /// Extract limiter options.
    ///
    /// # Errors
    /// Returns an error on a non-positive refill rate or an invalid CIDR.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let rate = |name: &str, default: f64| -> Result<f64> {
            let value = matches.get_one::<f64>(name).copied().unwrap_or(default);
            if value.is_finite() && value > 0.0 {
                Ok(value)
            } else {
                Err(anyhow!("--{name} must be a positive number"))
            }
        };
        let seconds = |name: &str, default: u64| {
            Duration::from_secs(matches.get_one::<u64>(name).copied().unwrap_or(default))
        };

        let networks = |name: &str| -> Result<AllowList> {
            Ok(matches
                .get_one::<String>(name)
                .map(|list| AllowList::parse(list))
                .transpose()
                .with_context(|| format!("invalid --{name}"))?
                .unwrap_or_default())
        };

        let fail_mode = if matches.get_flag(ARG_LIMITER_FAIL_OPEN) {
            FailMode::Open
        } else {
            FailMode::Closed
        };

        Ok(Self {
            rate_rps: rate(ARG_RATE_RPS, 10.0)?,
            rate_burst: matches.get_one::<u32>(ARG_RATE_BURST).copied().unwrap_or(10),
            idle_ttl: seconds(ARG_RATE_IDLE_SECONDS, 300),
            window_limit: matches
                .get_one::<u64>(ARG_RATE_WINDOW_LIMIT)
                .copied()
                .unwrap_or(120),
            auth_window_limit: matches
                .get_one::<u64>(ARG_AUTH_RATE_WINDOW_LIMIT)
                .copied()
                .unwrap_or(20),
            window: seconds(ARG_RATE_WINDOW_SECONDS, 60),
            brute_limit: matches.get_one::<u64>(ARG_BRUTE_LIMIT).copied().unwrap_or(10),
            brute_window: seconds(ARG_BRUTE_WINDOW_SECONDS, 300),
            identity_rps: rate(ARG_IDENTITY_RPS, 0.5)?,
            identity_burst: matches
                .get_one::<u32>(ARG_IDENTITY_BURST)
                .copied()
                .unwrap_or(3),
            allow: networks(ARG_ALLOW_CIDR)?,
            trusted_proxies: networks(ARG_TRUSTED_PROXY)?,
            fail_mode,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_local_args(command);
    let command = with_window_args(command);
    with_brute_args(command)
}

fn with_local_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_RATE_RPS)
                .long(ARG_RATE_RPS)
                .help("Per-client token refill rate (tokens per second)")
                .env("WARDEN_RATE_RPS")
                .default_value("10")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new(ARG_RATE_BURST)
                .long(ARG_RATE_BURST)
                .help("Per-client bucket capacity")
                .env("WARDEN_RATE_BURST")
                .default_value("10")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_RATE_IDLE_SECONDS)
                .long(ARG_RATE_IDLE_SECONDS)
                .help("Idle time after which a client bucket is evicted")
                .env("WARDEN_RATE_IDLE_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_IDENTITY_RPS)
                .long(ARG_IDENTITY_RPS)
                .help("Per-identity login refill rate (tokens per second)")
                .env("WARDEN_IDENTITY_RPS")
                .default_value("0.5")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new(ARG_IDENTITY_BURST)
                .long(ARG_IDENTITY_BURST)
                .help("Per-identity login bucket capacity")
                .env("WARDEN_IDENTITY_BURST")
                .default_value("3")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
}

fn with_window_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_RATE_WINDOW_LIMIT)
                .long(ARG_RATE_WINDOW_LIMIT)
                .help("Shared requests per window per client")
                .env("WARDEN_RATE_WINDOW_LIMIT")
                .default_value("120")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_AUTH_RATE_WINDOW_LIMIT)
                .long(ARG_AUTH_RATE_WINDOW_LIMIT)
                .help("Shared auth requests per window per client")
                .env("WARDEN_AUTH_RATE_WINDOW_LIMIT")
                .default_value("20")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_RATE_WINDOW_SECONDS)
                .long(ARG_RATE_WINDOW_SECONDS)
                .help("Shared window length in seconds")
                .env("WARDEN_RATE_WINDOW_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_ALLOW_CIDR)
                .long(ARG_ALLOW_CIDR)
                .help("Comma separated networks exempt from shared and brute-force limits")
                .env("WARDEN_ALLOW_CIDR"),
        )
        .arg(
            Arg::new(ARG_TRUSTED_PROXY)
                .long(ARG_TRUSTED_PROXY)
                .help("Comma separated proxy networks whose X-Forwarded-For is believed")
                .env("WARDEN_TRUSTED_PROXY"),
        )
        .arg(
            Arg::new(ARG_LIMITER_FAIL_OPEN)
                .long(ARG_LIMITER_FAIL_OPEN)
                .help("Admit requests when the shared store is unreachable")
                .env("WARDEN_LIMITER_FAIL_OPEN")
                .action(ArgAction::SetTrue),
        )
}

fn with_brute_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_BRUTE_LIMIT)
                .long(ARG_BRUTE_LIMIT)
                .help("Login attempts per IP and identity per brute-force window")
                .env("WARDEN_BRUTE_LIMIT")
                .default_value("10")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_BRUTE_WINDOW_SECONDS)
                .long(ARG_BRUTE_WINDOW_SECONDS)
                .help("Brute-force window length in seconds")
                .env("WARDEN_BRUTE_WINDOW_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
