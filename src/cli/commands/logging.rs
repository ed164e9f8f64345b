use clap::{builder::ValueParser, Arg, ArgAction, Command};

pub const ARG_VERBOSITY: &str = "verbosity";

/// Level names accepted by `WARDEN_LOG_LEVEL`, indexed by verbosity count.
const LEVEL_NAMES: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Accept either a verbosity count or a level name.
fn parse_log_level(level: &str) -> std::result::Result<u8, String> {
    let level = level.trim().to_ascii_lowercase();
    if let Ok(count) = level.parse::<u8>() {
        return Ok(count.min(4));
    }
    LEVEL_NAMES
        .iter()
        .position(|name| *name == level)
        .and_then(|index| u8::try_from(index).ok())
        .ok_or_else(|| format!("unknown log level '{level}', expected one of {LEVEL_NAMES:?}"))
}

#[must_use]
pub fn log_level_parser() -> ValueParser {
    ValueParser::from(parse_log_level)
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Log more: -v warn, -vv info, -vvv debug, -vvvv trace (default: error)")
            .long_help(
                "Log verbosity. Repeat -v, or set WARDEN_LOG_LEVEL to a level name \
                 (error, warn, info, debug, trace) or a count. Signing keys, \
                 passwords and tokens are never logged at any level.",
            )
            .env("WARDEN_LOG_LEVEL")
            .global(true)
            .action(ArgAction::Count)
            .value_parser(log_level_parser()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_and_counts() {
        assert_eq!(parse_log_level("error"), Ok(0));
        assert_eq!(parse_log_level(" INFO "), Ok(2));
        assert_eq!(parse_log_level("trace"), Ok(4));
        assert_eq!(parse_log_level("3"), Ok(3));
        assert_eq!(parse_log_level("9"), Ok(4));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn repeated_flag_counts() {
        let matches = temp_env::with_var("WARDEN_LOG_LEVEL", None::<&str>, || {
            with_args(Command::new("warden")).try_get_matches_from(vec!["warden", "-vv"])
        });
        assert!(matches.is_ok());
        if let Ok(matches) = matches {
            assert_eq!(matches.get_one::<u8>(ARG_VERBOSITY).copied(), Some(2));
        }
    }
}
