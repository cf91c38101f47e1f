//! A small library to parse command-line and environmental flags.
//!
//! Flags are declared on a plain struct (see `define_options!`) and parsed with
//! [`parse`] or [`parse_with_prefix`]. Accepted forms:
//!
//! - `--name=value`, `--name` (sets a boolean to `true`), `--no-name` / `--no_name`
//! - `--prefix:name=value` when a prefix is used
//! - `PREFIX_NAME=value` environment variables (command-line flags win)
//!
//! Dashes in flag names are treated as underscores. Integers accept `0x` (hex)
//! and leading `0` (octal) prefixes, durations accept `us`, `ms`, `s` and `m`
//! suffixes.

use std::{borrow::Cow, time::Duration};

use thiserror::Error;

use crate::utils::parse_duration;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlagError {
    #[error("unknown flag `{0}`")]
    FlagNotFound(String),
}

/// A value that can be read from a flag argument.
pub trait FlagValue: Sized {
    fn parse_flag(argument: &str) -> Option<Self>;
}

impl FlagValue for bool {
    fn parse_flag(argument: &str) -> Option<Self> {
        match argument {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        }
    }
}

fn split_radix(argument: &str) -> (&str, u32) {
    if argument.len() > 2 && (argument.starts_with("0x") || argument.starts_with("0X")) {
        (&argument[2..], 16)
    } else if argument.len() > 1 && argument.starts_with('0') {
        (&argument[1..], 8)
    } else {
        (argument, 10)
    }
}

macro_rules! int_flag_value {
    ($($t: ty),*) => {
        $(
            impl FlagValue for $t {
                fn parse_flag(argument: &str) -> Option<Self> {
                    let (digits, radix) = split_radix(argument);
                    <$t>::from_str_radix(digits, radix).ok()
                }
            }
        )*
    };
}

int_flag_value!(u16, u32, u64, usize, isize);

impl FlagValue for f64 {
    fn parse_flag(argument: &str) -> Option<Self> {
        argument.parse().ok()
    }
}

impl FlagValue for String {
    fn parse_flag(argument: &str) -> Option<Self> {
        Some(argument.to_owned())
    }
}

impl FlagValue for Duration {
    fn parse_flag(argument: &str) -> Option<Self> {
        parse_duration(argument)
    }
}

/// A set of named flags that can be assigned from strings.
pub trait Flags {
    /// Assign `argument` to flag `name`.
    ///
    /// Returns `None` when no flag is called `name` and `Some(false)` when the
    /// argument is not a valid value for it.
    fn set_flag(&mut self, name: &str, argument: &str) -> Option<bool>;

    /// `(name, help)` for every flag.
    fn flag_names() -> &'static [(&'static str, &'static str)];
}

fn set_from_string<T: Flags>(target: &mut T, name: &str, argument: &str) -> Result<(), FlagError> {
    match target.set_flag(name, argument) {
        None => Err(FlagError::FlagNotFound(name.to_owned())),
        Some(true) => Ok(()),
        Some(false) => {
            log::warn!(
                "Ignoring flag: {} is an invalid value for flag {}",
                argument,
                name
            );
            Ok(())
        }
    }
}

fn parse_option<T: Flags>(target: &mut T, option: &str) -> Result<(), FlagError> {
    const NO_1_PREFIX: &str = "no_";
    const NO_2_PREFIX: &str = "no-";

    let (name, argument) = match option.find('=') {
        Some(equals_pos) => (&option[..equals_pos], &option[equals_pos + 1..]),
        None => {
            if option.len() > NO_1_PREFIX.len()
                && (option.starts_with(NO_1_PREFIX) || option.starts_with(NO_2_PREFIX))
            {
                (&option[NO_1_PREFIX.len()..], "false")
            } else {
                (option, "true")
            }
        }
    };

    let name = name.replace('-', "_");
    set_from_string(target, &name, argument)
}

fn process_command_line_flags<T: Flags>(
    target: &mut T,
    prefix: Option<&str>,
    flags: impl Iterator<Item = String>,
) -> Result<(), FlagError> {
    let cli_prefix = prefix
        .map(|prefix| Cow::Owned(format!("--{}:", prefix)))
        .unwrap_or(Cow::Borrowed("--"));

    for flag in flags {
        if is_valid_flag(&flag, &cli_prefix) {
            parse_option(target, &flag[cli_prefix.len()..])?;
        }
    }

    Ok(())
}

fn process_environmental_vars<T: Flags>(
    target: &mut T,
    prefix: Option<&str>,
    vars: impl Iterator<Item = (String, String)>,
) {
    let env_prefix = prefix
        .map(|prefix| format!("{}_", prefix.to_uppercase()))
        .unwrap_or_default();

    for (option, argument) in vars {
        if env_prefix.is_empty() || !is_valid_flag(&option, &env_prefix) {
            continue;
        }

        let name = option[env_prefix.len()..].to_lowercase();
        // unrelated variables may share the prefix
        if target.set_flag(&name, &argument) == Some(false) {
            log::warn!(
                "Ignoring environment variable: {} is an invalid value for {}",
                argument,
                option
            );
        }
    }
}

fn is_valid_flag(name: &str, prefix: &str) -> bool {
    name.len() > prefix.len() && name.starts_with(prefix)
}

/// Parse unprefixed `--name` flags. Environment variables are not consulted.
pub fn parse<T: Flags>(
    target: &mut T,
    args: impl Iterator<Item = String>,
) -> Result<(), FlagError> {
    process_command_line_flags(target, None, args)
}

/// Parse `PREFIX_NAME` environment variables, then `--prefix:name` flags.
pub fn parse_with_prefix<T: Flags>(
    target: &mut T,
    prefix: &str,
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    process_environmental_vars(target, Some(prefix), env);
    process_command_line_flags(target, Some(prefix), args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Debug)]
    struct TestFlags {
        verbose: bool,
        retries: usize,
        timeout: Duration,
    }

    impl Flags for TestFlags {
        fn set_flag(&mut self, name: &str, argument: &str) -> Option<bool> {
            fn assign<V: FlagValue>(slot: &mut V, argument: &str) -> bool {
                match V::parse_flag(argument) {
                    Some(value) => {
                        *slot = value;
                        true
                    }
                    None => false,
                }
            }
            match name {
                "verbose" => Some(assign(&mut self.verbose, argument)),
                "retries" => Some(assign(&mut self.retries, argument)),
                "timeout" => Some(assign(&mut self.timeout, argument)),
                _ => None,
            }
        }

        fn flag_names() -> &'static [(&'static str, &'static str)] {
            &[("verbose", ""), ("retries", ""), ("timeout", "")]
        }
    }

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn parses_values_and_booleans() {
        let mut flags = TestFlags::default();
        parse(
            &mut flags,
            args(&["--verbose", "--retries=0x10", "program-arg", "--timeout=250ms"]),
        )
        .unwrap();
        assert!(flags.verbose);
        assert_eq!(flags.retries, 16);
        assert_eq!(flags.timeout, Duration::from_millis(250));

        parse(&mut flags, args(&["--no-verbose", "--retries=010"])).unwrap();
        assert!(!flags.verbose);
        assert_eq!(flags.retries, 8);
    }

    #[test]
    fn invalid_value_is_ignored() {
        let mut flags = TestFlags::default();
        parse(&mut flags, args(&["--retries=lots"])).unwrap();
        assert_eq!(flags.retries, 0);
    }

    #[test]
    fn unknown_flag_is_an_error() {
        let mut flags = TestFlags::default();
        assert_eq!(
            parse(&mut flags, args(&["--bogus-flag=1"])),
            Err(FlagError::FlagNotFound("bogus_flag".to_owned()))
        );
    }

    #[test]
    fn prefixed_flags_and_environment() {
        let mut flags = TestFlags::default();
        let env = vec![
            ("VM_RETRIES".to_owned(), "3".to_owned()),
            ("VM_TIMEOUT".to_owned(), "1s".to_owned()),
            ("VM_UNRELATED".to_owned(), "x".to_owned()),
            ("PATH".to_owned(), "/bin".to_owned()),
        ];
        parse_with_prefix(
            &mut flags,
            "vm",
            args(&["--vm:retries=7", "--verbose"]),
            env.into_iter(),
        )
        .unwrap();
        // command line wins over the environment
        assert_eq!(flags.retries, 7);
        assert_eq!(flags.timeout, Duration::from_secs(1));
        // unprefixed flags are not ours
        assert!(!flags.verbose);
    }
}
