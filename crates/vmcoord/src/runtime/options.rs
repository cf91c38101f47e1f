use std::time::Duration;

use thiserror::Error;

use crate::utils::flags::{self, FlagError, FlagValue, Flags};

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error(transparent)]
    Flag(#[from] FlagError),
    #[error("invalid value for `{name}`: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Declares an options struct whose fields double as command-line flags.
///
/// Every field gets a default, a `with_<field>` builder setter and an entry in
/// the [`Flags`] table under its own name.
macro_rules! define_options {
    (
        $(#[$meta: meta])*
        pub struct $name: ident {
            $(
                $(#[doc = $doc: literal])*
                $field: ident : $typ: ty = $default: expr,
            )*
        }
    ) => {
        paste::paste! {
            $(#[$meta])*
            pub struct $name {
                $(
                    $(#[doc = $doc])*
                    pub $field: $typ,
                )*
            }

            impl Default for $name {
                fn default() -> Self {
                    Self {
                        $($field: $default,)*
                    }
                }
            }

            impl $name {
                $(
                    pub fn [<with_ $field>](mut self, $field: $typ) -> Self {
                        self.$field = $field;
                        self
                    }
                )*
            }

            impl Flags for $name {
                fn set_flag(&mut self, name: &str, argument: &str) -> Option<bool> {
                    match name {
                        $(
                            stringify!($field) => Some(match <$typ as FlagValue>::parse_flag(argument) {
                                Some(value) => {
                                    self.$field = value;
                                    true
                                }
                                None => false,
                            }),
                        )*
                        _ => None,
                    }
                }

                fn flag_names() -> &'static [(&'static str, &'static str)] {
                    &[$((stringify!($field), concat!($($doc),*)),)*]
                }
            }
        }
    };
}

define_options! {
    /// Tunables of thread suspension, checkpoints and instrumentation.
    #[derive(Clone, Debug)]
    pub struct RuntimeOptions {
        /// Bound for suspend barrier waits and exclusive mutator lock acquisition.
        thread_suspend_timeout: Duration = Duration::from_secs(10),
        /// Attempts before a contended suspend request is considered a deadlock.
        max_suspend_retries: usize = if cfg!(debug_assertions) { 500 } else { 5000 },
        /// Back-off between suspend attempts.
        thread_suspend_sleep: Duration = Duration::from_micros(100),
        /// Suspend-all pauses longer than this are logged.
        long_thread_suspend_threshold: Duration = Duration::from_millis(5),
        /// Bound for waiting until every thread ran a checkpoint.
        checkpoint_timeout: Duration = Duration::from_secs(20),
        /// Period between re-pokes of threads that did not pass an empty checkpoint.
        empty_checkpoint_periodic_timeout: Duration = Duration::from_millis(100),
        /// Cumulative bound of an empty checkpoint before it dumps threads and aborts.
        empty_checkpoint_total_timeout: Duration = Duration::from_secs(600),
        /// Back-off while unregistering a thread that is still suspended.
        unregister_sleep: Duration = Duration::from_micros(1),
        /// Wait for daemon threads to leave Runnable at shutdown.
        daemon_shutdown_timeout: Duration = Duration::from_secs(2),
        /// Polling period of the daemon shutdown wait.
        daemon_shutdown_poll: Duration = Duration::from_millis(1),
        /// Grace sleep after daemon threads were suspended.
        daemon_sleep: Duration = Duration::from_millis(400),
        /// Number of thread ids available. Id 0 is never handed out.
        max_thread_ids: usize = u16::MAX as usize,
        /// Assert that the world really is stopped around suspend-all.
        debug_locking: bool = false,
        /// Abort the process on fatal errors instead of panicking.
        abort_on_fatal: bool = false,
        /// Never use ahead-of-time compiled code.
        java_debuggable: bool = false,
        /// The template interpreter is available.
        can_use_nterp: bool = true,
        /// Every method runs in the interpreter.
        forced_interpret_only: bool = false,
        /// Log instrumentation decisions at info level.
        verbose_instrumentation: bool = false,
    }
}

impl RuntimeOptions {
    /// Read options from `VMCOORD_*` environment variables and `--vmcoord:` flags.
    pub fn from_args(
        prefix: &str,
        args: impl Iterator<Item = String>,
        env: impl Iterator<Item = (String, String)>,
    ) -> Result<Self, OptionsError> {
        let mut options = Self::default();
        flags::parse_with_prefix(&mut options, prefix, args, env)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.max_suspend_retries == 0 {
            return Err(OptionsError::Invalid {
                name: "max_suspend_retries",
                reason: "must be at least 1".to_owned(),
            });
        }

        if self.max_thread_ids == 0 || self.max_thread_ids > u16::MAX as usize {
            return Err(OptionsError::Invalid {
                name: "max_thread_ids",
                reason: format!("{} is not in 1..={}", self.max_thread_ids, u16::MAX),
            });
        }

        if self.empty_checkpoint_periodic_timeout > self.empty_checkpoint_total_timeout {
            return Err(OptionsError::Invalid {
                name: "empty_checkpoint_periodic_timeout",
                reason: format!(
                    "{:?} exceeds empty_checkpoint_total_timeout ({:?})",
                    self.empty_checkpoint_periodic_timeout, self.empty_checkpoint_total_timeout
                ),
            });
        }

        if self.thread_suspend_timeout.is_zero() {
            return Err(OptionsError::Invalid {
                name: "thread_suspend_timeout",
                reason: "must be positive".to_owned(),
            });
        }

        Ok(())
    }

    pub fn help() -> String {
        let mut out = String::new();
        for (name, help) in Self::flag_names() {
            out.push_str(&format!("  --{:<36} {}\n", name, help.trim()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn defaults_validate() {
        RuntimeOptions::default().validate().unwrap();
        assert_eq!(RuntimeOptions::default().max_thread_ids, 65535);
    }

    #[test]
    fn options_from_flags() {
        let env = vec![(
            "VMCOORD_CHECKPOINT_TIMEOUT".to_owned(),
            "3s".to_owned(),
        )];
        let options = RuntimeOptions::from_args(
            "vmcoord",
            strings(&[
                "--vmcoord:thread-suspend-timeout=50ms",
                "--vmcoord:max_suspend_retries=0x20",
                "--vmcoord:debug-locking",
                "--vmcoord:no-can-use-nterp",
            ]),
            env.into_iter(),
        )
        .unwrap();

        assert_eq!(options.thread_suspend_timeout, Duration::from_millis(50));
        assert_eq!(options.max_suspend_retries, 32);
        assert_eq!(options.checkpoint_timeout, Duration::from_secs(3));
        assert!(options.debug_locking);
        assert!(!options.can_use_nterp);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let options = RuntimeOptions::default().with_max_suspend_retries(0);
        assert!(matches!(
            options.validate(),
            Err(OptionsError::Invalid {
                name: "max_suspend_retries",
                ..
            })
        ));

        let options = RuntimeOptions::default()
            .with_empty_checkpoint_periodic_timeout(Duration::from_secs(10))
            .with_empty_checkpoint_total_timeout(Duration::from_secs(1));
        assert!(options.validate().is_err());

        let err = RuntimeOptions::from_args(
            "vmcoord",
            strings(&["--vmcoord:no-such-option=1"]),
            std::iter::empty(),
        )
        .unwrap_err();
        assert!(matches!(err, OptionsError::Flag(FlagError::FlagNotFound(_))));
    }

    #[test]
    fn help_lists_every_option() {
        let help = RuntimeOptions::help();
        assert!(help.contains("thread_suspend_timeout"));
        assert!(help.contains("verbose_instrumentation"));
    }
}
