//! # Run-time Configuration
//!
//! Options are read from the boot command line as whitespace separated
//! `key=value` pairs. The first word (the kernel path GRUB prepends) and
//! anything without a `=` are skipped.
//!
//! ```
//! # use kernel_info::config::KernelConfig;
//! let cfg = KernelConfig::parse("/boot/kernel log=debug slice=3 init=/bin/sh");
//! assert_eq!(cfg.time_slice, 3);
//! assert_eq!(cfg.init_path, "/bin/sh");
//! ```

use crate::memory::{IDENTITY_MAP_DEFAULT, IDENTITY_MAP_MAX, IDENTITY_MAP_MIN};
use crate::process::{DEFAULT_TIME_SLICE, MAX_PROCESSES, MAX_PROCESSES_LIMIT, MIN_PROCESSES};
use core::str::FromStr;
use log::LevelFilter;

/// Path of the first user program when `init=` is not given.
pub const DEFAULT_INIT_PATH: &str = "/bin/init";

/// Kernel options resolved from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig<'a> {
    /// Maximum log level for the debug console.
    pub log_level: LevelFilter,
    /// Bytes of low physical memory identity mapped into every address space.
    pub identity_bytes: u32,
    /// Timer ticks per scheduling quantum.
    pub time_slice: u32,
    /// Number of process table slots.
    pub max_processes: usize,
    /// Boot module path of the first user process.
    pub init_path: &'a str,
}

impl Default for KernelConfig<'_> {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Info,
            identity_bytes: IDENTITY_MAP_DEFAULT,
            time_slice: DEFAULT_TIME_SLICE,
            max_processes: MAX_PROCESSES,
            init_path: DEFAULT_INIT_PATH,
        }
    }
}

/// A key the parser did not understand, or a value it could not use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigIssue<'a> {
    UnknownKey(&'a str),
    BadValue { key: &'a str, value: &'a str },
}

impl<'a> KernelConfig<'a> {
    /// Parses the command line, falling back to defaults for anything malformed.
    #[must_use]
    pub fn parse(cmdline: &'a str) -> Self {
        Self::parse_with(cmdline, |_| {})
    }

    /// Like [`parse`](Self::parse), reporting every ignored option to `on_issue`.
    pub fn parse_with(cmdline: &'a str, mut on_issue: impl FnMut(ConfigIssue<'a>)) -> Self {
        let mut cfg = Self::default();
        for (key, value) in cmdline.split_whitespace().filter_map(|w| w.split_once('=')) {
            match cfg.apply(key, value) {
                Some(true) => {}
                Some(false) => on_issue(ConfigIssue::BadValue { key, value }),
                None => on_issue(ConfigIssue::UnknownKey(key)),
            }
        }
        cfg
    }

    /// `None` for an unknown key, otherwise whether the value was accepted.
    fn apply(&mut self, key: &str, value: &'a str) -> Option<bool> {
        let accepted = match key {
            "log" => {
                let Ok(level) = LevelFilter::from_str(value) else {
                    return Some(false);
                };
                self.log_level = level;
                true
            }
            "identity_mb" => {
                let Some(bytes) = parse_identity_mb(value) else {
                    return Some(false);
                };
                self.identity_bytes = bytes;
                true
            }
            "slice" => match value.parse::<u32>() {
                Ok(ticks) if ticks > 0 => {
                    self.time_slice = ticks;
                    true
                }
                _ => false,
            },
            "max_procs" => {
                let Ok(n) = value.parse::<usize>() else {
                    return Some(false);
                };
                self.max_processes = n.clamp(MIN_PROCESSES, MAX_PROCESSES_LIMIT);
                true
            }
            "init" if value.starts_with('/') => {
                self.init_path = value;
                true
            }
            "init" => false,
            _ => return None,
        };
        Some(accepted)
    }
}

/// Megabytes to bytes, rounded down to a whole page directory entry and clamped.
fn parse_identity_mb(value: &str) -> Option<u32> {
    const MB: u32 = 1024 * 1024;
    let mb = value
        .parse::<u32>()
        .ok()?
        .clamp(IDENTITY_MAP_MIN / MB, IDENTITY_MAP_MAX / MB);
    Some((mb * MB) & !(4 * MB - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_line_gives_defaults() {
        assert_eq!(KernelConfig::parse(""), KernelConfig::default());
        assert_eq!(KernelConfig::parse("/boot/kernel.elf"), KernelConfig::default());
    }

    #[test]
    fn all_keys_are_applied() {
        let cfg = KernelConfig::parse("kernel log=trace identity_mb=32 slice=10 max_procs=8 init=/sbin/init");
        assert_eq!(cfg.log_level, LevelFilter::Trace);
        assert_eq!(cfg.identity_bytes, 32 * 1024 * 1024);
        assert_eq!(cfg.time_slice, 10);
        assert_eq!(cfg.max_processes, 8);
        assert_eq!(cfg.init_path, "/sbin/init");
    }

    #[test]
    fn identity_map_is_clamped_and_rounded() {
        assert_eq!(KernelConfig::parse("identity_mb=1").identity_bytes, IDENTITY_MAP_MIN);
        assert_eq!(KernelConfig::parse("identity_mb=4096").identity_bytes, IDENTITY_MAP_MAX);
        assert_eq!(KernelConfig::parse("identity_mb=4294967295").identity_bytes, IDENTITY_MAP_MAX);
        assert_eq!(KernelConfig::parse("identity_mb=37").identity_bytes, 36 * 1024 * 1024);
    }

    #[test]
    fn bad_values_are_reported_and_ignored() {
        let mut issues = Vec::new();
        let cfg = KernelConfig::parse_with("slice=0 log=loud init=relative colour=blue", |i| issues.push(i));
        assert_eq!(cfg, KernelConfig::default());
        assert_eq!(
            issues,
            vec![
                ConfigIssue::BadValue { key: "slice", value: "0" },
                ConfigIssue::BadValue { key: "log", value: "loud" },
                ConfigIssue::BadValue { key: "init", value: "relative" },
                ConfigIssue::UnknownKey("colour"),
            ]
        );
    }

    #[test]
    fn max_procs_is_clamped() {
        assert_eq!(KernelConfig::parse("max_procs=1").max_processes, MIN_PROCESSES);
        assert_eq!(KernelConfig::parse("max_procs=100000").max_processes, MAX_PROCESSES_LIMIT);
    }
}
