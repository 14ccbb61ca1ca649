// Program and tracer configuration, with environment overrides
use crate::error::{Error, Result};
use crate::log;
use std::env;

pub const DEFAULT_STACK_SIZE: usize = 1 << 23;
pub const DEFAULT_HELPER_STACK_SIZE: usize = 1 << 16;
pub const DEFAULT_ENTRY_SYMBOL: &str = "_start";

const DEBUG_ENV: &str = "SPYTESTER_DEBUG";
const STACK_SIZE_ENV: &str = "SPYTESTER_STACK_SIZE";
const RELINK_POLICY_ENV: &str = "SPYTESTER_RELINK_POLICY";

// What a relink pass does with bindings it could not redirect
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RelinkPolicy {
    // skip and log, the traversal still succeeds
    #[default]
    Tolerant,
    // fail the pass once the traversal is complete
    Strict,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpyConfig {
    pub stack_size: usize,
    pub helper_stack_size: usize,
    pub entry_symbol: String,
    pub relink_policy: RelinkPolicy,
    pub debug: bool,
}

impl Default for SpyConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            helper_stack_size: DEFAULT_HELPER_STACK_SIZE,
            entry_symbol: DEFAULT_ENTRY_SYMBOL.to_string(),
            relink_policy: RelinkPolicy::Tolerant,
            debug: false,
        }
    }
}

impl SpyConfig {
    // defaults overlaid with SPYTESTER_* variables; unparsable values are ignored
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(value) = lookup(DEBUG_ENV) {
            match parse_bool_env_value(&value) {
                Some(enabled) => config.debug = enabled,
                None => warn_ignored(DEBUG_ENV, &value),
            }
        }
        if let Some(value) = lookup(STACK_SIZE_ENV) {
            match parse_size_env_value(&value) {
                Some(size) => config.stack_size = size,
                None => warn_ignored(STACK_SIZE_ENV, &value),
            }
        }
        if let Some(value) = lookup(RELINK_POLICY_ENV) {
            match parse_relink_policy(&value) {
                Some(policy) => config.relink_policy = policy,
                None => warn_ignored(RELINK_POLICY_ENV, &value),
            }
        }
        config
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_entry_symbol(mut self, entry_symbol: impl Into<String>) -> Self {
        self.entry_symbol = entry_symbol.into();
        self
    }

    pub fn with_relink_policy(mut self, relink_policy: RelinkPolicy) -> Self {
        self.relink_policy = relink_policy;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let page_size = crate::memory::page_size();
        if self.stack_size < page_size {
            return Err(Error::InvalidConfig(format!(
                "stack_size {} is smaller than a page",
                self.stack_size
            )));
        }
        if self.helper_stack_size < page_size {
            return Err(Error::InvalidConfig(format!(
                "helper_stack_size {} is smaller than a page",
                self.helper_stack_size
            )));
        }
        if self.entry_symbol.is_empty() || self.entry_symbol.contains('\0') {
            return Err(Error::InvalidConfig("entry_symbol is not a valid symbol name".into()));
        }
        Ok(())
    }
}

fn warn_ignored(name: &str, value: &str) {
    log::warn(format_args!("ignoring {name}={value:?}: unrecognized value"));
}

fn parse_bool_env_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_size_env_value(value: &str) -> Option<usize> {
    let value = value.trim();
    let size = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => usize::from_str_radix(hex, 16).ok()?,
        None => value.parse::<usize>().ok()?,
    };
    (size > 0).then_some(size)
}

fn parse_relink_policy(value: &str) -> Option<RelinkPolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "tolerant" => Some(RelinkPolicy::Tolerant),
        "strict" => Some(RelinkPolicy::Strict),
        _ => None,
    }
}

#[cfg(test)]
mod tests;
