use super::{
    DEFAULT_STACK_SIZE, RelinkPolicy, SpyConfig, parse_bool_env_value, parse_relink_policy,
    parse_size_env_value,
};
use std::collections::BTreeMap;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: BTreeMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

#[test]
fn parse_bool_env_values() {
    assert_eq!(parse_bool_env_value("1"), Some(true));
    assert_eq!(parse_bool_env_value(" YES "), Some(true));
    assert_eq!(parse_bool_env_value("off"), Some(false));
    assert_eq!(parse_bool_env_value("maybe"), None);
    assert_eq!(parse_bool_env_value(""), None);
}

#[test]
fn parse_size_env_decimal_and_hex() {
    assert_eq!(parse_size_env_value("8388608"), Some(1 << 23));
    assert_eq!(parse_size_env_value("0x800000"), Some(1 << 23));
    assert_eq!(parse_size_env_value(" 0X1000 "), Some(0x1000));
    assert_eq!(parse_size_env_value("0"), None);
    assert_eq!(parse_size_env_value("big"), None);
}

#[test]
fn parse_relink_policy_values() {
    assert_eq!(parse_relink_policy("Strict"), Some(RelinkPolicy::Strict));
    assert_eq!(parse_relink_policy("tolerant"), Some(RelinkPolicy::Tolerant));
    assert_eq!(parse_relink_policy("lenient"), None);
}

#[test]
fn defaults_match_program_layout() {
    let config = SpyConfig::default();
    assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
    assert_eq!(config.stack_size, 1 << 23);
    assert_eq!(config.entry_symbol, "_start");
    assert_eq!(config.relink_policy, RelinkPolicy::Tolerant);
    assert!(config.validate().is_ok());
}

#[test]
fn env_overrides_apply() {
    let config = SpyConfig::from_lookup(lookup_from(&[
        ("SPYTESTER_DEBUG", "on"),
        ("SPYTESTER_STACK_SIZE", "0x100000"),
        ("SPYTESTER_RELINK_POLICY", "strict"),
    ]));
    assert!(config.debug);
    assert_eq!(config.stack_size, 0x100000);
    assert_eq!(config.relink_policy, RelinkPolicy::Strict);
}

#[test]
fn env_invalid_values_keep_defaults() {
    let config = SpyConfig::from_lookup(lookup_from(&[
        ("SPYTESTER_DEBUG", "sometimes"),
        ("SPYTESTER_STACK_SIZE", "-1"),
        ("SPYTESTER_RELINK_POLICY", ""),
    ]));
    assert_eq!(config, SpyConfig::default());
}

#[test]
fn validate_rejects_tiny_stack() {
    let config = SpyConfig::default().with_stack_size(16);
    assert!(config.validate().is_err());
    let config = SpyConfig::default().with_entry_symbol("");
    assert!(config.validate().is_err());
}
