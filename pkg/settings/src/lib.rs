//! `LOGPIPE_*` environment lookups shared by every service config.
//!
//! Configs read through a `lookup` closure rather than `std::env` directly
//! so tests can feed them a map. Unset and blank values both mean "use the
//! default".

use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value for {key}: {value:?}")]
pub struct InvalidValue {
    pub key: &'static str,
    pub value: String,
}

/// Trimmed value of `key`, or `None` when unset or blank.
pub fn text(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, InvalidValue> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|_| InvalidValue { key, value: raw })
}

/// Like [`parse`], but zero and negative values are rejected.
pub fn positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, InvalidValue>
where
    T: FromStr + PartialOrd + Default,
{
    match parse::<T>(lookup, key)? {
        Some(value) if value > T::default() => Ok(Some(value)),
        Some(_) => Err(InvalidValue {
            key,
            value: lookup(key).unwrap_or_default(),
        }),
        None => Ok(None),
    }
}
