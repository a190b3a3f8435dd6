//! Expiration values and the helpers that turn them into timestamps.
//!
//! An expiration may be given as seconds, a duration, an absolute datetime or
//! an HTTP-date. Two sentinels exist: [`ExpireAfter::Never`] disables
//! time-based expiration, [`ExpireAfter::DoNotCache`] disables storage.
//! When expirations travel through a `Cache-Control: max-age` header the
//! sentinels are encoded as [`NEVER_EXPIRE`] and [`DO_NOT_CACHE`].

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// Seconds value meaning "never expire".
pub const NEVER_EXPIRE: i64 = -1;

/// Seconds value meaning "expire as soon as stored".
pub const EXPIRE_IMMEDIATELY: i64 = 0;

/// Seconds value meaning "do not store this response".
pub const DO_NOT_CACHE: i64 = 0x0D0E_0200_0207_04;

/// How long a response stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpireAfter {
    #[default]
    Never,
    DoNotCache,
    /// Offset from the time the response is stored; zero expires immediately.
    After(TimeDelta),
    /// Absolute expiration time.
    At(DateTime<Utc>),
}

impl ExpireAfter {
    pub fn immediately() -> Self {
        ExpireAfter::After(TimeDelta::zero())
    }

    pub fn seconds(secs: i64) -> Self {
        Self::from_seconds(secs)
    }

    /// Decode a seconds value, including the sentinel encodings.
    pub fn from_seconds(secs: i64) -> Self {
        match secs {
            NEVER_EXPIRE => ExpireAfter::Never,
            DO_NOT_CACHE => ExpireAfter::DoNotCache,
            s if s < 0 => ExpireAfter::immediately(),
            s => ExpireAfter::After(TimeDelta::try_seconds(s).unwrap_or(TimeDelta::MAX)),
        }
    }

    /// Encode as seconds relative to `now`, with sentinels for the special cases.
    pub fn as_seconds(&self, now: DateTime<Utc>) -> i64 {
        match self {
            ExpireAfter::Never => NEVER_EXPIRE,
            ExpireAfter::DoNotCache => DO_NOT_CACHE,
            ExpireAfter::After(delta) => delta.num_seconds().max(0),
            ExpireAfter::At(at) => (*at - now).num_seconds().max(0),
        }
    }

    /// Absolute expiration for a response stored at `now`; `None` means never.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ExpireAfter::Never => None,
            ExpireAfter::DoNotCache => Some(now),
            ExpireAfter::After(delta) => now.checked_add_signed(*delta),
            ExpireAfter::At(at) => Some(*at),
        }
    }

    /// True when a response stored now would already be stale.
    pub fn is_immediate(&self, now: DateTime<Utc>) -> bool {
        match self {
            ExpireAfter::After(delta) => *delta <= TimeDelta::zero(),
            ExpireAfter::At(at) => *at <= now,
            _ => false,
        }
    }

    pub fn is_do_not_cache(&self) -> bool {
        matches!(self, ExpireAfter::DoNotCache)
    }
}

impl From<i64> for ExpireAfter {
    fn from(secs: i64) -> Self {
        Self::from_seconds(secs)
    }
}

impl From<TimeDelta> for ExpireAfter {
    fn from(delta: TimeDelta) -> Self {
        ExpireAfter::After(delta)
    }
}

impl From<std::time::Duration> for ExpireAfter {
    fn from(duration: std::time::Duration) -> Self {
        ExpireAfter::After(TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX))
    }
}

impl From<DateTime<Utc>> for ExpireAfter {
    fn from(at: DateTime<Utc>) -> Self {
        ExpireAfter::At(at)
    }
}

/// Naive datetimes are taken to be UTC.
impl From<NaiveDateTime> for ExpireAfter {
    fn from(at: NaiveDateTime) -> Self {
        ExpireAfter::At(at.and_utc())
    }
}

impl FromStr for ExpireAfter {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim();
        match value.to_ascii_lowercase().as_str() {
            "never" | "never_expire" => return Ok(ExpireAfter::Never),
            "do_not_cache" => return Ok(ExpireAfter::DoNotCache),
            "immediately" | "expire_immediately" => return Ok(ExpireAfter::immediately()),
            _ => {}
        }
        if let Ok(secs) = value.parse::<i64>() {
            return Ok(ExpireAfter::from_seconds(secs));
        }
        if let Ok(at) = DateTime::parse_from_rfc3339(value) {
            return Ok(ExpireAfter::At(at.with_timezone(&Utc)));
        }
        if let Some(at) = parse_http_date(value) {
            return Ok(ExpireAfter::At(at));
        }
        Err(Error::Config(format!("invalid expiration value: {raw}")))
    }
}

impl fmt::Display for ExpireAfter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpireAfter::Never => f.write_str("never"),
            ExpireAfter::DoNotCache => f.write_str("do_not_cache"),
            ExpireAfter::After(delta) => write!(f, "{}s", delta.num_seconds()),
            ExpireAfter::At(at) => write!(f, "{}", at.to_rfc3339()),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawExpiration {
    Seconds(i64),
    Text(String),
}

impl Serialize for ExpireAfter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = match self {
            ExpireAfter::Never => RawExpiration::Seconds(NEVER_EXPIRE),
            ExpireAfter::DoNotCache => RawExpiration::Text("do_not_cache".into()),
            ExpireAfter::After(delta) => RawExpiration::Seconds(delta.num_seconds()),
            ExpireAfter::At(at) => RawExpiration::Text(at.to_rfc3339()),
        };
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ExpireAfter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawExpiration::deserialize(deserializer)? {
            RawExpiration::Seconds(secs) => Ok(ExpireAfter::from_seconds(secs)),
            RawExpiration::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Permission to serve a stale response: never, always, or up to an age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StaleSetting {
    #[default]
    Disabled,
    Any,
    Within(TimeDelta),
}

impl StaleSetting {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, StaleSetting::Disabled)
    }

    /// The first enabled setting of `self` and `other`.
    pub fn or(self, other: StaleSetting) -> StaleSetting {
        if self.is_enabled() { self } else { other }
    }
}

impl From<bool> for StaleSetting {
    fn from(enabled: bool) -> Self {
        if enabled { StaleSetting::Any } else { StaleSetting::Disabled }
    }
}

impl From<i64> for StaleSetting {
    fn from(secs: i64) -> Self {
        StaleSetting::Within(TimeDelta::try_seconds(secs.max(0)).unwrap_or(TimeDelta::MAX))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawStale {
    Flag(bool),
    Seconds(i64),
}

impl Serialize for StaleSetting {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StaleSetting::Disabled => RawStale::Flag(false),
            StaleSetting::Any => RawStale::Flag(true),
            StaleSetting::Within(delta) => RawStale::Seconds(delta.num_seconds()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StaleSetting {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawStale::deserialize(deserializer)? {
            RawStale::Flag(flag) => flag.into(),
            RawStale::Seconds(secs) => secs.into(),
        })
    }
}

/// A glob-style URL pattern with its expiration.
///
/// Schemes are ignored on both sides and patterns match as prefixes, so
/// `api.example.com/v1` matches `https://api.example.com/v1/items?page=2`.
#[derive(Debug, Clone)]
pub struct UrlExpiration {
    pattern: String,
    regex: Regex,
    pub expire_after: ExpireAfter,
}

impl UrlExpiration {
    pub fn new(pattern: &str, expire_after: ExpireAfter) -> Result<Self, Error> {
        let trimmed = strip_scheme(pattern.trim()).trim_end_matches('*');
        if trimmed.is_empty() {
            return Err(Error::Config(format!("empty URL pattern: {pattern:?}")));
        }
        let mut source = String::from("^");
        for ch in trimmed.chars() {
            match ch {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                other => source.push_str(&regex::escape(&other.to_string())),
            }
        }
        source.push_str(".*$");
        let regex = Regex::new(&source).map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self { pattern: pattern.to_string(), regex, expire_after })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, url: &str) -> bool {
        !url.is_empty() && self.regex.is_match(strip_scheme(url))
    }
}

fn strip_scheme(url: &str) -> &str {
    url.split_once("://").map_or(url, |(_, rest)| rest)
}

/// Expiration of the first pattern that matches `url`.
pub fn url_expiration(url: &str, patterns: &[UrlExpiration]) -> Option<ExpireAfter> {
    let matched = patterns.iter().find(|p| p.matches(url))?;
    tracing::debug!(url, pattern = matched.pattern(), expire_after = %matched.expire_after, "URL expiration matched");
    Some(matched.expire_after)
}

/// Parse an RFC 7231 HTTP-date.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    httpdate::parse_http_date(value.trim()).ok().map(DateTime::<Utc>::from)
}

/// Format a timestamp as an RFC 7231 HTTP-date.
pub fn format_http_date(at: DateTime<Utc>) -> String {
    httpdate::fmt_http_date(SystemTime::from(at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_sentinels_round_trip_through_seconds() {
        assert_eq!(ExpireAfter::from_seconds(NEVER_EXPIRE), ExpireAfter::Never);
        assert_eq!(ExpireAfter::from_seconds(DO_NOT_CACHE), ExpireAfter::DoNotCache);
        assert_eq!(ExpireAfter::Never.as_seconds(now()), NEVER_EXPIRE);
        assert_eq!(ExpireAfter::DoNotCache.as_seconds(now()), DO_NOT_CACHE);
        assert_eq!(ExpireAfter::seconds(60).as_seconds(now()), 60);
    }

    #[test]
    fn test_expires_at() {
        assert_eq!(ExpireAfter::Never.expires_at(now()), None);
        assert_eq!(ExpireAfter::seconds(60).expires_at(now()), Some(now() + TimeDelta::seconds(60)));
        assert_eq!(ExpireAfter::immediately().expires_at(now()), Some(now()));
    }

    #[test]
    fn test_is_immediate() {
        assert!(ExpireAfter::immediately().is_immediate(now()));
        assert!(ExpireAfter::At(now() - TimeDelta::seconds(1)).is_immediate(now()));
        assert!(!ExpireAfter::seconds(1).is_immediate(now()));
        assert!(!ExpireAfter::Never.is_immediate(now()));
    }

    #[test]
    fn test_parse_strings() {
        assert_eq!("never".parse::<ExpireAfter>().unwrap(), ExpireAfter::Never);
        assert_eq!("3600".parse::<ExpireAfter>().unwrap(), ExpireAfter::seconds(3600));
        assert_eq!(
            "Mon, 01 Jan 2024 00:00:00 GMT".parse::<ExpireAfter>().unwrap(),
            ExpireAfter::At(now())
        );
        assert_eq!("2024-01-01T00:00:00Z".parse::<ExpireAfter>().unwrap(), ExpireAfter::At(now()));
        assert!("soonish".parse::<ExpireAfter>().is_err());
    }

    #[test]
    fn test_naive_datetime_is_utc() {
        let naive = now().naive_utc();
        assert_eq!(ExpireAfter::from(naive), ExpireAfter::At(now()));
    }

    #[test]
    fn test_deserialize_shapes() {
        let v: ExpireAfter = serde_json::from_str("-1").unwrap();
        assert_eq!(v, ExpireAfter::Never);
        let v: ExpireAfter = serde_json::from_str("\"do_not_cache\"").unwrap();
        assert_eq!(v, ExpireAfter::DoNotCache);
        let s: StaleSetting = serde_json::from_str("true").unwrap();
        assert_eq!(s, StaleSetting::Any);
        let s: StaleSetting = serde_json::from_str("30").unwrap();
        assert_eq!(s, StaleSetting::Within(TimeDelta::seconds(30)));
    }

    #[test]
    fn test_stale_or() {
        assert_eq!(StaleSetting::Disabled.or(StaleSetting::Any), StaleSetting::Any);
        assert_eq!(StaleSetting::from(5).or(StaleSetting::Any), StaleSetting::from(5));
    }

    #[test]
    fn test_url_patterns_first_match_wins() {
        let patterns = vec![
            UrlExpiration::new("*.site_1.com", ExpireAfter::seconds(30)).unwrap(),
            UrlExpiration::new("site_2.com/resource_1", ExpireAfter::seconds(60)).unwrap(),
            UrlExpiration::new("site_2.com", ExpireAfter::Never).unwrap(),
        ];
        assert_eq!(url_expiration("https://img.site_1.com/a.png", &patterns), Some(ExpireAfter::seconds(30)));
        assert_eq!(
            url_expiration("http://site_2.com/resource_1/list?x=1", &patterns),
            Some(ExpireAfter::seconds(60))
        );
        assert_eq!(url_expiration("https://site_2.com/other", &patterns), Some(ExpireAfter::Never));
        assert_eq!(url_expiration("https://site_3.com", &patterns), None);
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(UrlExpiration::new("https://*", ExpireAfter::Never).is_err());
    }
}
