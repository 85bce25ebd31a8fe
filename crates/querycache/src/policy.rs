use querycache_core::{CacheTag, ExpirationMode, QueryCacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Leading text of the comment line that carries a policy inside command text.
pub const MARKER_PREFIX: &str = "-- CachePolicy -->";
pub const PARTS_SEPARATOR: char = '|';
pub const TAGS_SEPARATOR: char = '_';

const NANOS_PER_TICK: u32 = 100;
const TICKS_PER_SECOND: u32 = 10_000_000;

/// Expiration, timeout, salt and explicit dependencies attached to one cached query.
///
/// Built once through [`CachePolicyBuilder`] and never mutated afterwards. Every
/// value the builder accepts survives `parse(embed(policy))` unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    expiration_mode: ExpirationMode,
    timeout: Option<Duration>,
    salt_key: String,
    dependency_tags: BTreeSet<CacheTag>,
    is_default: bool,
}

impl CachePolicy {
    pub fn builder() -> CachePolicyBuilder {
        CachePolicyBuilder::default()
    }

    pub fn absolute(timeout: Duration) -> Result<Self> {
        Self::builder().absolute(timeout).build()
    }

    pub fn sliding(timeout: Duration) -> Result<Self> {
        Self::builder().sliding(timeout).build()
    }

    pub fn never_remove() -> Self {
        Self {
            expiration_mode: ExpirationMode::NeverRemove,
            timeout: None,
            salt_key: String::new(),
            dependency_tags: BTreeSet::new(),
            is_default: false,
        }
    }

    pub fn expiration_mode(&self) -> ExpirationMode {
        self.expiration_mode
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn salt_key(&self) -> &str {
        &self.salt_key
    }

    /// Unprefixed table names the caller declared as dependencies.
    pub fn dependency_tags(&self) -> &BTreeSet<CacheTag> {
        &self.dependency_tags
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// Same policy with the global expiration and timeout substituted.
    pub fn with_expiration(&self, mode: ExpirationMode, timeout: Option<Duration>) -> Self {
        Self {
            expiration_mode: mode,
            timeout: timeout.map(truncate_to_ticks),
            ..self.clone()
        }
    }

    /// `CachePolicy --> mode|timeout|salt|tag1_tag2|isDefault`
    pub fn to_marker(&self) -> String {
        let tags = self
            .dependency_tags
            .iter()
            .map(CacheTag::as_str)
            .collect::<Vec<_>>()
            .join(&TAGS_SEPARATOR.to_string());
        format!(
            "{} {}{sep}{}{sep}{}{sep}{}{sep}{}",
            &MARKER_PREFIX[3..],
            self.expiration_mode,
            self.timeout.map(format_timespan).unwrap_or_default(),
            self.salt_key,
            tags,
            if self.is_default { "True" } else { "False" },
            sep = PARTS_SEPARATOR,
        )
    }

    /// Prepend the marker as a leading comment line.
    pub fn embed(&self, command_text: &str) -> String {
        format!("-- {}\n{}", self.to_marker(), command_text)
    }

    /// Read the marker line back. A missing or malformed marker yields `None`.
    pub fn parse(command_text: &str) -> Option<Self> {
        let start = command_text.find(MARKER_PREFIX)?;
        let rest = &command_text[start + MARKER_PREFIX.len()..];
        let line = rest.split('\n').next().unwrap_or(rest);
        let line = line.strip_suffix('\r').unwrap_or(line);
        let line = line.strip_prefix(' ').unwrap_or(line);

        let parts: Vec<&str> = line.split(PARTS_SEPARATOR).collect();
        if parts.len() < 2 {
            return None;
        }

        let mode: ExpirationMode = parts[0].parse().ok()?;
        let timeout = if parts[1].is_empty() {
            None
        } else {
            Some(parse_timespan(parts[1])?)
        };

        let mut builder = Self::builder().expiration(mode, timeout);
        if let Some(salt) = parts.get(2) {
            builder = builder.salt_key(*salt);
        }
        if let Some(tags) = parts.get(3).filter(|t| !t.is_empty()) {
            builder = builder.dependencies(tags.split(TAGS_SEPARATOR));
        }
        if let Some(flag) = parts.get(4) {
            let is_default = match flag.trim() {
                f if f.eq_ignore_ascii_case("true") => true,
                f if f.eq_ignore_ascii_case("false") => false,
                _ => return None,
            };
            builder = builder.default_policy(is_default);
        }

        builder.build().ok()
    }

    /// Strip the first marker line, prefix through its newline, leaving the rest untouched.
    pub fn remove_marker(command_text: &str) -> String {
        let Some(start) = command_text.find(MARKER_PREFIX) else {
            return command_text.to_string();
        };
        let end = command_text[start..]
            .find('\n')
            .map_or(command_text.len(), |i| start + i + 1);

        let mut stripped = String::with_capacity(command_text.len() - (end - start));
        stripped.push_str(&command_text[..start]);
        stripped.push_str(&command_text[end..]);
        stripped
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_marker())
    }
}

/// Fluent configurator for [`CachePolicy`].
#[derive(Debug, Clone, Default)]
pub struct CachePolicyBuilder {
    expiration_mode: ExpirationMode,
    timeout: Option<Duration>,
    salt_key: String,
    dependency_tags: Vec<String>,
    is_default: bool,
}

impl CachePolicyBuilder {
    pub fn expiration(mut self, mode: ExpirationMode, timeout: Option<Duration>) -> Self {
        self.expiration_mode = mode;
        self.timeout = timeout;
        self
    }

    pub fn absolute(self, timeout: Duration) -> Self {
        self.expiration(ExpirationMode::Absolute, Some(timeout))
    }

    pub fn sliding(self, timeout: Duration) -> Self {
        self.expiration(ExpirationMode::Sliding, Some(timeout))
    }

    pub fn never_remove(self) -> Self {
        self.expiration(ExpirationMode::NeverRemove, None)
    }

    /// Extra input to the cache key, e.g. to partition one query per user.
    pub fn salt_key(mut self, salt: impl Into<String>) -> Self {
        self.salt_key = salt.into();
        self
    }

    /// Tables this query depends on when they cannot be read off the command text.
    pub fn dependencies<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn default_policy(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }

    pub fn build(self) -> Result<CachePolicy> {
        match (self.expiration_mode, self.timeout) {
            (ExpirationMode::Absolute | ExpirationMode::Sliding, None) => {
                return Err(QueryCacheError::InvalidPolicy(format!(
                    "{} expiration requires a timeout",
                    self.expiration_mode
                )))
            }
            (_, Some(timeout)) if timeout > max_timespan() => {
                return Err(QueryCacheError::InvalidPolicy(format!(
                    "Timeout {:?} is out of range",
                    timeout
                )))
            }
            _ => {}
        }

        if self.salt_key.contains(|c: char| c == PARTS_SEPARATOR || c == '\n' || c == '\r') {
            return Err(QueryCacheError::InvalidPolicy(
                "Salt key must not contain '|' or line breaks".to_string(),
            ));
        }

        let mut dependency_tags = BTreeSet::new();
        for tag in self.dependency_tags {
            if tag.is_empty()
                || tag.contains(|c: char| {
                    c == TAGS_SEPARATOR || c == PARTS_SEPARATOR || c.is_whitespace()
                })
            {
                return Err(QueryCacheError::InvalidPolicy(format!(
                    "Invalid dependency tag '{}'",
                    tag
                )));
            }
            dependency_tags.insert(CacheTag::new(tag));
        }

        Ok(CachePolicy {
            expiration_mode: self.expiration_mode,
            timeout: self.timeout.map(truncate_to_ticks),
            salt_key: self.salt_key,
            dependency_tags,
            is_default: self.is_default,
        })
    }
}

fn max_timespan() -> Duration {
    // 99999999 days keeps the day component parseable as a u64 with room to spare
    Duration::from_secs(99_999_999 * 86_400)
}

fn truncate_to_ticks(duration: Duration) -> Duration {
    let nanos = duration.subsec_nanos() / NANOS_PER_TICK * NANOS_PER_TICK;
    Duration::new(duration.as_secs(), nanos)
}

/// `[d.]hh:mm:ss[.fffffff]`
pub fn format_timespan(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    let ticks = duration.subsec_nanos() / NANOS_PER_TICK;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{}.", days));
    }
    out.push_str(&format!("{:02}:{:02}:{:02}", hours, minutes, seconds));
    if ticks > 0 {
        out.push_str(&format!(".{:07}", ticks));
    }
    out
}

pub fn parse_timespan(text: &str) -> Option<Duration> {
    let text = text.trim();
    let (days, clock) = match text.split_once(':') {
        Some((head, _)) if head.contains('.') => {
            let (days, _) = text.split_once('.')?;
            (days.parse::<u64>().ok()?, &text[days.len() + 1..])
        }
        Some(_) => (0, text),
        None => return None,
    };

    let mut fields = clock.split(':');
    let hours: u64 = fields.next()?.parse().ok()?;
    let minutes: u64 = fields.next()?.parse().ok()?;
    let seconds_field = fields.next()?;
    if fields.next().is_some() || hours > 23 || minutes > 59 {
        return None;
    }

    let (seconds, fraction) = match seconds_field.split_once('.') {
        Some((s, f)) => (s, Some(f)),
        None => (seconds_field, None),
    };
    let seconds: u64 = seconds.parse().ok()?;
    if seconds > 59 {
        return None;
    }

    let nanos = match fraction {
        Some(f) if !f.is_empty() && f.len() <= 7 && f.bytes().all(|b| b.is_ascii_digit()) => {
            let ticks: u32 = format!("{:0<7}", f).parse().ok()?;
            debug_assert!(ticks < TICKS_PER_SECOND);
            ticks * NANOS_PER_TICK
        }
        Some(_) => return None,
        None => 0,
    };

    let secs = days
        .checked_mul(86_400)?
        .checked_add(hours * 3_600 + minutes * 60 + seconds)?;
    Some(Duration::new(secs, nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_format() {
        let policy = CachePolicy::builder()
            .absolute(Duration::from_secs(45 * 60))
            .build()
            .unwrap();
        assert_eq!(
            policy.to_marker(),
            "CachePolicy --> Absolute|00:45:00|||False"
        );
        assert_eq!(
            policy.embed("SELECT 1"),
            "-- CachePolicy --> Absolute|00:45:00|||False\nSELECT 1"
        );
    }

    #[test]
    fn test_parse_full_marker() {
        let text = "-- CachePolicy --> Sliding|1.02:03:04.5|user42|Products_Orders|True\nSELECT * FROM Products";
        let policy = CachePolicy::parse(text).unwrap();
        assert_eq!(policy.expiration_mode(), ExpirationMode::Sliding);
        assert_eq!(
            policy.timeout(),
            Some(Duration::new(86_400 + 2 * 3_600 + 3 * 60 + 4, 500_000_000))
        );
        assert_eq!(policy.salt_key(), "user42");
        let tags: Vec<&str> = policy.dependency_tags().iter().map(CacheTag::as_str).collect();
        assert_eq!(tags, vec!["Orders", "Products"]);
        assert!(policy.is_default());
    }

    #[test]
    fn test_parse_two_fields_is_enough() {
        let policy = CachePolicy::parse("-- CachePolicy --> Absolute|00:10:00\r\nSELECT 1").unwrap();
        assert_eq!(policy.timeout(), Some(Duration::from_secs(600)));
        assert!(!policy.is_default());
    }

    #[test]
    fn test_malformed_markers_yield_none() {
        assert!(CachePolicy::parse("SELECT 1").is_none());
        assert!(CachePolicy::parse("-- CachePolicy --> Absolute\nSELECT 1").is_none());
        assert!(CachePolicy::parse("-- CachePolicy --> Forever|00:10:00\nSELECT 1").is_none());
        assert!(CachePolicy::parse("-- CachePolicy --> Absolute|ten minutes\nSELECT 1").is_none());
        assert!(CachePolicy::parse("-- CachePolicy --> Absolute|\nSELECT 1").is_none());
        assert!(CachePolicy::parse("-- CachePolicy --> Absolute|00:61:00\nSELECT 1").is_none());
    }

    #[test]
    fn test_never_remove_round_trips_without_timeout() {
        let policy = CachePolicy::never_remove();
        assert_eq!(CachePolicy::parse(&policy.embed("SELECT 1")), Some(policy));
    }

    #[test]
    fn test_remove_marker() {
        let policy = CachePolicy::absolute(Duration::from_secs(60)).unwrap();
        let text = policy.embed("SELECT * FROM Products");
        assert_eq!(CachePolicy::remove_marker(&text), "SELECT * FROM Products");

        let unmarked = "SELECT * FROM Products";
        assert_eq!(CachePolicy::remove_marker(unmarked), unmarked);

        let trailing = "SELECT 1\n-- CachePolicy --> Absolute|00:01:00|||False";
        assert_eq!(CachePolicy::remove_marker(trailing), "SELECT 1\n");
    }

    #[test]
    fn test_builder_rejects_unrepresentable_values() {
        assert!(CachePolicy::builder().build().is_err());
        assert!(CachePolicy::builder()
            .never_remove()
            .salt_key("a|b")
            .build()
            .is_err());
        assert!(CachePolicy::builder()
            .never_remove()
            .dependencies(["EF_Products"])
            .build()
            .is_err());
        assert!(CachePolicy::builder()
            .never_remove()
            .dependencies([""])
            .build()
            .is_err());
    }

    #[test]
    fn test_timeout_is_truncated_to_ticks() {
        let policy = CachePolicy::absolute(Duration::new(1, 123_456_789)).unwrap();
        assert_eq!(policy.timeout(), Some(Duration::new(1, 123_456_700)));
        assert_eq!(CachePolicy::parse(&policy.embed("")), Some(policy));
    }

    #[test]
    fn test_timespan_formatting() {
        assert_eq!(format_timespan(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_timespan(Duration::from_secs(90_061)), "1.01:01:01");
        assert_eq!(parse_timespan("00:00:30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_timespan("2.00:00:00"), Some(Duration::from_secs(172_800)));
        assert_eq!(parse_timespan("00:00:01.25"), Some(Duration::from_millis(1_250)));
        assert_eq!(parse_timespan("5"), None);
    }
}
