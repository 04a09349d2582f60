//! Maintenance window policies
//!
//! A policy is a JSON document with ordered rules and a default window.
//! Rules match a runtime by regular expressions over its account, plan and
//! regions; the first matching rule with an available window wins.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc,
};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::Path;
use thiserror::Error;

const TIME_ONLY_FORMAT: &str = "%H:%M:%S%:z";

/// Maintenance policy errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("maintenance policy doesn't exist: {0}")]
    PolicyNotExists(String),

    #[error("error during unmarshal: {0}")]
    JsonUnmarshal(String),

    #[error("matched policies did not provide a window")]
    NoWindowInPolicies,

    #[error("matches and defaults also failed to provide a window")]
    NoWindowFound,

    #[error("no maintenance policy configured")]
    NoPolicyConfigured,
}

/// Runtime attributes policies are matched against
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Runtime {
    pub global_account_id: String,
    pub plan: String,
    pub region: String,
    pub platform_region: String,
}

/// A concrete window in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedWindow {
    pub begin: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl ResolvedWindow {
    /// Whether `now` lies inside the window, begin inclusive
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.begin.with_timezone(&Utc) <= now && now < self.end.with_timezone(&Utc)
    }
}

impl fmt::Display for ResolvedWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ResolvedWindow {} - {}>", self.begin, self.end)
    }
}

/// Knobs for [`MaintenanceWindowPolicy::resolve`]
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    /// Time to resolve at
    pub time: DateTime<Utc>,
    /// Accept windows that already started
    pub ongoing: bool,
    /// With `ongoing`, the least time that must remain in the window
    pub min_duration: Duration,
    /// Stop at the first matching rule before trying the default
    pub first_match_only: bool,
    /// Fall back to the default when matching rules have no window
    pub fallback_default: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            time: Utc::now(),
            ongoing: false,
            min_duration: Duration::hours(1),
            first_match_only: true,
            fallback_default: true,
        }
    }
}

/// Parsed maintenance policy
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MaintenanceWindowPolicy {
    #[serde(default)]
    pub rules: Vec<MaintenancePolicyRule>,
    #[serde(default)]
    pub default: WindowSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MaintenancePolicyRule {
    #[serde(rename = "match", default)]
    pub matcher: MaintenancePolicyMatch,
    #[serde(default)]
    pub windows: Vec<WindowSpec>,
}

/// Regular expressions over runtime attributes; empty fields never match
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenancePolicyMatch {
    #[serde(rename = "globalAccountID", default, deserialize_with = "optional_regex")]
    pub global_account_id: Option<Regex>,
    #[serde(default, deserialize_with = "optional_regex")]
    pub plan: Option<Regex>,
    #[serde(default, deserialize_with = "optional_regex")]
    pub region: Option<Regex>,
    #[serde(default, deserialize_with = "optional_regex")]
    pub platform_region: Option<Regex>,
}

impl MaintenancePolicyMatch {
    /// True if any configured expression matches its non-empty runtime value
    pub fn matches(&self, runtime: &Runtime) -> bool {
        [
            (&self.global_account_id, &runtime.global_account_id),
            (&self.plan, &runtime.plan),
            (&self.region, &runtime.region),
            (&self.platform_region, &runtime.platform_region),
        ]
        .into_iter()
        .any(|(pattern, value)| match pattern {
            Some(re) => !value.is_empty() && re.is_match(value),
            None => false,
        })
    }
}

/// A window either at absolute times (no days) or at times of day on given weekdays
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WindowSpec {
    #[serde(default)]
    pub days: Vec<String>,
    #[serde(default)]
    pub begin: WindowTime,
    #[serde(default)]
    pub end: WindowTime,
}

/// RFC 3339 timestamp or `HH:MM:SS±HH:MM` time of day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowTime(pub DateTime<FixedOffset>);

impl Default for WindowTime {
    fn default() -> Self {
        WindowTime(epoch_of_day(NaiveTime::MIN, utc_offset()))
    }
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}

/// Time of day anchored at 0000-01-01, so it never lies in the future on its own
fn epoch_of_day(time: NaiveTime, offset: FixedOffset) -> DateTime<FixedOffset> {
    let date = NaiveDate::from_ymd_opt(0, 1, 1).unwrap_or(NaiveDate::MIN);
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC.with_timezone(&offset))
}

impl WindowTime {
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
            return Ok(WindowTime(t));
        }
        // chrono wants a date for offsets, so split the offset off by hand
        let parsed = raw
            .strip_suffix('Z')
            .map(|t| (t, Ok(utc_offset())))
            .or_else(|| {
                raw.len().checked_sub(6).and_then(|split| {
                    raw.is_char_boundary(split).then(|| {
                        let (time, offset) = raw.split_at(split);
                        (time, parse_offset(offset))
                    })
                })
            });
        if let Some((time, Ok(offset))) = parsed {
            if let Ok(time) = NaiveTime::parse_from_str(time, "%H:%M:%S") {
                return Ok(WindowTime(epoch_of_day(time, offset)));
            }
        }
        Err(PolicyError::JsonUnmarshal(format!(
            "Unable to parse value \"{raw}\" as ISO8601 or timeonly-with-tz ({TIME_ONLY_FORMAT})"
        )))
    }
}

fn parse_offset(raw: &str) -> Result<FixedOffset, PolicyError> {
    let invalid = || PolicyError::JsonUnmarshal(format!("invalid offset {raw}"));
    let (sign, rest) = if let Some(rest) = raw.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = raw.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(invalid());
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

impl<'de> Deserialize<'de> for WindowTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        WindowTime::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn optional_regex<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Regex>, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    if raw.is_empty() {
        return Ok(None);
    }
    Regex::new(&raw).map(Some).map_err(serde::de::Error::custom)
}

fn window_within(
    opts: &ResolveOptions,
    begin: DateTime<FixedOffset>,
    end: DateTime<FixedOffset>,
) -> Option<ResolvedWindow> {
    let available = if opts.ongoing {
        opts.time + opts.min_duration < end.with_timezone(&Utc)
    } else {
        opts.time < begin.with_timezone(&Utc)
    };
    available.then_some(ResolvedWindow { begin, end })
}

/// Same wall-clock time in the window's offset, on the calendar day of `now`
fn on_day(now: DateTime<Utc>, at: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    let date = now.date_naive();
    at.offset()
        .from_local_datetime(&date.and_time(at.time()))
        .single()
}

impl WindowSpec {
    /// Next window available under `opts`, looking at most a week ahead
    pub fn next_window(&self, opts: &ResolveOptions) -> Option<ResolvedWindow> {
        if self.days.is_empty() {
            return window_within(opts, self.begin.0, self.end.0);
        }

        let mut begin = on_day(opts.time, self.begin.0)?;
        let mut end = on_day(opts.time, self.end.0)?;
        let day = Duration::hours(24);
        if end <= begin {
            end += day;
        }

        for _ in 0..8 {
            let weekday = begin.weekday().to_string();
            if self.days.iter().any(|d| *d == weekday) {
                if let Some(window) = window_within(opts, begin, end) {
                    return Some(window);
                }
            }
            begin += day;
            end += day;
        }
        None
    }
}

impl MaintenanceWindowPolicy {
    /// Parse a policy document
    pub fn from_json(raw: &[u8]) -> Result<Self, PolicyError> {
        serde_json::from_slice(raw).map_err(|e| PolicyError::JsonUnmarshal(e.to_string()))
    }

    /// Load `{dir}/{name}.json`; an empty name means no policy
    pub fn load(dir: impl AsRef<Path>, name: &str) -> Result<Option<Self>, PolicyError> {
        if name.is_empty() {
            return Ok(None);
        }
        let path = dir.as_ref().join(format!("{name}.json"));
        let raw = std::fs::read(&path)
            .map_err(|_| PolicyError::PolicyNotExists(path.display().to_string()))?;
        Self::from_json(&raw).map(Some)
    }

    /// Find the next window for a runtime
    pub fn resolve(
        &self,
        runtime: &Runtime,
        opts: &ResolveOptions,
    ) -> Result<ResolvedWindow, PolicyError> {
        let mut matched = false;
        for rule in &self.rules {
            matched = rule.matcher.matches(runtime);
            if !matched {
                continue;
            }
            if let Some(window) = rule.windows.iter().find_map(|w| w.next_window(opts)) {
                return Ok(window);
            }
            if opts.first_match_only {
                break;
            }
        }

        if matched && !opts.fallback_default {
            return Err(PolicyError::NoWindowInPolicies);
        }

        self.default
            .next_window(opts)
            .ok_or(PolicyError::NoWindowFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = r#"{
        "rules": [
            {
                "match": {"plan": "trial|free"},
                "windows": [{"days": ["Mon","Tue","Wed","Thu","Fri","Sat","Sun"], "begin": "01:00:00+00:00", "end": "01:00:00+00:00"}]
            },
            {
                "match": {"region": "europe|eu-|uksouth"},
                "windows": [{"days": ["Sat"], "begin": "21:00:00+00:00", "end": "00:00:00+00:00"}]
            },
            {
                "match": {"globalAccountID": "^fixed$"},
                "windows": [{"begin": "2030-01-01T10:00:00Z", "end": "2030-01-01T12:00:00Z"}]
            }
        ],
        "default": {"days": ["Sat"], "begin": "21:00:00+00:00", "end": "23:00:00+00:00"}
    }"#;

    fn policy() -> MaintenanceWindowPolicy {
        MaintenanceWindowPolicy::from_json(POLICY.as_bytes()).unwrap()
    }

    fn at(rfc3339: &str) -> ResolveOptions {
        ResolveOptions {
            time: DateTime::parse_from_rfc3339(rfc3339)
                .unwrap()
                .with_timezone(&Utc),
            ..Default::default()
        }
    }

    fn ts(rfc3339: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap()
    }

    #[test]
    fn test_default_window_next_saturday() {
        // Wednesday
        let window = policy()
            .resolve(&Runtime::default(), &at("2024-01-03T12:00:00Z"))
            .unwrap();
        assert_eq!(window.begin, ts("2024-01-06T21:00:00Z"));
        assert_eq!(window.end, ts("2024-01-06T23:00:00Z"));
    }

    #[test]
    fn test_plan_rule_daily_window_spans_midnight() {
        let runtime = Runtime {
            plan: "trial".to_string(),
            ..Default::default()
        };
        let window = policy()
            .resolve(&runtime, &at("2024-01-03T12:00:00Z"))
            .unwrap();
        assert_eq!(window.begin, ts("2024-01-04T01:00:00Z"));
        assert_eq!(window.end, ts("2024-01-05T01:00:00Z"));
    }

    #[test]
    fn test_region_rule_crosses_midnight() {
        let runtime = Runtime {
            region: "europe-west".to_string(),
            ..Default::default()
        };
        let window = policy()
            .resolve(&runtime, &at("2024-01-03T12:00:00Z"))
            .unwrap();
        assert_eq!(window.begin, ts("2024-01-06T21:00:00Z"));
        assert_eq!(window.end, ts("2024-01-07T00:00:00Z"));
    }

    #[test]
    fn test_absolute_window_in_past_falls_back_to_default() {
        let runtime = Runtime {
            global_account_id: "fixed".to_string(),
            ..Default::default()
        };
        let future = policy()
            .resolve(&runtime, &at("2029-12-31T00:00:00Z"))
            .unwrap();
        assert_eq!(future.begin, ts("2030-01-01T10:00:00Z"));

        let past = policy()
            .resolve(&runtime, &at("2030-02-01T00:00:00Z"))
            .unwrap();
        assert_eq!(past.end.time(), NaiveTime::from_hms_opt(23, 0, 0).unwrap());

        let mut strict = at("2030-02-01T00:00:00Z");
        strict.fallback_default = false;
        assert_eq!(
            policy().resolve(&runtime, &strict),
            Err(PolicyError::NoWindowInPolicies)
        );
    }

    #[test]
    fn test_ongoing_window_needs_min_duration_left() {
        // Saturday 21:30, default window ends at 23:00
        let mut opts = at("2024-01-06T21:30:00Z");
        opts.ongoing = true;
        opts.min_duration = Duration::minutes(20);
        let window = policy().resolve(&Runtime::default(), &opts).unwrap();
        assert!(window.contains(opts.time));

        opts.min_duration = Duration::hours(2);
        let window = policy().resolve(&Runtime::default(), &opts).unwrap();
        assert!(!window.contains(opts.time));
        assert_eq!(window.begin, ts("2024-01-13T21:00:00Z"));
    }

    #[test]
    fn test_empty_matchers_never_match() {
        let matcher = MaintenancePolicyMatch {
            plan: Some(Regex::new(".*").unwrap()),
            ..Default::default()
        };
        assert!(!matcher.matches(&Runtime::default()));
        assert!(matcher.matches(&Runtime {
            plan: "azure".to_string(),
            ..Default::default()
        }));
    }

    #[test]
    fn test_invalid_documents() {
        assert!(matches!(
            MaintenanceWindowPolicy::from_json(br#"{"rules": [{"match": {"plan": "("}}]}"#),
            Err(PolicyError::JsonUnmarshal(_))
        ));
        assert!(matches!(
            MaintenanceWindowPolicy::from_json(br#"{"default": {"begin": "noon"}}"#),
            Err(PolicyError::JsonUnmarshal(_))
        ));
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("policy.json"), POLICY).unwrap();

        assert!(MaintenanceWindowPolicy::load(dir.path(), "").unwrap().is_none());
        assert!(MaintenanceWindowPolicy::load(dir.path(), "policy")
            .unwrap()
            .is_some());
        assert!(matches!(
            MaintenanceWindowPolicy::load(dir.path(), "missing"),
            Err(PolicyError::PolicyNotExists(_))
        ));
    }
}
