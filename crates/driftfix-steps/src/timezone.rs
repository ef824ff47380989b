use chrono::{DateTime, FixedOffset, LocalResult, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use driftfix_common::Result;
use driftfix_db::SiteStore;
use tracing::warn;

/// Stored date format for post, comment and event columns.
pub const MYSQL_DATETIME: &str = "%Y-%m-%d %H:%M:%S";

/// A site's or event's timezone: a named zone, or a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SiteTimezone {
    Named(Tz),
    Offset(FixedOffset),
}

impl Default for SiteTimezone {
    fn default() -> Self {
        SiteTimezone::Named(Tz::UTC)
    }
}

impl SiteTimezone {
    /// Read the site's `timezone_string` option, falling back to `gmt_offset`,
    /// then UTC.
    pub fn load(store: &SiteStore) -> Result<Self> {
        let name = store.get_option("timezone_string")?;
        let offset = store.get_option("gmt_offset")?;
        Ok(Self::from_options(name.as_deref(), offset.as_deref()))
    }

    pub fn from_options(timezone_string: Option<&str>, gmt_offset: Option<&str>) -> Self {
        if let Some(name) = timezone_string.map(str::trim).filter(|s| !s.is_empty()) {
            match name.parse::<Tz>() {
                Ok(tz) => return SiteTimezone::Named(tz),
                Err(_) => warn!("unknown timezone_string {name:?}, falling back to gmt_offset"),
            }
        }

        gmt_offset
            .and_then(|s| s.trim().parse::<f64>().ok())
            .and_then(offset_from_hours)
            .map(SiteTimezone::Offset)
            .unwrap_or_default()
    }

    /// Parse an event timezone identifier: `Europe/Berlin`, `+05:30`,
    /// `UTC-3`, or `UTC+5.5`.
    pub fn parse(identifier: &str) -> Option<Self> {
        let s = identifier.trim();
        if s.is_empty() {
            return None;
        }
        if let Ok(tz) = s.parse::<Tz>() {
            return Some(SiteTimezone::Named(tz));
        }

        let offset = s.strip_prefix("UTC").unwrap_or(s);
        let (sign, rest) = match offset.as_bytes().first()? {
            b'+' => (1.0, &offset[1..]),
            b'-' => (-1.0, &offset[1..]),
            _ => return None,
        };
        let hours = match rest.split_once(':') {
            Some((h, m)) => h.parse::<f64>().ok()? + m.parse::<f64>().ok()? / 60.0,
            None => rest.parse::<f64>().ok()?,
        };
        offset_from_hours(sign * hours).map(SiteTimezone::Offset)
    }

    /// Convert a local wall-clock time to UTC. Ambiguous times resolve to the
    /// earlier instant; times skipped by a DST jump have no answer.
    pub fn to_utc(&self, local: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            SiteTimezone::Named(tz) => resolve(tz.from_local_datetime(&local)),
            SiteTimezone::Offset(offset) => resolve(offset.from_local_datetime(&local)),
        }
    }

    /// `to_utc` over the stored `YYYY-MM-DD HH:MM:SS` format.
    pub fn gmt_string(&self, local: &str) -> Option<String> {
        let local = NaiveDateTime::parse_from_str(local.trim(), MYSQL_DATETIME).ok()?;
        self.to_utc(local).map(|utc| utc.format(MYSQL_DATETIME).to_string())
    }

    /// The identifier written back into event metadata.
    pub fn identifier(&self) -> String {
        match self {
            SiteTimezone::Named(tz) => tz.name().to_string(),
            SiteTimezone::Offset(offset) => {
                let secs = offset.local_minus_utc();
                let sign = if secs < 0 { '-' } else { '+' };
                let secs = secs.abs();
                format!("{sign}{:02}:{:02}", secs / 3600, (secs % 3600) / 60)
            }
        }
    }
}

fn offset_from_hours(hours: f64) -> Option<FixedOffset> {
    if !hours.is_finite() {
        return None;
    }
    FixedOffset::east_opt((hours * 3600.0).round() as i32)
}

fn resolve<T: TimeZone>(local: LocalResult<DateTime<T>>) -> Option<NaiveDateTime> {
    local.earliest().map(|dt| dt.naive_utc())
}
