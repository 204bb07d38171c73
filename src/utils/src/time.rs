use chrono::format::StrftimeItems;
use chrono::{DateTime, NaiveDateTime};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

pub fn unix_nano_to_time(unix_nano: i64) -> NaiveDateTime {
    let secs = unix_nano.div_euclid(NANOS_PER_SECOND);
    let nsecs = unix_nano.rem_euclid(NANOS_PER_SECOND);
    NaiveDateTime::from_timestamp_opt(secs, nsecs as u32).unwrap_or_default()
}

pub fn time_format(dt: NaiveDateTime) -> String {
    let fmt = StrftimeItems::new("%Y-%m-%d %H:%M:%S");
    format!("{}", dt.format_with_items(fmt))
}

/// parse_rfc3339_nanos parses an RFC3339 timestamp into Unix nanoseconds.
pub fn parse_rfc3339_nanos(s: &str) -> anyhow::Result<i64> {
    let dt = DateTime::parse_from_rfc3339(s).map_err(|e| anyhow!("invalid time '{}': {}", s, e))?;
    dt.timestamp_nanos_opt()
        .ok_or_else(|| anyhow!("time '{}' out of range", s))
}

/// truncate_nanos rounds `t` down to a multiple of `d`, in UTC wall time.
pub fn truncate_nanos(t: i64, d: i64) -> i64 {
    if d <= 0 {
        return t;
    }
    t.div_euclid(d) * d
}

/// parse_duration parses a Go-style duration string such as `168h`, `30m`,
/// `10s` or `7d` into nanoseconds. Multiple segments compose (`1h30m`).
pub fn parse_duration(s: &str) -> anyhow::Result<i64> {
    if s == "0" {
        return Ok(0);
    }

    let mut total: i64 = 0;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        if digits.is_empty() {
            return Err(anyhow!("invalid duration '{}'", s));
        }
        let n: i64 = digits.parse()?;
        digits.clear();

        let mut unit = String::from(c);
        // two-letter units: ns, us, ms
        if c == 'n' || c == 'u' || c == 'm' {
            if let Some('s') = chars.peek() {
                unit.push(chars.next().unwrap());
            }
        }
        let mult: i64 = match unit.as_str() {
            "ns" => 1,
            "us" => 1_000,
            "ms" => 1_000_000,
            "s" => NANOS_PER_SECOND,
            "m" => 60 * NANOS_PER_SECOND,
            "h" => 3600 * NANOS_PER_SECOND,
            "d" => 24 * 3600 * NANOS_PER_SECOND,
            "w" => 7 * 24 * 3600 * NANOS_PER_SECOND,
            _ => return Err(anyhow!("invalid duration unit '{}' in '{}'", unit, s)),
        };
        total = total
            .checked_add(n.checked_mul(mult).ok_or_else(|| anyhow!("duration '{}' overflows", s))?)
            .ok_or_else(|| anyhow!("duration '{}' overflows", s))?;
    }

    if !digits.is_empty() {
        return Err(anyhow!("missing unit in duration '{}'", s));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3600 * NANOS_PER_SECOND;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("0").unwrap(), 0);
        assert_eq!(parse_duration("168h").unwrap(), 168 * HOUR);
        assert_eq!(parse_duration("7d").unwrap(), 168 * HOUR);
        assert_eq!(parse_duration("1w").unwrap(), 168 * HOUR);
        assert_eq!(parse_duration("1h30m").unwrap(), HOUR + 30 * 60 * NANOS_PER_SECOND);
        assert_eq!(parse_duration("500ms").unwrap(), 500_000_000);
        assert!(parse_duration("12").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("12x").is_err());
    }

    #[test]
    fn test_truncate_nanos() {
        let sd = 24 * HOUR;
        assert_eq!(truncate_nanos(0, sd), 0);
        assert_eq!(truncate_nanos(sd - 1, sd), 0);
        assert_eq!(truncate_nanos(sd, sd), sd);
        assert_eq!(truncate_nanos(sd + 1, sd), sd);
        // times before the epoch truncate toward negative infinity
        assert_eq!(truncate_nanos(-1, sd), -sd);
    }

    #[test]
    fn test_parse_rfc3339_nanos() {
        assert_eq!(
            parse_rfc3339_nanos("1970-01-01T00:00:00Z").unwrap(),
            0
        );
        assert_eq!(
            parse_rfc3339_nanos("2024-01-01T00:00:00Z").unwrap(),
            1_704_067_200 * NANOS_PER_SECOND
        );
        assert!(parse_rfc3339_nanos("not-a-time").is_err());
    }
}
