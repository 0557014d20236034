use std::time::Duration;

use anyhow::anyhow;
use nom::IResult;
use nom::character::complete::{char, digit1};
use nom::combinator::{all_consuming, map_res, opt};
use nom::sequence::{preceded, tuple};
use serde::{Deserialize, Deserializer, Serializer};

fn p_u32(input: &str) -> IResult<&str, u32> {
    map_res(digit1, |number: &str| number.parse::<u32>())(input)
}

fn p_hms_time(input: &str) -> IResult<&str, Duration> {
    map_res(
        tuple((
            p_u32,
            opt(preceded(char(':'), p_u32)),
            opt(preceded(char(':'), p_u32)),
        )),
        |parsed| match parsed {
            (seconds, None, None) => Ok(Duration::from_secs(seconds as u64)),
            (minutes, Some(seconds), None) => {
                Ok(Duration::from_secs(minutes as u64 * 60 + seconds as u64))
            }
            (hours, Some(minutes), Some(seconds)) => Ok(Duration::from_secs(
                hours as u64 * 3600 + minutes as u64 * 60 + seconds as u64,
            )),
            _ => Err(anyhow!("Invalid time specification")),
        },
    )(input)
}

/// Parses time strings in the format [[hh:]mm:]ss.
/// Individual time values may be zero padded.
pub fn parse_hms_time(input: &str) -> anyhow::Result<Duration> {
    all_consuming(p_hms_time)(input)
        .map(|(_, duration)| duration)
        .map_err(|error| anyhow!("Cannot parse `{input}` as [[HH:]MM:]SS: {error}"))
}

/// Allows specifying humantime format (2h, 3m, etc.) or HH:MM:SS.
pub fn parse_hms_or_human_time(text: &str) -> anyhow::Result<Duration> {
    parse_hms_time(text)
        .or_else(|_| humantime::parse_duration(text))
        .map_err(|e| {
            anyhow!(
                "Could not parse wall time. Use either `HH:MM:SS` or humantime format (2hours): {e:?}"
            )
        })
}

/// Format a duration as a scheduler time string, e.g. 01:05:02
pub fn format_hms_duration(duration: &Duration) -> String {
    let mut seconds = duration.as_secs();
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    seconds %= 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

pub fn deserialize_human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let buf = String::deserialize(deserializer)?;
    humantime::parse_duration(&buf).map_err(serde::de::Error::custom)
}

pub fn deserialize_human_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let buf = Option::<String>::deserialize(deserializer)?;
    match buf {
        Some(b) => humantime::parse_duration(&b)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

pub fn serialize_human_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

pub fn serialize_human_duration_opt<S>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(duration) => serialize_human_duration(duration, serializer),
        None => serializer.serialize_none(),
    }
}

#[cfg(not(test))]
pub fn now_monotonic() -> std::time::Instant {
    std::time::Instant::now()
}

#[cfg(test)]
pub use mock_time::now_monotonic;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hms_seconds() {
        assert_eq!(parse_hms_time("01").unwrap().as_secs(), 1);
        assert_eq!(parse_hms_time("1").unwrap().as_secs(), 1);
    }

    #[test]
    fn parse_hms_minutes() {
        assert_eq!(parse_hms_time("1:1").unwrap().as_secs(), 60 + 1);
        assert_eq!(parse_hms_time("80:02").unwrap().as_secs(), 80 * 60 + 2);
    }

    #[test]
    fn parse_hms_hours() {
        assert_eq!(parse_hms_time("1:1:1").unwrap().as_secs(), 3600 + 60 + 1);
        assert_eq!(
            parse_hms_time("02:03:04").unwrap().as_secs(),
            2 * 3600 + 3 * 60 + 4
        );
    }

    #[test]
    fn parse_hms_error() {
        assert!(parse_hms_time("x").is_err());
        assert!(parse_hms_time("1:2:3:4").is_err());
    }

    #[test]
    fn parse_wall_time() {
        assert_eq!(
            parse_hms_or_human_time("01:30:00").unwrap(),
            Duration::from_secs(90 * 60)
        );
        assert_eq!(
            parse_hms_or_human_time("2h").unwrap(),
            Duration::from_secs(2 * 3600)
        );
        assert!(parse_hms_or_human_time("soon").is_err());
    }

    #[test]
    fn format_duration() {
        assert_eq!(format_hms_duration(&Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_hms_duration(&Duration::from_secs(61)), "00:01:01");
        assert_eq!(format_hms_duration(&Duration::from_secs(3661)), "01:01:01");
        assert_eq!(format_hms_duration(&Duration::from_secs(100 * 3600)), "100:00:00");
    }
}
