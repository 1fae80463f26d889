//! Five-field crontab expressions on top of the `cron` crate.
//!
//! The crate wants a seconds field and numbers weekdays 1-7 from Sunday, so
//! expressions are normalized before parsing.

use std::str::FromStr;

use chrono::{DateTime, TimeZone};
use cron::Schedule;

use crate::error::{EngineError, Result};

const WEEKDAY_FIELD: usize = 4;

/// Parse a standard `minute hour day month weekday` expression.
pub fn parse(expression: &str) -> Result<Schedule> {
    let invalid = |reason: String| EngineError::InvalidSchedule {
        expression: expression.to_string(),
        reason,
    };

    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(invalid(format!("expected 5 fields, got {}", fields.len())));
    }

    let mut normalized = Vec::with_capacity(6);
    normalized.push("0".to_string());
    for (i, field) in fields.iter().enumerate() {
        if i == WEEKDAY_FIELD {
            normalized.push(translate_weekdays(field).map_err(invalid)?);
        } else {
            normalized.push((*field).to_string());
        }
    }

    Schedule::from_str(&normalized.join(" ")).map_err(|e| invalid(e.to_string()))
}

/// Check an expression without keeping the parsed schedule.
pub fn validate(expression: &str) -> Result<()> {
    parse(expression).map(|_| ())
}

/// Next fire time strictly after `after`, in the same timezone.
pub fn next_after<Tz: TimeZone>(expression: &str, after: &DateTime<Tz>) -> Result<DateTime<Tz>> {
    parse(expression)?
        .after(after)
        .next()
        .ok_or_else(|| EngineError::InvalidSchedule {
            expression: expression.to_string(),
            reason: "no future occurrence".into(),
        })
}

/// Map crontab weekday numbers (0-7, Sunday at both ends) to 1-7 from Sunday.
fn translate_weekdays(field: &str) -> std::result::Result<String, String> {
    field
        .split(',')
        .map(translate_weekday_part)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map(|parts| parts.join(","))
}

fn translate_weekday_part(part: &str) -> std::result::Result<String, String> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (part, None),
    };
    let with_step = |range: String| match step {
        Some(step) => format!("{range}/{step}"),
        None => range,
    };

    if range == "*" || range == "?" {
        return Ok(with_step(range.to_string()));
    }

    match range.split_once('-') {
        Some((start, end)) => {
            let (Some(start), Some(end)) = (weekday_number(start)?, weekday_number(end)?) else {
                // Named ranges like MON-FRI are already understood by the parser.
                return Ok(with_step(range.to_string()));
            };
            if start > end {
                return Err(format!("weekday range '{range}' is reversed"));
            }
            match (start, end) {
                (0, 7) => Ok(with_step("1-7".to_string())),
                (7, 7) => Ok(with_step("1".to_string())),
                // Sunday at the end of the week becomes the first day.
                (start, 7) if step.is_none() => Ok(format!("{}-7,1", start + 1)),
                (_, 7) => Err(format!("stepped weekday range '{range}' ends on Sunday")),
                (start, end) => Ok(with_step(format!("{}-{}", start + 1, end + 1))),
            }
        }
        None => match weekday_number(range)? {
            Some(day) => Ok(with_step((day % 7 + 1).to_string())),
            None => Ok(with_step(range.to_string())),
        },
    }
}

fn weekday_number(token: &str) -> std::result::Result<Option<u32>, String> {
    if !token.chars().all(|c| c.is_ascii_digit()) || token.is_empty() {
        return Ok(None);
    }
    match token.parse::<u32>() {
        Ok(n) if n <= 7 => Ok(Some(n)),
        _ => Err(format!("weekday '{token}' out of range 0-7")),
    }
}
