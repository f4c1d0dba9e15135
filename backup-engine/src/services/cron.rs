use chrono::{DateTime, Utc};
use croner::Cron;
use std::fmt;

use crate::error::InvalidScheduleError;

const ALIASES: &[(&str, &str)] = &[
    ("@yearly", "0 0 1 1 *"),
    ("@annually", "0 0 1 1 *"),
    ("@monthly", "0 0 1 * *"),
    ("@weekly", "0 0 * * 0"),
    ("@daily", "0 0 * * *"),
    ("@midnight", "0 0 * * *"),
    ("@hourly", "0 * * * *"),
];

/// A validated schedule: five-field cron or an `@` alias, evaluated in UTC.
pub struct CronSchedule {
    expression: String,
    cron: Cron,
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronSchedule")
            .field("expression", &self.expression)
            .finish()
    }
}

fn invalid(expression: &str, reason: impl Into<String>) -> InvalidScheduleError {
    InvalidScheduleError {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, InvalidScheduleError> {
        let trimmed = expression.trim();
        let pattern = if trimmed.starts_with('@') {
            let lower = trimmed.to_ascii_lowercase();
            ALIASES
                .iter()
                .find(|(alias, _)| *alias == lower)
                .map(|(_, pattern)| pattern.to_string())
                .ok_or_else(|| invalid(expression, "unknown alias"))?
        } else {
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() != 5 {
                return Err(invalid(
                    expression,
                    format!("expected 5 fields, got {}", fields.len()),
                ));
            }
            fields.join(" ")
        };

        let cron = Cron::new(&pattern)
            .parse()
            .map_err(|e| invalid(expression, e.to_string()))?;

        Ok(Self {
            expression: trimmed.to_string(),
            cron,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`, or `None` if the pattern never fires again.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut from = after;
        // Sub-second inputs can make the first match land on `after` itself.
        for _ in 0..2 {
            let next = self.cron.find_next_occurrence(&from, false).ok()?;
            if next > after {
                return Some(next);
            }
            from = next;
        }
        None
    }

    /// The next `count` fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut from = after;
        while out.len() < count {
            let Some(next) = self.next_after(from) else { break };
            out.push(next);
            from = next;
        }
        out
    }
}

/// Parse and require at least one future fire time; used before a task is persisted.
pub fn validate(expression: &str, now: DateTime<Utc>) -> Result<CronSchedule, InvalidScheduleError> {
    let schedule = CronSchedule::parse(expression)?;
    if schedule.next_after(now).is_none() {
        return Err(invalid(expression, "schedule never fires"));
    }
    Ok(schedule)
}
