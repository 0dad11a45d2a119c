//! Cron expressions and the driver that posts synthetic rule fires
//!
//! Accepts standard five-field cron, the `@hourly`/`@daily`/`@weekly`/
//! `@monthly`/`@yearly` shortcuts, `@every <duration>` with Go-style
//! durations (`500ms`, `10s`, `1h30m`), and `@reboot` (fires once when
//! the driver schedules it).

use crate::error::RuleError;
use crate::rule::RuleId;
use chrono::Local;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Parsed cron specification
#[derive(Debug, Clone)]
pub enum CronSpec {
    /// Wall-clock schedule
    Schedule(Box<Schedule>),
    /// Fixed interval
    Every(Duration),
    /// Fire once at scheduling time
    Reboot,
}

impl CronSpec {
    /// Parse a cron expression.
    pub fn parse(expr: &str) -> Result<CronSpec, RuleError> {
        let expr = expr.trim();
        if expr == "@reboot" {
            return Ok(CronSpec::Reboot);
        }
        if let Some(dur) = expr.strip_prefix("@every ") {
            return parse_duration(dur.trim()).map(CronSpec::Every).ok_or_else(|| {
                RuleError::InvalidCron {
                    expr: expr.to_string(),
                    reason: "bad duration".to_string(),
                }
            });
        }
        // the Schedule parser wants a seconds field; prepend one for the
        // standard five-field form
        let normalized = if expr.starts_with('@') {
            expr.to_string()
        } else if expr.split_whitespace().count() == 5 {
            format!("0 {expr}")
        } else {
            expr.to_string()
        };
        Schedule::from_str(&normalized)
            .map(|s| CronSpec::Schedule(Box::new(s)))
            .map_err(|e| RuleError::InvalidCron {
                expr: expr.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Parse a Go-style duration: concatenated `<number><unit>` terms with
/// units `ms`, `s`, `m`, `h`, `d`.
fn parse_duration(s: &str) -> Option<Duration> {
    if s.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits_end == 0 {
            return None;
        }
        let value: u64 = rest[..digits_end].parse().ok()?;
        rest = &rest[digits_end..];
        let (unit, tail) = if let Some(tail) = rest.strip_prefix("ms") {
            (Duration::from_millis(value), tail)
        } else if let Some(tail) = rest.strip_prefix('s') {
            (Duration::from_secs(value), tail)
        } else if let Some(tail) = rest.strip_prefix('m') {
            (Duration::from_secs(value * 60), tail)
        } else if let Some(tail) = rest.strip_prefix('h') {
            (Duration::from_secs(value * 3600), tail)
        } else if let Some(tail) = rest.strip_prefix('d') {
            (Duration::from_secs(value * 86400), tail)
        } else {
            return None;
        };
        total += unit;
        rest = tail;
    }
    Some(total)
}

type FireFn = Arc<dyn Fn(RuleId) + Send + Sync>;

/// Schedules cron rules and posts their fires to the engine
pub struct CronDriver {
    rt: tokio::runtime::Handle,
    on_fire: FireFn,
    tasks: Vec<JoinHandle<()>>,
}

impl CronDriver {
    #[must_use]
    pub fn new(rt: tokio::runtime::Handle, on_fire: FireFn) -> Self {
        Self {
            rt,
            on_fire,
            tasks: Vec::new(),
        }
    }

    /// Replace the scheduled entries; called whenever script loading
    /// completes, including on error paths (a partial load may have
    /// created cron rules that must stay active).
    pub fn reschedule(&mut self, entries: Vec<(RuleId, CronSpec)>) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for (rule_id, spec) in entries {
            let on_fire = Arc::clone(&self.on_fire);
            let task = match spec {
                CronSpec::Reboot => self.rt.spawn(async move {
                    on_fire(rule_id);
                }),
                CronSpec::Every(interval) => self.rt.spawn(async move {
                    loop {
                        tokio::time::sleep(interval).await;
                        on_fire(rule_id);
                    }
                }),
                CronSpec::Schedule(schedule) => self.rt.spawn(async move {
                    loop {
                        let now = Local::now();
                        let Some(next) = schedule.upcoming(Local).next() else {
                            tracing::warn!("no upcoming times for cron rule {}", rule_id);
                            break;
                        };
                        let wait = (next - now)
                            .to_std()
                            .unwrap_or(Duration::from_secs(1));
                        tokio::time::sleep(wait).await;
                        on_fire(rule_id);
                        // step past the minute boundary to avoid double-firing
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }),
            };
            self.tasks.push(task);
        }
    }
}

impl Drop for CronDriver {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
