//! Job files: YAML frontmatter plus a markdown prompt body.
//!
//! ```text
//! ---
//! schedule: "0 7 * * *"
//! steps:
//!   - model: haiku
//!   - compact
//!   - prompt
//! ---
//! Summarise what happened overnight.
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::JobError;

/// Extension of job files, without the dot.
pub const JOB_EXTENSION: &str = "md";

/// One step of a job's pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawStep")]
pub enum Step {
    NewSession,
    Compact,
    Reload,
    /// Switch to the first model matching the query.
    Model(String),
    /// Send the job body as a prompt.
    Prompt,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStep {
    Name(String),
    Model { model: String },
}

impl TryFrom<RawStep> for Step {
    type Error = JobError;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        match raw {
            RawStep::Model { model } => Ok(Self::Model(model)),
            RawStep::Name(name) => match name.trim() {
                "new-session" => Ok(Self::NewSession),
                "compact" => Ok(Self::Compact),
                "reload" => Ok(Self::Reload),
                "prompt" => Ok(Self::Prompt),
                _ => Err(JobError::UnknownStep(name)),
            },
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewSession => write!(f, "new-session"),
            Self::Compact => write!(f, "compact"),
            Self::Reload => write!(f, "reload"),
            Self::Model(query) => write!(f, "model:{query}"),
            Self::Prompt => write!(f, "prompt"),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Frontmatter {
    schedule: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    steps: Option<Vec<Step>>,
    #[serde(default)]
    grace_period_ms: Option<u64>,
    #[serde(default)]
    session: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// A parsed job file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    /// Path relative to the job root without extension, `/`-separated.
    pub name: String,
    pub path: PathBuf,
    /// Cron expression as written in the file.
    pub schedule: String,
    pub enabled: bool,
    pub steps: Vec<Step>,
    /// Overrides the scheduler-wide grace period. `Some(0)` disables it.
    pub grace_period_ms: Option<u64>,
    /// Target session; the default session when absent.
    pub session: Option<String>,
    /// Markdown body, used as the text of a `prompt` step.
    pub body: String,
}

impl JobDefinition {
    /// Parse a job from file contents. The schedule is validated here so a
    /// bad expression rejects the whole file.
    pub fn parse(name: &str, path: &Path, content: &str) -> Result<Self, JobError> {
        let (yaml, body) = split_frontmatter(content).ok_or_else(|| JobError::MissingFrontmatter {
            path: path.to_path_buf(),
        })?;

        let frontmatter: Frontmatter =
            serde_yaml::from_str(yaml).map_err(|e| JobError::InvalidFrontmatter {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        parse_schedule(&frontmatter.schedule)?;

        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            schedule: frontmatter.schedule,
            enabled: frontmatter.enabled,
            steps: frontmatter.steps.unwrap_or_else(|| vec![Step::Prompt]),
            grace_period_ms: frontmatter.grace_period_ms,
            session: frontmatter.session.filter(|s| !s.trim().is_empty()),
            body: body.to_string(),
        })
    }

    /// Read and parse a job file.
    pub fn load(name: &str, path: &Path) -> Result<Self, JobError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(name, path, &content)
    }

    /// Text sent by a `prompt` step.
    pub fn prompt_text(&self) -> String {
        format!("[CRON:{}] {}", self.name, self.body.trim())
    }

    pub fn cron_schedule(&self) -> Result<cron::Schedule, JobError> {
        parse_schedule(&self.schedule)
    }
}

/// Split `---`-delimited frontmatter from the body. Tolerates a leading BOM
/// and CRLF line endings.
fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let (first, rest) = content.split_once('\n')?;
    if first.trim_end() != "---" {
        return None;
    }

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

/// Parse a 5-field (minute-first) or 6-field (seconds-first) cron
/// expression. Evaluated in local time by the scheduler.
pub fn parse_schedule(expression: &str) -> Result<cron::Schedule, JobError> {
    let normalized = normalize_cron(expression);
    cron::Schedule::from_str(&normalized).map_err(|e| JobError::InvalidSchedule {
        schedule: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Rewrite standard cron into the seconds-first dialect the `cron` crate
/// reads: prepend a seconds field to 5-field expressions and shift numeric
/// days of week from 0-7 (0 and 7 = Sunday) to 1-7 (1 = Sunday).
pub fn normalize_cron(expression: &str) -> String {
    let mut fields: Vec<String> = expression.split_whitespace().map(String::from).collect();
    if fields.len() == 5 {
        fields.insert(0, "0".to_string());
    }
    if fields.len() >= 6 {
        fields[5] = shift_day_of_week(&fields[5]);
    }
    fields.join(" ")
}

fn shift_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let shifted = match range.split_once('-') {
                Some((start, end)) => match (start.parse::<u8>(), end.parse::<u8>()) {
                    (Ok(0), Ok(7)) => "1-7".to_string(),
                    // 7 is Sunday again; split off the wrap so the range stays ascending
                    (Ok(start), Ok(7)) if start > 0 && step.is_none() => {
                        format!("{}-7,1", start + 1)
                    }
                    (Ok(start), Ok(end)) if start <= 7 && end <= 7 => {
                        format!("{}-{}", shift_day(start), shift_day(end))
                    }
                    _ => range.to_string(),
                },
                None => match range.parse::<u8>() {
                    Ok(day) if day <= 7 => shift_day(day).to_string(),
                    _ => range.to_string(),
                },
            };
            match step {
                Some(step) => format!("{shifted}/{step}"),
                None => shifted,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_day(day: u8) -> u8 {
    if day == 7 { 1 } else { day + 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Local, Timelike, Weekday};

    fn parse(content: &str) -> Result<JobDefinition, JobError> {
        JobDefinition::parse("daily/report", Path::new("/jobs/daily/report.md"), content)
    }

    #[test]
    fn parses_full_job() {
        let job = parse(
            "---\nschedule: \"0 7 * * *\"\nsteps:\n  - model: haiku\n  - compact\n  - new-session\n  - reload\n  - prompt\ngracePeriodMs: 0\nsession: work\n---\nCheck the inbox.\n",
        )
        .unwrap();

        assert_eq!(job.name, "daily/report");
        assert!(job.enabled);
        assert_eq!(
            job.steps,
            vec![
                Step::Model("haiku".into()),
                Step::Compact,
                Step::NewSession,
                Step::Reload,
                Step::Prompt,
            ]
        );
        assert_eq!(job.grace_period_ms, Some(0));
        assert_eq!(job.session.as_deref(), Some("work"));
        assert_eq!(job.prompt_text(), "[CRON:daily/report] Check the inbox.");
    }

    #[test]
    fn steps_default_to_prompt() {
        let job = parse("---\nschedule: \"*/5 * * * *\"\nenabled: false\n---\nbody").unwrap();
        assert_eq!(job.steps, vec![Step::Prompt]);
        assert!(!job.enabled);
        assert_eq!(job.session, None);
    }

    #[test]
    fn crlf_and_bom_are_tolerated() {
        let job = parse("\u{feff}---\r\nschedule: \"0 9 * * 1-5\"\r\n---\r\nHello\r\n").unwrap();
        assert_eq!(job.schedule, "0 9 * * 1-5");
        assert_eq!(job.prompt_text(), "[CRON:daily/report] Hello");
    }

    #[test]
    fn rejects_bad_files() {
        assert!(matches!(
            parse("no frontmatter here"),
            Err(JobError::MissingFrontmatter { .. })
        ));
        assert!(matches!(
            parse("---\nschedule: \"0 7 * * *\"\n"),
            Err(JobError::MissingFrontmatter { .. })
        ));
        assert!(matches!(
            parse("---\nenabled: true\n---\nno schedule"),
            Err(JobError::InvalidFrontmatter { .. })
        ));
        assert!(matches!(
            parse("---\nschedule: \"0 7 * * *\"\nsteps: [explode]\n---\n"),
            Err(JobError::InvalidFrontmatter { .. })
        ));
        assert!(matches!(
            parse("---\nschedule: \"every morning\"\n---\n"),
            Err(JobError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn normalises_standard_cron() {
        assert_eq!(normalize_cron("0 7 * * *"), "0 0 7 * * *");
        assert_eq!(normalize_cron("30 0 7 * * *"), "30 0 7 * * *");
        assert_eq!(normalize_cron("0 9 * * 1-5"), "0 0 9 * * 2-6");
        assert_eq!(normalize_cron("0 9 * * 0,6"), "0 0 9 * * 1,7");
        assert_eq!(normalize_cron("0 9 * * 7"), "0 0 9 * * 1");
        assert_eq!(normalize_cron("0 9 * * 5-7"), "0 0 9 * * 6-7,1");
        assert_eq!(normalize_cron("0 9 * * MON-FRI"), "0 0 9 * * MON-FRI");
        assert_eq!(normalize_cron("0 9 * * */2"), "0 0 9 * * */2");
    }

    #[test]
    fn weekday_schedule_fires_on_weekdays() {
        let schedule = parse_schedule("0 9 * * 1-5").unwrap();
        for next in schedule.upcoming(Local).take(10) {
            assert!(!matches!(next.weekday(), Weekday::Sat | Weekday::Sun));
            assert_eq!((next.hour(), next.minute(), next.second()), (9, 0, 0));
        }
    }

    #[test]
    fn sunday_is_zero() {
        let schedule = parse_schedule("0 12 * * 0").unwrap();
        for next in schedule.upcoming(Local).take(3) {
            assert_eq!(next.weekday(), Weekday::Sun);
        }
    }

    #[test]
    fn step_display() {
        assert_eq!(Step::Model("haiku".into()).to_string(), "model:haiku");
        assert_eq!(Step::NewSession.to_string(), "new-session");
    }
}
