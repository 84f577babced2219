use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::errors::WorkflowError;
use super::types::WorkflowState;

/// Period used to bucket tag counters by last update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateFrequency {
    Year,
    Month,
    Week,
}

impl DateFrequency {
    pub fn bucket(&self, at: DateTime<Utc>) -> String {
        match self {
            DateFrequency::Year => at.format("%Y").to_string(),
            DateFrequency::Month => at.format("%Y-%m").to_string(),
            DateFrequency::Week => {
                let week = at.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
        }
    }
}

impl FromStr for DateFrequency {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "year" => Ok(DateFrequency::Year),
            "month" => Ok(DateFrequency::Month),
            "week" => Ok(DateFrequency::Week),
            other => Err(WorkflowError::InvalidArgument(format!(
                "unknown date frequency '{other}' (year, month or week)"
            ))),
        }
    }
}

impl fmt::Display for DateFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DateFrequency::Year => "year",
            DateFrequency::Month => "month",
            DateFrequency::Week => "week",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CounterQuery {
    pub org: Option<String>,
    /// Restrict to tags below this process tag (and the tag itself).
    pub process: Option<String>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub frequency: Option<DateFrequency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagCounter {
    pub org: String,
    pub tag: String,
    pub tag_name: String,
    pub period: Option<String>,
    pub count: usize,
}

/// Count rows per (org, tag, period). Names are filled in by the caller.
pub fn tally(states: &[WorkflowState], frequency: Option<DateFrequency>) -> Vec<TagCounter> {
    let mut counts: BTreeMap<(String, String, Option<String>), usize> = BTreeMap::new();
    for state in states {
        let period = frequency.map(|f| f.bucket(state.updated_at));
        *counts
            .entry((state.org.clone(), state.tag.clone(), period))
            .or_default() += 1;
    }

    counts
        .into_iter()
        .map(|((org, tag, period), count)| TagCounter {
            org,
            tag_name: tag.clone(),
            tag,
            period,
            count,
        })
        .collect()
}
