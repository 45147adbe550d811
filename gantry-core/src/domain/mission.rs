//! Mission domain types
//!
//! A mission is a named, ordered list of shell actions the coordinator can
//! dispatch as a job, optionally restricted to specific slaves and optionally
//! fired on a recurring schedule.

use std::collections::{BTreeSet, HashMap};

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::collection::Identifiable;
use crate::domain::job::Job;

/// Mission definition
///
/// Structure shared between the coordinator (persists, dispatches) and the
/// agent (executes a snapshot taken at dispatch time). Mutation happens only
/// through the registry setters, which write through to the store and emit a
/// change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mission {
    /// Unique id of the form `mission<N>`, lowest free N first.
    pub id: String,
    pub name: String,
    /// Shell interpreter string, e.g. "sh" or "/bin/bash". Action commands
    /// are written to its stdin.
    pub shell: String,
    pub actions: Vec<Action>,
    /// Slave names this mission is restricted to. Empty means any
    /// general-purpose slave may take it.
    #[serde(default)]
    pub assigned_slaves: Vec<String>,
    /// Environment variables injected into every action subprocess.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    /// Ordered job history, oldest first.
    #[serde(default)]
    pub jobs: Vec<Job>,
}

impl Mission {
    /// Whether `slave` may take this mission's jobs.
    ///
    /// An unrestricted mission matches any general-purpose slave; a
    /// restricted mission matches only the slaves it names, regardless of
    /// their applicability.
    pub fn accepts_slave(&self, name: &str, general_purpose: bool) -> bool {
        if self.assigned_slaves.is_empty() {
            general_purpose
        } else {
            self.assigned_slaves.iter().any(|s| s == name)
        }
    }

    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == job_id)
    }

    pub fn job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == job_id)
    }
}

impl Identifiable for Mission {
    fn id(&self) -> &str {
        &self.id
    }
}

/// One shell command belonging to a mission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// Command text fed to the shell's stdin.
    pub command: String,
    /// Human description shown alongside results.
    pub description: String,
    /// Seconds before the action subprocess is killed. 0 = unbounded.
    #[serde(default)]
    pub timeout: u64,
}

impl Action {
    pub fn new(command: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            description: description.into(),
            timeout: 0,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }
}

/// Recurring time-of-week pattern used to auto-enqueue jobs
///
/// An empty set for any field means "match any value of that field"; a
/// schedule matches a given wall-clock minute iff all three fields match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Days of week, 0 = Sunday .. 6 = Saturday.
    #[serde(default)]
    pub days: BTreeSet<u32>,
    /// Hours of day, 0-23.
    #[serde(default)]
    pub hours: BTreeSet<u32>,
    /// Minutes, 0-59.
    #[serde(default)]
    pub minutes: BTreeSet<u32>,
}

impl ScheduleSpec {
    /// Whether this schedule fires at the given wall-clock minute.
    pub fn matches(&self, time: NaiveDateTime) -> bool {
        field_matches(&self.days, time.weekday().num_days_from_sunday())
            && field_matches(&self.hours, time.hour())
            && field_matches(&self.minutes, time.minute())
    }
}

fn field_matches(set: &BTreeSet<u32>, value: u32) -> bool {
    set.is_empty() || set.contains(&value)
}
