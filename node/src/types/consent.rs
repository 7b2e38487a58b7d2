//! Consent descriptors and the routing request they are matched against.
//!
//! A node publishes a [`ConsentDescriptor`] describing exactly what it is
//! willing to contribute: a CPU share, RAM and bandwidth limits, a daily
//! availability window, the weekdays it is online, the task types it
//! accepts and the minimum reward it expects. No work is routed to a node
//! unless the request matches its consent.
//!
//! All matching is a pure function of the descriptor, the request and a
//! supplied wall-clock instant; the `*_now` variants just read the clock.

use std::fmt;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use super::{Hash256, unix_now};

/// Kinds of inference work a node may accept.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "text_gen")]
    TextGeneration,
    #[serde(rename = "code_gen")]
    CodeGeneration,
    #[serde(rename = "summarization")]
    Summarization,
    #[serde(rename = "translation")]
    Translation,
    #[serde(rename = "embedding")]
    Embedding,
    /// Wildcard: a descriptor listing `Any` accepts every task type.
    #[serde(rename = "any")]
    Any,
}

/// Day of the week, serialized with three-letter lowercase names.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Day {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl Day {
    pub const ALL: [Day; 7] = [
        Day::Mon,
        Day::Tue,
        Day::Wed,
        Day::Thu,
        Day::Fri,
        Day::Sat,
        Day::Sun,
    ];
}

impl From<Weekday> for Day {
    fn from(w: Weekday) -> Self {
        match w {
            Weekday::Mon => Day::Mon,
            Weekday::Tue => Day::Tue,
            Weekday::Wed => Day::Wed,
            Weekday::Thu => Day::Thu,
            Weekday::Fri => Day::Fri,
            Weekday::Sat => Day::Sat,
            Weekday::Sun => Day::Sun,
        }
    }
}

/// Errors raised while parsing or validating a consent descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsentError {
    /// Schedule string is not of the form `HH:MM-HH:MM`.
    InvalidSchedule(String),
    /// A numeric limit is outside its allowed range.
    OutOfRange(&'static str),
}

impl fmt::Display for ConsentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsentError::InvalidSchedule(s) => {
                write!(f, "invalid schedule {s:?}, expected HH:MM-HH:MM")
            }
            ConsentError::OutOfRange(field) => write!(f, "consent field out of range: {field}"),
        }
    }
}

impl std::error::Error for ConsentError {}

/// Daily availability window in UTC, both ends inclusive.
///
/// When `end < start` the window wraps past midnight, e.g. `22:00-06:00`
/// covers late evening and early morning.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Schedule {
    start_minute: u16,
    end_minute: u16,
}

impl Schedule {
    /// Whole-day window, `00:00-23:59`.
    pub const ALWAYS: Schedule = Schedule {
        start_minute: 0,
        end_minute: 23 * 60 + 59,
    };

    pub fn parse(s: &str) -> Result<Self, ConsentError> {
        let invalid = || ConsentError::InvalidSchedule(s.to_string());
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start_minute = parse_hhmm(start).ok_or_else(invalid)?;
        let end_minute = parse_hhmm(end).ok_or_else(invalid)?;
        Ok(Self {
            start_minute,
            end_minute,
        })
    }

    /// Returns `true` if `minute_of_day` (0..1440) falls inside the window.
    pub fn covers(&self, minute_of_day: u16) -> bool {
        if self.end_minute > self.start_minute {
            self.start_minute <= minute_of_day && minute_of_day <= self.end_minute
        } else {
            minute_of_day >= self.start_minute || minute_of_day <= self.end_minute
        }
    }

    /// Returns `true` if the window wraps past midnight.
    pub fn is_overnight(&self) -> bool {
        self.end_minute <= self.start_minute
    }
}

fn parse_hhmm(s: &str) -> Option<u16> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

impl TryFrom<String> for Schedule {
    type Error = ConsentError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Schedule::parse(&s)
    }
}

impl From<Schedule> for String {
    fn from(s: Schedule) -> Self {
        s.to_string()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start_minute / 60,
            self.start_minute % 60,
            self.end_minute / 60,
            self.end_minute % 60
        )
    }
}

/// What a node is willing to contribute to the network.
///
/// The descriptor is published by its owner and read-only to peers. It is
/// immutable once published; an owner that changes its mind publishes a
/// new descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsentDescriptor {
    /// Max CPU usage, 1..=100.
    pub cpu_percent: u8,
    pub max_ram_mb: u64,
    pub max_bandwidth_mbps: f64,
    pub schedule: Schedule,
    pub days: Vec<Day>,
    pub task_types: Vec<TaskType>,
    pub max_concurrent_tasks: u32,
    /// Allow inference metadata logging.
    pub allow_logging: bool,
    pub allow_geo_tracking: bool,
    /// Minimum reward per inference, in bookkeeping units.
    pub min_reward_per_inference: f64,
    pub version: String,
    pub created_at: f64,
    pub node_id: Option<String>,
}

impl Default for ConsentDescriptor {
    fn default() -> Self {
        Self {
            cpu_percent: 25,
            max_ram_mb: 512,
            max_bandwidth_mbps: 10.0,
            schedule: Schedule::ALWAYS,
            days: Day::ALL.to_vec(),
            task_types: vec![TaskType::Any],
            max_concurrent_tasks: 2,
            allow_logging: true,
            allow_geo_tracking: false,
            min_reward_per_inference: 0.0,
            version: "1.0".to_string(),
            created_at: unix_now(),
            node_id: None,
        }
    }
}

impl ConsentDescriptor {
    /// Checks the numeric limits of the descriptor.
    pub fn validate(&self) -> Result<(), ConsentError> {
        if !(1..=100).contains(&self.cpu_percent) {
            return Err(ConsentError::OutOfRange("cpu_percent"));
        }
        if self.max_bandwidth_mbps.is_nan() || self.max_bandwidth_mbps < 0.0 {
            return Err(ConsentError::OutOfRange("max_bandwidth_mbps"));
        }
        if self.min_reward_per_inference.is_nan() || self.min_reward_per_inference < 0.0 {
            return Err(ConsentError::OutOfRange("min_reward_per_inference"));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(ConsentError::OutOfRange("max_concurrent_tasks"));
        }
        Ok(())
    }

    /// Returns `true` if `at` falls on an allowed weekday and inside the
    /// daily window.
    pub fn is_available_at(&self, at: DateTime<Utc>) -> bool {
        if !self.days.contains(&Day::from(at.weekday())) {
            return false;
        }
        let minute_of_day = (at.hour() * 60 + at.minute()) as u16;
        self.schedule.covers(minute_of_day)
    }

    pub fn is_available_now(&self) -> bool {
        self.is_available_at(Utc::now())
    }

    pub fn accepts_task(&self, task_type: TaskType) -> bool {
        self.task_types.contains(&TaskType::Any) || self.task_types.contains(&task_type)
    }

    /// Returns `true` only if every consent condition holds at `at`.
    pub fn matches_request_at(&self, request: &InferenceRequest, at: DateTime<Utc>) -> bool {
        self.is_available_at(at)
            && self.accepts_task(request.task_type)
            && request.ram_mb <= self.max_ram_mb
            && request.reward >= self.min_reward_per_inference
    }

    pub fn matches_request(&self, request: &InferenceRequest) -> bool {
        self.matches_request_at(request, Utc::now())
    }

    /// Content hash of the descriptor, suitable for publishing alongside it.
    pub fn to_hash(&self) -> Hash256 {
        // serde_json emits struct fields in declaration order, so this is
        // stable for a given descriptor.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        Hash256::compute(&bytes)
    }
}

impl fmt::Display for ConsentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "consent(cpu={}%, ram={}MB, schedule={}, tasks={})",
            self.cpu_percent,
            self.max_ram_mb,
            self.schedule,
            self.task_types.len()
        )
    }
}

/// A request for distributed inference, as seen by the router.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub request_id: String,
    pub query: String,
    pub model_id: String,
    pub task_type: TaskType,
    pub max_tokens: u32,
    pub temperature: f32,
    /// RAM the requester expects a stage to need.
    pub ram_mb: u64,
    /// Reward offered per inference, in bookkeeping units.
    pub reward: f64,
    pub timestamp: f64,
}

impl InferenceRequest {
    /// Builds a text-generation request with the reference resource asks.
    pub fn new(query: impl Into<String>, model_id: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            request_id: format!("req_{}", uuid::Uuid::new_v4().simple()),
            query: query.into(),
            model_id: model_id.into(),
            task_type: TaskType::TextGeneration,
            max_tokens,
            temperature: 0.7,
            ram_mb: 512,
            reward: 0.01,
            timestamp: unix_now(),
        }
    }

    pub fn to_hash(&self) -> Hash256 {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        Hash256::compute(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        // 2026-01-05 is a Monday.
        Utc.with_ymd_and_hms(2026, 1, 5, h, m, 0).unwrap()
    }

    fn request(task_type: TaskType, ram_mb: u64, reward: f64) -> InferenceRequest {
        InferenceRequest {
            task_type,
            ram_mb,
            reward,
            ..InferenceRequest::new("q", "aria-2b-1bit", 16)
        }
    }

    #[test]
    fn overnight_schedule_wraps_midnight() {
        let consent = ConsentDescriptor {
            schedule: Schedule::parse("22:00-06:00").unwrap(),
            ..ConsentDescriptor::default()
        };
        assert!(consent.schedule.is_overnight());
        assert!(consent.is_available_at(at(23, 30)));
        assert!(consent.is_available_at(at(5, 30)));
        assert!(!consent.is_available_at(at(12, 0)));
    }

    #[test]
    fn day_window_is_inclusive() {
        let consent = ConsentDescriptor {
            schedule: Schedule::parse("08:00-22:00").unwrap(),
            ..ConsentDescriptor::default()
        };
        assert!(consent.is_available_at(at(8, 0)));
        assert!(consent.is_available_at(at(22, 0)));
        assert!(!consent.is_available_at(at(22, 1)));
        assert!(!consent.is_available_at(at(7, 59)));
    }

    #[test]
    fn weekday_set_is_honoured() {
        let consent = ConsentDescriptor {
            days: vec![Day::Sat, Day::Sun],
            ..ConsentDescriptor::default()
        };
        assert!(!consent.is_available_at(at(12, 0)));

        let saturday = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        assert!(consent.is_available_at(saturday));
    }

    #[test]
    fn matching_checks_task_ram_and_reward() {
        let consent = ConsentDescriptor {
            task_types: vec![TaskType::CodeGeneration],
            max_ram_mb: 1024,
            min_reward_per_inference: 0.05,
            ..ConsentDescriptor::default()
        };
        let noon = at(12, 0);

        assert!(consent.matches_request_at(&request(TaskType::CodeGeneration, 512, 0.05), noon));
        assert!(!consent.matches_request_at(&request(TaskType::Translation, 512, 0.05), noon));
        assert!(!consent.matches_request_at(&request(TaskType::CodeGeneration, 2048, 0.05), noon));
        assert!(!consent.matches_request_at(&request(TaskType::CodeGeneration, 512, 0.01), noon));
    }

    #[test]
    fn any_task_type_accepts_everything() {
        let consent = ConsentDescriptor::default();
        assert!(consent.accepts_task(TaskType::Embedding));
        assert!(consent.accepts_task(TaskType::Summarization));
    }

    #[test]
    fn matching_is_deterministic() {
        let consent = ConsentDescriptor::default();
        let req = request(TaskType::TextGeneration, 256, 0.0);
        let first = consent.matches_request_at(&req, at(3, 3));
        for _ in 0..10 {
            assert_eq!(consent.matches_request_at(&req, at(3, 3)), first);
        }
    }

    #[test]
    fn schedule_rejects_malformed_strings() {
        assert!(Schedule::parse("8-22").is_err());
        assert!(Schedule::parse("24:00-01:00").is_err());
        assert!(Schedule::parse("10:60-11:00").is_err());
        assert_eq!(Schedule::parse(" 06:05-07:00 ").unwrap().to_string(), "06:05-07:00");
    }

    #[test]
    fn validate_catches_bad_limits() {
        let bad = ConsentDescriptor {
            cpu_percent: 0,
            ..ConsentDescriptor::default()
        };
        assert_eq!(bad.validate(), Err(ConsentError::OutOfRange("cpu_percent")));
        assert!(ConsentDescriptor::default().validate().is_ok());
    }

    #[test]
    fn json_form_uses_wire_names() {
        let consent = ConsentDescriptor {
            schedule: Schedule::parse("22:00-06:00").unwrap(),
            task_types: vec![TaskType::TextGeneration],
            days: vec![Day::Mon],
            ..ConsentDescriptor::default()
        };
        let json = serde_json::to_value(&consent).expect("serialize consent");
        assert_eq!(json["schedule"], "22:00-06:00");
        assert_eq!(json["task_types"][0], "text_gen");
        assert_eq!(json["days"][0], "mon");

        let back: ConsentDescriptor = serde_json::from_value(json).expect("deserialize consent");
        assert_eq!(back, consent);
        assert_eq!(back.to_hash(), consent.to_hash());
    }
}
