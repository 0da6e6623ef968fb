//! Device status tracking.
//!
//! A device's disposition is modelled as an immutable [`DeviceStatus`]
//! snapshot. Snapshots are never mutated after construction; each poll that
//! observes a change pushes a fresh snapshot into the per-device
//! [`StatusHistory`] ring buffer. The history (bounded to
//! [`MAX_LOOKBACK`] steps) is what enables transition-pattern matching —
//! in particular telling a crash during acquisition apart from a graceful
//! stop or a transient network blip.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ScanError;

/// How many predecessor snapshots a chain walk may inspect.
pub const MAX_LOOKBACK: usize = 10;

/// Current wall-clock time as fractional epoch seconds.
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The closed set of states a device can report or be assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusName {
    Online,
    Offline,
    Running,
    Stopped,
    Unreached,
    Initialising,
    Stopping,
    Recording,
    Streaming,
    Busy,
}

impl StatusName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusName::Online => "online",
            StatusName::Offline => "offline",
            StatusName::Running => "running",
            StatusName::Stopped => "stopped",
            StatusName::Unreached => "unreached",
            StatusName::Initialising => "initialising",
            StatusName::Stopping => "stopping",
            StatusName::Recording => "recording",
            StatusName::Streaming => "streaming",
            StatusName::Busy => "busy",
        }
    }

    /// States in which an acquisition session is actively producing data.
    pub fn is_active_session(&self) -> bool {
        matches!(self, StatusName::Running | StatusName::Recording)
    }

    /// Transitional states a device passes through when it is interrupted
    /// rather than deliberately stopped.
    pub fn is_intermediate(&self) -> bool {
        matches!(
            self,
            StatusName::Unreached
                | StatusName::Busy
                | StatusName::Initialising
                | StatusName::Stopping
        )
    }
}

impl fmt::Display for StatusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusName {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(StatusName::Online),
            "offline" => Ok(StatusName::Offline),
            "running" => Ok(StatusName::Running),
            "stopped" => Ok(StatusName::Stopped),
            "unreached" => Ok(StatusName::Unreached),
            "initialising" => Ok(StatusName::Initialising),
            "stopping" => Ok(StatusName::Stopping),
            "recording" => Ok(StatusName::Recording),
            "streaming" => Ok(StatusName::Streaming),
            "busy" => Ok(StatusName::Busy),
            other => Err(ScanError::Validation(format!(
                "invalid status name: {other}"
            ))),
        }
    }
}

/// What caused a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    User,
    System,
    Network,
    Graceful,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerSource::User => "user",
            TriggerSource::System => "system",
            TriggerSource::Network => "network",
            TriggerSource::Graceful => "graceful",
        };
        f.write_str(s)
    }
}

/// Immutable snapshot of a device's disposition at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    #[serde(rename = "status_name")]
    pub name: StatusName,
    pub is_user_triggered: bool,
    pub trigger_source: TriggerSource,
    pub timestamp: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Set exactly when `name == Unreached`; carried forward across
    /// consecutive unreached snapshots so the timeout countdown survives
    /// re-polling.
    #[serde(default)]
    pub unreachable_start_time: Option<f64>,
    #[serde(default)]
    pub consecutive_errors: u32,
    /// First real status observed after startup; suppresses alerts that
    /// would otherwise fire merely because the node just learned about the
    /// device. Not part of the serialised shape.
    #[serde(skip)]
    pub is_initial_discovery: bool,
}

impl DeviceStatus {
    pub fn new(
        name: StatusName,
        is_user_triggered: bool,
        trigger_source: TriggerSource,
        metadata: Map<String, Value>,
    ) -> Self {
        let timestamp = epoch_now();
        DeviceStatus {
            name,
            is_user_triggered,
            trigger_source,
            timestamp,
            metadata,
            unreachable_start_time: (name == StatusName::Unreached).then_some(timestamp),
            consecutive_errors: 0,
            is_initial_discovery: false,
        }
    }

    /// System-triggered status with no metadata.
    pub fn system(name: StatusName) -> Self {
        Self::new(name, false, TriggerSource::System, Map::new())
    }

    pub fn is_graceful_operation(&self) -> bool {
        self.trigger_source == TriggerSource::Graceful
    }

    pub fn age_seconds(&self) -> f64 {
        epoch_now() - self.timestamp
    }

    pub fn age_minutes(&self) -> f64 {
        self.age_seconds() / 60.0
    }

    /// Whether the unreachable countdown has run past `timeout_minutes`.
    /// Only defined for snapshots carrying an `unreachable_start_time`.
    pub fn is_timeout_exceeded(&self, timeout_minutes: f64) -> bool {
        match self.unreachable_start_time {
            Some(start) => (epoch_now() - start) / 60.0 > timeout_minutes,
            None => false,
        }
    }
}

/// Bounded, strictly ordered history of status snapshots for one device.
///
/// Newest snapshot last. Holds the current snapshot plus up to
/// [`MAX_LOOKBACK`] predecessors; pattern matching never walks further.
#[derive(Debug, Clone)]
pub struct StatusHistory {
    entries: VecDeque<DeviceStatus>,
}

impl StatusHistory {
    pub fn new(initial: DeviceStatus) -> Self {
        let mut entries = VecDeque::with_capacity(MAX_LOOKBACK + 1);
        entries.push_back(initial);
        StatusHistory { entries }
    }

    pub fn current(&self) -> &DeviceStatus {
        self.entries.back().expect("history is never empty")
    }

    pub fn previous(&self) -> Option<&DeviceStatus> {
        let n = self.entries.len();
        if n >= 2 {
            self.entries.get(n - 2)
        } else {
            None
        }
    }

    /// Append a new snapshot, carrying the unreachable countdown forward
    /// when the device stays unreached across polls.
    pub fn push(&mut self, mut next: DeviceStatus) {
        let cur = self.current();
        if next.name == StatusName::Unreached && cur.name == StatusName::Unreached {
            next.unreachable_start_time = cur.unreachable_start_time;
        }
        self.entries.push_back(next);
        while self.entries.len() > MAX_LOOKBACK + 1 {
            self.entries.pop_front();
        }
    }

    /// How long the device has reported its current state, in minutes.
    /// Walks back through consecutive same-named snapshots so that
    /// re-observing a busy device does not restart its timeout.
    pub fn current_state_duration_minutes(&self) -> f64 {
        let name = self.current().name;
        let mut entered = self.current().timestamp;
        for status in self.entries.iter().rev().skip(1) {
            if status.name != name {
                break;
            }
            entered = status.timestamp;
        }
        (epoch_now() - entered) / 60.0
    }

    /// Detect the interrupted-tracking pattern:
    /// `{running, recording} -> (intermediate)* -> {stopped, offline}`.
    ///
    /// Both conditions must hold — an active session appears in the
    /// lookback window, and at least one intermediate state was crossed on
    /// the way down. A direct `running -> stopped` transition is a
    /// deliberate stop, not an interruption.
    pub fn is_interrupted_tracking_session(&self) -> bool {
        let cur = self.current();
        if !matches!(cur.name, StatusName::Stopped | StatusName::Offline) {
            return false;
        }

        let mut found_active_session = false;
        let mut went_through_intermediates = false;

        for status in self.entries.iter().rev().skip(1).take(MAX_LOOKBACK) {
            if status.name.is_active_session() {
                found_active_session = true;
                break;
            }
            if status.name.is_intermediate() {
                went_through_intermediates = true;
            }
        }

        found_active_session && went_through_intermediates
    }

    /// Decide whether the current state warrants an alert.
    ///
    /// Suppressed for user-triggered and graceful transitions and for the
    /// initial discovery of a device at startup. Fires for system-triggered
    /// stops, for interrupted tracking sessions ending in stopped/offline,
    /// and for devices stuck unreached past `unreachable_timeout_minutes`.
    pub fn should_send_alert(&self, unreachable_timeout_minutes: f64) -> bool {
        let cur = self.current();

        if cur.is_user_triggered {
            return false;
        }
        if cur.is_graceful_operation() {
            return false;
        }

        let is_final = matches!(cur.name, StatusName::Stopped | StatusName::Offline);

        if is_final && self.is_interrupted_tracking_session() {
            return true;
        }

        if is_final && cur.trigger_source == TriggerSource::System {
            return !cur.is_initial_discovery;
        }

        if cur.name == StatusName::Unreached
            && cur.is_timeout_exceeded(unreachable_timeout_minutes)
        {
            return !cur.is_initial_discovery;
        }

        false
    }
}

/// Control instructions a user can send to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Stream,
    Start,
    StartRecord,
    Stop,
    Poweroff,
    Reboot,
    Restart,
    Dumpdb,
    ConvertVideos,
    TestModule,
    Offline,
}

/// Instructions legal only from a stopped device.
const FROM_STOPPED: &[StatusName] = &[StatusName::Stopped];
/// `stop` is legal while the device is doing something stoppable.
const FROM_ACTIVE: &[StatusName] = &[
    StatusName::Streaming,
    StatusName::Running,
    StatusName::Recording,
];

impl Instruction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Instruction::Stream => "stream",
            Instruction::Start => "start",
            Instruction::StartRecord => "start_record",
            Instruction::Stop => "stop",
            Instruction::Poweroff => "poweroff",
            Instruction::Reboot => "reboot",
            Instruction::Restart => "restart",
            Instruction::Dumpdb => "dumpdb",
            Instruction::ConvertVideos => "convertvideos",
            Instruction::TestModule => "test_module",
            Instruction::Offline => "offline",
        }
    }

    /// The set of statuses from which this instruction may be sent.
    /// `offline` is reserved and cannot be sent from anywhere.
    pub fn allowed_from(&self) -> &'static [StatusName] {
        match self {
            Instruction::Stop => FROM_ACTIVE,
            Instruction::Offline => &[],
            _ => FROM_STOPPED,
        }
    }

    /// Power operations close the connection on the device side; the
    /// resulting transport error is expected and swallowed.
    pub fn is_power_operation(&self) -> bool {
        matches!(
            self,
            Instruction::Poweroff | Instruction::Reboot | Instruction::Restart
        )
    }

    /// Instructions that count as a deliberate stop when classifying a
    /// subsequent status change as user-triggered.
    pub fn is_stop_class(&self) -> bool {
        matches!(
            self,
            Instruction::Stop
                | Instruction::Poweroff
                | Instruction::Reboot
                | Instruction::Restart
        )
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Instruction {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Instruction::Stream),
            "start" => Ok(Instruction::Start),
            "start_record" => Ok(Instruction::StartRecord),
            "stop" => Ok(Instruction::Stop),
            "poweroff" => Ok(Instruction::Poweroff),
            "reboot" => Ok(Instruction::Reboot),
            "restart" => Ok(Instruction::Restart),
            "dumpdb" => Ok(Instruction::Dumpdb),
            "convertvideos" => Ok(Instruction::ConvertVideos),
            "test_module" => Ok(Instruction::TestModule),
            "offline" => Ok(Instruction::Offline),
            other => Err(ScanError::Validation(format!(
                "unknown instruction: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(name: StatusName, trigger: TriggerSource) -> DeviceStatus {
        DeviceStatus::new(name, trigger == TriggerSource::User, trigger, Map::new())
    }

    #[test]
    fn test_status_name_round_trip() {
        for name in [
            "online",
            "offline",
            "running",
            "stopped",
            "unreached",
            "initialising",
            "stopping",
            "recording",
            "streaming",
            "busy",
        ] {
            let parsed: StatusName = name.parse().expect("valid status");
            assert_eq!(parsed.as_str(), name);
        }
        assert!("rebooting".parse::<StatusName>().is_err());
    }

    #[test]
    fn test_unreached_sets_start_time() {
        let s = DeviceStatus::system(StatusName::Unreached);
        assert_eq!(s.unreachable_start_time, Some(s.timestamp));

        let s = DeviceStatus::system(StatusName::Offline);
        assert_eq!(s.unreachable_start_time, None);
    }

    #[test]
    fn test_unreachable_start_carried_across_polls() {
        let mut history = StatusHistory::new(DeviceStatus::system(StatusName::Running));
        let first = DeviceStatus::new(
            StatusName::Unreached,
            false,
            TriggerSource::Network,
            Map::new(),
        );
        let start = first.unreachable_start_time;
        history.push(first);

        // A later re-observation must not restart the countdown.
        history.push(DeviceStatus::new(
            StatusName::Unreached,
            false,
            TriggerSource::Network,
            Map::new(),
        ));
        assert_eq!(history.current().unreachable_start_time, start);
    }

    #[test]
    fn test_timeout_boundary() {
        let mut s = DeviceStatus::system(StatusName::Unreached);
        // 19 minutes ago: not yet past a 20 minute timeout.
        s.unreachable_start_time = Some(epoch_now() - 19.0 * 60.0);
        assert!(!s.is_timeout_exceeded(20.0));
        // 21 minutes ago: past it.
        s.unreachable_start_time = Some(epoch_now() - 21.0 * 60.0);
        assert!(s.is_timeout_exceeded(20.0));
        // No countdown running.
        let s = DeviceStatus::system(StatusName::Offline);
        assert!(!s.is_timeout_exceeded(0.0));
    }

    #[test]
    fn test_user_triggered_suppresses_alert() {
        let mut history = StatusHistory::new(status(StatusName::Running, TriggerSource::System));
        history.push(status(StatusName::Stopped, TriggerSource::User));
        assert!(!history.should_send_alert(20.0));
    }

    #[test]
    fn test_graceful_suppresses_alert() {
        let mut history = StatusHistory::new(status(StatusName::Stopped, TriggerSource::System));
        history.push(status(StatusName::Offline, TriggerSource::Graceful));
        assert!(!history.should_send_alert(20.0));
    }

    #[test]
    fn test_initial_discovery_suppresses_alert() {
        let mut history = StatusHistory::new(DeviceStatus::system(StatusName::Offline));
        let mut stopped = DeviceStatus::system(StatusName::Stopped);
        stopped.is_initial_discovery = true;
        history.push(stopped);
        assert!(!history.should_send_alert(20.0));
    }

    #[test]
    fn test_system_stop_sends_alert() {
        let mut history = StatusHistory::new(status(StatusName::Running, TriggerSource::System));
        history.push(status(StatusName::Stopped, TriggerSource::System));
        assert!(history.should_send_alert(20.0));
    }

    #[test]
    fn test_interrupted_tracking_detected() {
        // running -> unreached -> offline: a crash during acquisition.
        let mut history = StatusHistory::new(status(StatusName::Running, TriggerSource::System));
        history.push(status(StatusName::Unreached, TriggerSource::Network));
        history.push(status(StatusName::Offline, TriggerSource::System));
        assert!(history.is_interrupted_tracking_session());
        assert!(history.should_send_alert(20.0));
    }

    #[test]
    fn test_direct_stop_is_not_interrupted() {
        // running -> stopped without intermediates: deliberate.
        let mut history = StatusHistory::new(status(StatusName::Running, TriggerSource::System));
        history.push(status(StatusName::Stopped, TriggerSource::System));
        assert!(!history.is_interrupted_tracking_session());
    }

    #[test]
    fn test_no_active_session_is_not_interrupted() {
        // stopped -> unreached -> offline: the device was idle.
        let mut history = StatusHistory::new(status(StatusName::Stopped, TriggerSource::System));
        history.push(status(StatusName::Unreached, TriggerSource::Network));
        history.push(status(StatusName::Offline, TriggerSource::System));
        assert!(!history.is_interrupted_tracking_session());
    }

    #[test]
    fn test_lookback_is_bounded() {
        // Push an active session, then bury it under more than MAX_LOOKBACK
        // intermediates; the walk must no longer find it.
        let mut history = StatusHistory::new(status(StatusName::Running, TriggerSource::System));
        for _ in 0..(MAX_LOOKBACK + 2) {
            history.push(status(StatusName::Unreached, TriggerSource::Network));
        }
        history.push(status(StatusName::Offline, TriggerSource::System));
        assert!(!history.is_interrupted_tracking_session());
    }

    #[test]
    fn test_history_timestamps_monotonic() {
        let mut history = StatusHistory::new(DeviceStatus::system(StatusName::Offline));
        history.push(DeviceStatus::system(StatusName::Online));
        history.push(DeviceStatus::system(StatusName::Running));
        let mut last = 0.0;
        for s in history.entries.iter() {
            assert!(s.timestamp >= last);
            last = s.timestamp;
        }
    }

    #[test]
    fn test_unreached_past_timeout_alerts() {
        let mut history = StatusHistory::new(status(StatusName::Running, TriggerSource::System));
        let mut unreached = status(StatusName::Unreached, TriggerSource::Network);
        unreached.unreachable_start_time = Some(epoch_now() - 25.0 * 60.0);
        history.push(unreached);
        // The push carries the crafted start time because the previous entry
        // is not unreached.
        assert!(history.should_send_alert(20.0));
        assert!(!history.should_send_alert(30.0));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut s = DeviceStatus::new(
            StatusName::Unreached,
            true,
            TriggerSource::User,
            Map::new(),
        );
        s.metadata
            .insert("reason".into(), Value::String("test".into()));
        s.consecutive_errors = 3;

        let json = serde_json::to_string(&s).unwrap();
        let back: DeviceStatus = serde_json::from_str(&json).unwrap();

        assert_eq!(back.name, s.name);
        assert_eq!(back.is_user_triggered, s.is_user_triggered);
        assert_eq!(back.trigger_source, s.trigger_source);
        assert_eq!(back.timestamp, s.timestamp);
        assert_eq!(back.metadata, s.metadata);
        assert_eq!(back.unreachable_start_time, s.unreachable_start_time);
        assert_eq!(back.consecutive_errors, s.consecutive_errors);
    }

    #[test]
    fn test_instruction_allow_table() {
        assert_eq!(Instruction::Start.allowed_from(), &[StatusName::Stopped]);
        assert_eq!(
            Instruction::Stop.allowed_from(),
            &[
                StatusName::Streaming,
                StatusName::Running,
                StatusName::Recording
            ]
        );
        assert!(Instruction::Offline.allowed_from().is_empty());
        assert!(Instruction::Poweroff.is_power_operation());
        assert!(Instruction::Stop.is_stop_class());
        assert!(!Instruction::Start.is_stop_class());
    }

    #[test]
    fn test_instruction_parse() {
        assert_eq!(
            "start_record".parse::<Instruction>().unwrap(),
            Instruction::StartRecord
        );
        assert!("explode".parse::<Instruction>().is_err());
    }
}
