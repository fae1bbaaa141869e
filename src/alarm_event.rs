use crate::catalog::Severity;
use crate::code_band::AlarmStatus;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Numbering scheme an alarm index belongs to. Bitfield indices and
/// banded code numbers are unrelated even when the values coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexSpace {
    Bit,
    Code,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlarmEvent {
    Triggered {
        index: usize,
        space: IndexSpace,
        description: String,
        severity: Severity,
        timestamp: DateTime<Utc>,
    },
    // Only produced by banded codes, the bitfield carries no acknowledge state
    Acknowledged {
        index: usize,
        space: IndexSpace,
        active: bool,
        timestamp: DateTime<Utc>,
    },
    Cleared {
        index: usize,
        space: IndexSpace,
        timestamp: DateTime<Utc>,
    },
}

impl AlarmEvent {
    pub fn index(&self) -> usize {
        match self {
            AlarmEvent::Triggered { index, .. }
            | AlarmEvent::Acknowledged { index, .. }
            | AlarmEvent::Cleared { index, .. } => *index,
        }
    }

    pub fn space(&self) -> IndexSpace {
        match self {
            AlarmEvent::Triggered { space, .. }
            | AlarmEvent::Acknowledged { space, .. }
            | AlarmEvent::Cleared { space, .. } => *space,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AlarmEvent::Triggered { timestamp, .. }
            | AlarmEvent::Acknowledged { timestamp, .. }
            | AlarmEvent::Cleared { timestamp, .. } => *timestamp,
        }
    }

    /// Status band equivalent of the event
    pub fn status(&self) -> AlarmStatus {
        match self {
            AlarmEvent::Triggered { .. } => AlarmStatus::Active,
            AlarmEvent::Acknowledged { active: true, .. } => AlarmStatus::AcknowledgedActive,
            AlarmEvent::Acknowledged { active: false, .. } => AlarmStatus::AcknowledgedInactive,
            AlarmEvent::Cleared { .. } => AlarmStatus::Cleared,
        }
    }

    pub fn severity(&self) -> Option<Severity> {
        match self {
            AlarmEvent::Triggered { severity, .. } => Some(*severity),
            _ => None,
        }
    }
}

/// One row for the alarm journal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct AlarmRecord {
    pub alarm_number: usize,
    pub space: IndexSpace,
    pub date: String,
    pub time: String,
    // 0 when the event carries no severity
    pub type_code: u8,
    pub status_code: u32,
    pub name: String,
}

impl From<&AlarmEvent> for AlarmRecord {
    fn from(event: &AlarmEvent) -> AlarmRecord {
        let local = event.timestamp().with_timezone(&Local);
        let name = match event {
            AlarmEvent::Triggered { description, .. } => description.clone(),
            _ => format!("Alarm {}", event.index()),
        };
        AlarmRecord {
            alarm_number: event.index(),
            space: event.space(),
            date: local.format("%Y-%m-%d").to_string(),
            time: local.format("%H:%M:%S").to_string(),
            type_code: event.severity().map_or(0, |s| s.type_code()),
            status_code: event.status().band(),
            name,
        }
    }
}

impl From<AlarmEvent> for AlarmRecord {
    fn from(event: AlarmEvent) -> AlarmRecord {
        AlarmRecord::from(&event)
    }
}

#[test]
fn test_record_from_triggered() {
    let timestamp = Utc::now();
    let event = AlarmEvent::Triggered {
        index: 81,
        space: IndexSpace::Bit,
        description: "Low oil level".to_string(),
        severity: Severity::Warning,
        timestamp,
    };
    let record = AlarmRecord::from(&event);
    let local = timestamp.with_timezone(&Local);
    assert_eq!(record.alarm_number, 81);
    assert_eq!(record.space, IndexSpace::Bit);
    assert_eq!(record.date, local.format("%Y-%m-%d").to_string());
    assert_eq!(record.time, local.format("%H:%M:%S").to_string());
    assert_eq!(record.type_code, 2);
    assert_eq!(record.status_code, 0);
    assert_eq!(record.name, "Low oil level");
}

#[test]
fn test_record_from_code_events() {
    let timestamp = Utc::now();
    let acked = AlarmRecord::from(AlarmEvent::Acknowledged {
        index: 501,
        space: IndexSpace::Code,
        active: false,
        timestamp,
    });
    assert_eq!(acked.status_code, 2);
    assert_eq!(acked.type_code, 0);
    assert_eq!(acked.name, "Alarm 501");
    let cleared = AlarmRecord::from(AlarmEvent::Cleared {
        index: 501,
        space: IndexSpace::Code,
        timestamp,
    });
    assert_eq!(cleared.status_code, 3);
    assert_eq!(cleared.space, IndexSpace::Code);
}

#[test]
fn test_record_serialize() {
    let record = AlarmRecord {
        alarm_number: 7,
        space: IndexSpace::Bit,
        date: "2021-03-23".to_string(),
        time: "11:23:11".to_string(),
        type_code: 1,
        status_code: 0,
        name: "Door open".to_string(),
    };
    let json = serde_json::to_string(&record).unwrap();
    assert_eq!(
        json,
        r#"{"AlarmNumber":7,"Space":"Bit","Date":"2021-03-23","Time":"11:23:11","TypeCode":1,"StatusCode":0,"Name":"Door open"}"#
    );
}
