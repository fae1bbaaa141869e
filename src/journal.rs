use crate::alarm_event::{AlarmEvent, AlarmRecord};
use crate::util::error::DynResult;
use std::io::Write;

/// Writes one JSON alarm record per line.
pub struct RecordWriter<W: Write> {
    out: W,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(out: W) -> RecordWriter<W> {
        RecordWriter { out }
    }

    pub fn write_event(&mut self, event: &AlarmEvent) -> DynResult<()> {
        let record = AlarmRecord::from(event);
        serde_json::to_writer(&mut self.out, &record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[test]
fn test_write_records() {
    use crate::alarm_event::IndexSpace;
    use crate::catalog::Severity;
    use chrono::Utc;

    let mut writer = RecordWriter::new(Vec::<u8>::new());
    writer
        .write_event(&AlarmEvent::Triggered {
            index: 5,
            space: IndexSpace::Bit,
            description: "Pump 5 overload".to_string(),
            severity: Severity::Warning,
            timestamp: Utc::now(),
        })
        .unwrap();
    writer
        .write_event(&AlarmEvent::Cleared {
            index: 5,
            space: IndexSpace::Bit,
            timestamp: Utc::now(),
        })
        .unwrap();
    let text = String::from_utf8(writer.into_inner()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["AlarmNumber"], 5);
    assert_eq!(first["TypeCode"], 2);
    assert_eq!(first["Name"], "Pump 5 overload");
    let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(second["Name"], "Alarm 5");
    assert_eq!(second["TypeCode"], 0);
}
