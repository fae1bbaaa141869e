//! Decoding of banded alarm codes.
//!
//! Some controllers report alarms as a single integer instead of a bit in
//! the alarm table. The thousands digit is the status band and the rest is
//! the alarm number. These numbers are their own index space and are never
//! mixed with bitfield indices.

use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Width of one status band
pub const BAND_WIDTH: i64 = 1000;

/// Number of distinct alarm numbers in the code space
pub const CODE_SLOTS: usize = BAND_WIDTH as usize;

#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, TryFromPrimitive, Serialize, Deserialize)]
#[repr(u32)]
pub enum AlarmStatus {
    Active = 0,
    AcknowledgedActive = 1,
    AcknowledgedInactive = 2,
    Cleared = 3,
}

impl AlarmStatus {
    pub fn band(&self) -> u32 {
        *self as u32
    }

    /// The alarm condition is still present
    pub fn is_active(&self) -> bool {
        matches!(self, AlarmStatus::Active | AlarmStatus::AcknowledgedActive)
    }

    pub fn is_acknowledged(&self) -> bool {
        matches!(
            self,
            AlarmStatus::AcknowledgedActive | AlarmStatus::AcknowledgedInactive
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmStatus::Active => "Active",
            AlarmStatus::AcknowledgedActive => "AcknowledgedActive",
            AlarmStatus::AcknowledgedInactive => "AcknowledgedInactive",
            AlarmStatus::Cleared => "Cleared",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedCode {
    pub index: usize,
    pub status: AlarmStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BandError {
    Negative(i64),
    InvalidBand { code: i64, band: i64 },
}

impl std::error::Error for BandError {}

impl Display for BandError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BandError::Negative(code) => write!(f, "Alarm code {} is negative", code),
            BandError::InvalidBand { code, band } => {
                write!(f, "Alarm code {} has invalid status band {}", code, band)
            }
        }
    }
}

pub fn decode(code: i64) -> Result<DecodedCode, BandError> {
    if code < 0 {
        return Err(BandError::Negative(code));
    }
    let band = code / BAND_WIDTH;
    let index = (code % BAND_WIDTH) as usize;
    let status = u32::try_from(band)
        .ok()
        .and_then(|b| AlarmStatus::try_from(b).ok())
        .ok_or(BandError::InvalidBand { code, band })?;
    Ok(DecodedCode { index, status })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// The report repeats the known status
    Unchanged,
    Changed { previous: Option<AlarmStatus> },
}

/// Last reported status of every alarm number in the code space.
#[derive(Debug, Clone)]
pub struct CodeStatusTable {
    slots: Vec<Option<AlarmStatus>>,
}

impl CodeStatusTable {
    pub fn new() -> CodeStatusTable {
        CodeStatusTable {
            slots: vec![None; CODE_SLOTS],
        }
    }

    /// Store the status, reporting whether it differs from the known one.
    pub fn update(&mut self, decoded: DecodedCode) -> StatusChange {
        let slot = &mut self.slots[decoded.index];
        match *slot {
            Some(status) if status == decoded.status => StatusChange::Unchanged,
            previous => {
                *slot = Some(decoded.status);
                StatusChange::Changed { previous }
            }
        }
    }

    pub fn status(&self, index: usize) -> Option<AlarmStatus> {
        self.slots.get(index).copied().flatten()
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Some(status) if status.is_active()))
            .count()
    }

    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

impl Default for CodeStatusTable {
    fn default() -> CodeStatusTable {
        CodeStatusTable::new()
    }
}

#[test]
fn test_decode() {
    assert_eq!(
        decode(2501),
        Ok(DecodedCode {
            index: 501,
            status: AlarmStatus::AcknowledgedInactive
        })
    );
    assert_eq!(
        decode(45),
        Ok(DecodedCode {
            index: 45,
            status: AlarmStatus::Active
        })
    );
    assert_eq!(
        decode(1000),
        Ok(DecodedCode {
            index: 0,
            status: AlarmStatus::AcknowledgedActive
        })
    );
    assert_eq!(
        decode(3999),
        Ok(DecodedCode {
            index: 999,
            status: AlarmStatus::Cleared
        })
    );
    assert_eq!(
        decode(4000),
        Err(BandError::InvalidBand {
            code: 4000,
            band: 4
        })
    );
    assert_eq!(decode(-1), Err(BandError::Negative(-1)));
    assert!(decode(i64::MAX).is_err());
}

#[test]
fn test_status_table() {
    let mut table = CodeStatusTable::new();
    let active = decode(17).unwrap();
    assert_eq!(table.update(active), StatusChange::Changed { previous: None });
    assert_eq!(table.update(active), StatusChange::Unchanged);
    assert_eq!(table.active_count(), 1);
    let acked = decode(1017).unwrap();
    assert_eq!(
        table.update(acked),
        StatusChange::Changed { previous: Some(AlarmStatus::Active) }
    );
    assert_eq!(table.active_count(), 1);
    assert_eq!(
        table.update(decode(3017).unwrap()),
        StatusChange::Changed { previous: Some(AlarmStatus::AcknowledgedActive) }
    );
    assert_eq!(table.active_count(), 0);
    assert_eq!(table.status(17), Some(AlarmStatus::Cleared));
    assert_eq!(table.status(18), None);
    table.reset();
    assert_eq!(table.status(17), None);
}
