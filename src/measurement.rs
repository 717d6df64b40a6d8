//! # Measurement
//!
//! Decoding of the Blood Pressure Measurement characteristic. A record is one
//! flag byte, three mandatory little-endian `u16` pressure fields and a run of
//! optional fields whose presence the flags announce.
//!

use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use thiserror::Error;

use std::fmt;

/// kPa to mmHg conversion factor
pub const KPA_TO_MMHG: f64 = 7.50062;

/// Flag byte plus systolic, diastolic and mean arterial pressure
const MANDATORY_LEN: usize = 7;
const TIMESTAMP_LEN: usize = 7;
const PULSE_RATE_LEN: usize = 2;
const USER_ID_LEN: usize = 1;
const STATUS_LEN: usize = 2;

/// Reasons a notification could not be turned into a [`MeasurementRecord`]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than the flag byte and the three mandatory fields need
    #[error("measurement needs at least {MANDATORY_LEN} bytes, got {len}")]
    TooShort { len: usize },
    /// The flags announce optional fields the payload does not carry
    #[error("flags announce {expected} bytes, got {len}")]
    Truncated { expected: usize, len: usize },
}

/// The flag byte leading every measurement.
///
/// Bit layout follows the Bluetooth SIG Blood Pressure Measurement
/// characteristic. Bits 5 to 7 are reserved and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementFlags(u8);

impl MeasurementFlags {
    pub const UNITS_KPA: u8 = 0x01;
    pub const TIMESTAMP: u8 = 0x02;
    pub const PULSE_RATE: u8 = 0x04;
    pub const USER_ID: u8 = 0x08;
    pub const MEASUREMENT_STATUS: u8 = 0x10;

    pub fn new(bits: u8) -> MeasurementFlags {
        MeasurementFlags(bits)
    }

    /// Pressures are transmitted in kPa rather than mmHg
    pub fn units_kpa(&self) -> bool {
        self.0 & Self::UNITS_KPA != 0
    }

    pub fn has_timestamp(&self) -> bool {
        self.0 & Self::TIMESTAMP != 0
    }

    pub fn has_pulse_rate(&self) -> bool {
        self.0 & Self::PULSE_RATE != 0
    }

    pub fn has_user_id(&self) -> bool {
        self.0 & Self::USER_ID != 0
    }

    pub fn has_measurement_status(&self) -> bool {
        self.0 & Self::MEASUREMENT_STATUS != 0
    }

    /// Number of bytes a record with these flags occupies on the wire
    pub fn encoded_len(&self) -> usize {
        let mut len = MANDATORY_LEN;
        if self.has_timestamp() {
            len += TIMESTAMP_LEN;
        }
        if self.has_pulse_rate() {
            len += PULSE_RATE_LEN;
        }
        if self.has_user_id() {
            len += USER_ID_LEN;
        }
        if self.has_measurement_status() {
            len += STATUS_LEN;
        }
        len
    }
}

/// Calendar date-time of a measurement, as sent by the cuff or taken from
/// the local clock when the cuff sends none.
///
/// Kept as raw fields since cuffs report `0` for unknown month or day, which
/// is not a valid calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl RecordTime {
    /// Converts into a chrono date-time, if the fields form a valid one
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        chrono::NaiveDate::from_ymd_opt(self.year.into(), self.month.into(), self.day.into())?
            .and_hms_opt(self.hour.into(), self.minute.into(), self.second.into())
    }
}

impl From<NaiveDateTime> for RecordTime {
    fn from(time: NaiveDateTime) -> Self {
        RecordTime {
            year: u16::try_from(time.year()).unwrap_or_default(),
            month: time.month() as u8,
            day: time.day() as u8,
            hour: time.hour() as u8,
            minute: time.minute() as u8,
            second: time.second() as u8,
        }
    }
}

impl fmt::Display for RecordTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// A decoded blood pressure reading.
///
/// `mean_arterial_pressure` is always derived from systolic and diastolic,
/// the value the cuff sends is discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub timestamp: RecordTime,
    /// mmHg, or raw cuff units when these were not kPa
    pub systolic: u32,
    pub diastolic: u32,
    pub mean_arterial_pressure: f64,
    /// Beats per minute, if transmitted
    pub pulse_rate: Option<u16>,
}

impl MeasurementRecord {
    /// Field names, in the order sinks write them
    pub const FIELDS: [&'static str; 5] = [
        "timestamp",
        "systolic",
        "diastolic",
        "mean_arterial_pressure",
        "pulse_rate",
    ];
}

/// Bounds checked little-endian reader over a notification payload
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    expected: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or(DecodeError::Truncated {
                expected: self.expected,
                len: self.data.len(),
            })?;
        self.pos += len;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

/// Decode a measurement, stamping it with the local clock when the cuff sent
/// no timestamp.
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] for payloads under 7 bytes and
/// [`DecodeError::Truncated`] when the flags announce more than was sent.
pub fn decode(data: &[u8]) -> Result<MeasurementRecord, DecodeError> {
    decode_at(data, Local::now().naive_local())
}

/// Decode a measurement, using `now` when the cuff sent no timestamp.
pub fn decode_at(data: &[u8], now: NaiveDateTime) -> Result<MeasurementRecord, DecodeError> {
    if data.len() < MANDATORY_LEN {
        return Err(DecodeError::TooShort { len: data.len() });
    }

    let flags = MeasurementFlags::new(data[0]);
    let expected = flags.encoded_len();
    if data.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            len: data.len(),
        });
    }

    let mut reader = Reader {
        data,
        pos: 1,
        expected,
    };

    let systolic = reader.u16()?;
    let diastolic = reader.u16()?;
    // MAP as computed by the cuff, replaced by our own below
    let _ = reader.u16()?;

    let (systolic, diastolic, mean_arterial_pressure) = pressures(flags, systolic, diastolic);

    let timestamp = if flags.has_timestamp() {
        RecordTime {
            year: reader.u16()?,
            month: reader.u8()?,
            day: reader.u8()?,
            hour: reader.u8()?,
            minute: reader.u8()?,
            second: reader.u8()?,
        }
    } else {
        RecordTime::from(now)
    };

    let pulse_rate = if flags.has_pulse_rate() {
        Some(reader.u16()?)
    } else {
        None
    };

    if flags.has_user_id() {
        reader.take(USER_ID_LEN)?;
    }
    if flags.has_measurement_status() {
        reader.take(STATUS_LEN)?;
    }

    Ok(MeasurementRecord {
        timestamp,
        systolic,
        diastolic,
        mean_arterial_pressure,
        pulse_rate,
    })
}

/// Unit conversion and mean arterial pressure: `dia + (sys - dia) / 3`
fn pressures(flags: MeasurementFlags, systolic: u16, diastolic: u16) -> (u32, u32, f64) {
    let sys = f64::from(systolic);
    let dia = f64::from(diastolic);
    let map = dia + (sys - dia) / 3.0;

    if flags.units_kpa() {
        let to_mmhg = |kpa: f64| (kpa * KPA_TO_MMHG).round() as u32;
        let map = (map * KPA_TO_MMHG * 100.0).round() / 100.0;
        (to_mmhg(sys), to_mmhg(dia), map)
    } else {
        (systolic.into(), diastolic.into(), map.trunc())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::NaiveDate;

    fn clock() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap()
    }

    // flags, systolic 120, diastolic 80, cuff MAP 90
    fn mandatory(flags: u8) -> Vec<u8> {
        vec![flags, 120, 0, 80, 0, 90, 0]
    }

    #[test]
    fn short_payloads_are_rejected() {
        for len in 0..MANDATORY_LEN {
            let data = vec![0xffu8; len];
            assert_eq!(decode_at(&data, clock()), Err(DecodeError::TooShort { len }));
        }
    }

    #[test]
    fn mandatory_fields_only() {
        let record = decode_at(&mandatory(0x00), clock()).unwrap();

        assert_eq!(record.systolic, 120);
        assert_eq!(record.diastolic, 80);
        assert_eq!(record.mean_arterial_pressure, 93.0);
        assert_eq!(record.pulse_rate, None);
        assert_eq!(record.timestamp.to_string(), "2025-01-02 03:04:05");
    }

    #[test]
    fn cuff_map_is_ignored() {
        let mut data = mandatory(0x00);
        data[5] = 0xff;
        data[6] = 0xff;

        let record = decode_at(&data, clock()).unwrap();
        assert_eq!(record.mean_arterial_pressure, 93.0);
    }

    #[test]
    fn timestamp_from_record() {
        let mut data = mandatory(MeasurementFlags::TIMESTAMP);
        data.extend_from_slice(&[0xe8, 0x07, 5, 1, 10, 30, 15]);

        let record = decode_at(&data, clock()).unwrap();
        assert_eq!(record.timestamp.to_string(), "2024-05-01 10:30:15");
        assert_eq!(
            record.timestamp.to_naive(),
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(10, 30, 15)
        );
    }

    #[test]
    fn unknown_date_fields_still_format() {
        let mut data = mandatory(MeasurementFlags::TIMESTAMP);
        data.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0]);

        let record = decode_at(&data, clock()).unwrap();
        assert_eq!(record.timestamp.to_string(), "0000-00-00 00:00:00");
        assert_eq!(record.timestamp.to_naive(), None);
    }

    #[test]
    fn kpa_values_are_converted() {
        // 16 kPa systolic, 10 kPa diastolic
        let data = vec![MeasurementFlags::UNITS_KPA, 16, 0, 10, 0, 12, 0];

        let record = decode_at(&data, clock()).unwrap();
        assert_eq!(record.systolic, 120);
        assert_eq!(record.diastolic, 75);
        // (10 + 6 / 3) * 7.50062 = 90.00744
        assert_eq!(record.mean_arterial_pressure, 90.01);
    }

    #[test]
    fn pulse_after_timestamp() {
        let mut data = mandatory(MeasurementFlags::TIMESTAMP | MeasurementFlags::PULSE_RATE);
        data.extend_from_slice(&[0xe8, 0x07, 5, 1, 10, 30, 15]);
        data.extend_from_slice(&[72, 0]);

        let record = decode_at(&data, clock()).unwrap();
        assert_eq!(record.pulse_rate, Some(72));
        assert_eq!(record.timestamp.to_string(), "2024-05-01 10:30:15");
    }

    #[test]
    fn user_id_and_status_are_skipped() {
        let flags = MeasurementFlags::PULSE_RATE
            | MeasurementFlags::USER_ID
            | MeasurementFlags::MEASUREMENT_STATUS;
        let mut data = mandatory(flags);
        data.extend_from_slice(&[64, 0, 3, 0x01, 0x00]);

        assert_eq!(MeasurementFlags::new(flags).encoded_len(), data.len());
        let record = decode_at(&data, clock()).unwrap();
        assert_eq!(record.pulse_rate, Some(64));
    }

    #[test]
    fn every_missing_optional_byte_is_truncated() {
        let flags = MeasurementFlags::TIMESTAMP
            | MeasurementFlags::PULSE_RATE
            | MeasurementFlags::USER_ID
            | MeasurementFlags::MEASUREMENT_STATUS;
        let full_len = MeasurementFlags::new(flags).encoded_len();
        assert_eq!(full_len, 19);

        let mut data = mandatory(flags);
        data.resize(full_len, 0);
        assert!(decode_at(&data, clock()).is_ok());

        for len in MANDATORY_LEN..full_len {
            assert_eq!(
                decode_at(&data[..len], clock()),
                Err(DecodeError::Truncated {
                    expected: full_len,
                    len
                })
            );
        }
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut data = mandatory(0x00);
        data.extend_from_slice(&[1, 2, 3]);

        let record = decode_at(&data, clock()).unwrap();
        assert_eq!(record.systolic, 120);
    }

    #[test]
    fn reserved_bits_do_not_change_layout() {
        let data = mandatory(0xe0);
        assert_eq!(MeasurementFlags::new(0xe0).encoded_len(), MANDATORY_LEN);
        assert!(decode_at(&data, clock()).is_ok());
    }

    #[test]
    fn decoding_is_repeatable() {
        let mut data = mandatory(MeasurementFlags::PULSE_RATE);
        data.extend_from_slice(&[80, 0]);

        let first = decode(&data).unwrap();
        let second = decode(&data).unwrap();
        assert_eq!(first.systolic, second.systolic);
        assert_eq!(first.diastolic, second.diastolic);
        assert_eq!(first.mean_arterial_pressure, second.mean_arterial_pressure);
        assert_eq!(first.pulse_rate, second.pulse_rate);
    }

    #[test]
    fn diastolic_above_systolic_truncates_toward_zero() {
        // 80 + (70 - 80) / 3 = 76.67
        let data = vec![0x00, 70, 0, 80, 0, 0, 0];
        let record = decode_at(&data, clock()).unwrap();
        assert_eq!(record.mean_arterial_pressure, 76.0);
    }
}
