use chrono::{DateTime, Local, Utc};

/// Current wall clock as fractional epoch seconds.
pub fn epoch_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

pub fn iso_now() -> String {
    Utc::now().to_rfc3339()
}

pub fn iso_from_epoch(secs: f64) -> String {
    DateTime::<Utc>::from_timestamp_micros((secs * 1_000_000.0) as i64)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

/// Session directory name for a given start instant, e.g.
/// `session_20250315_142530`. Uses local time so on-disk sessions sort the
/// way operators expect.
pub fn session_name(start: DateTime<Local>) -> String {
    format!("session_{}", start.format("%Y%m%d_%H%M%S"))
}

/// `hhmmss` + millisecond components used in image-artifact directory names.
pub fn frame_dir_stamp(at: DateTime<Local>) -> (String, u32) {
    let hhmmss = at.format("%H%M%S").to_string();
    let millis = at.timestamp_subsec_millis();
    (hhmmss, millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn session_name_format() {
        let t = Local.with_ymd_and_hms(2025, 3, 15, 14, 25, 30).unwrap();
        assert_eq!(session_name(t), "session_20250315_142530");
    }

    #[test]
    fn iso_round_trip_is_parseable() {
        let iso = iso_from_epoch(1_700_000_000.5);
        assert!(DateTime::parse_from_rfc3339(&iso).is_ok());
    }
}
