//! CP-015: Append-only JSONL lifecycle event log.

use crate::core::error::{EngineError, Result};
use crate::core::types::{ProvenanceEvent, TargetKey, TimestampedEvent};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Generate an ISO 8601 timestamp (UTC, second precision).
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let days = secs / 86400;
    let time_secs = secs % 86400;
    let (y, m, d) = civil_from_days(days as i64);

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y,
        m,
        d,
        time_secs / 3600,
        (time_secs % 3600) / 60,
        time_secs % 60
    )
}

/// Days since the Unix epoch to a (year, month, day) triple.
fn civil_from_days(days: i64) -> (i64, usize, i64) {
    let mut y = 1970i64;
    let mut remaining = days;
    loop {
        let year_days = if is_leap(y) { 366 } else { 365 };
        if remaining < year_days {
            break;
        }
        remaining -= year_days;
        y += 1;
    }
    let feb = if is_leap(y) { 29 } else { 28 };
    let month_days = [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut m = 12;
    for (i, &md) in month_days.iter().enumerate() {
        if remaining < md {
            m = i + 1;
            break;
        }
        remaining -= md;
    }
    (y, m, remaining + 1)
}

fn is_leap(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Derive the event log path for a target.
pub fn event_log_path(state_dir: &Path, target: &TargetKey) -> PathBuf {
    state_dir.join(target.relative_dir()).join("events.jsonl")
}

/// Append an event to the target's event log.
pub fn append_event(state_dir: &Path, target: &TargetKey, event: ProvenanceEvent) -> Result<()> {
    let path = event_log_path(state_dir, target);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| EngineError::Storage(format!("cannot create state dir: {}", e)))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te)
        .map_err(|e| EngineError::Storage(format!("JSON serialize error: {}", e)))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| {
            EngineError::Storage(format!("cannot open event log {}: {}", path.display(), e))
        })?;

    writeln!(file, "{}", json).map_err(|e| EngineError::Storage(format!("write error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cp015_now_iso8601() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
        assert_eq!(ts.len(), 20);
    }

    #[test]
    fn test_cp015_civil_from_days() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(31), (1970, 2, 1));
        // 2000-02-29 is day 11016
        assert_eq!(civil_from_days(11016), (2000, 2, 29));
        // 2024-12-31 is day 20088
        assert_eq!(civil_from_days(20088), (2024, 12, 31));
    }

    #[test]
    fn test_cp015_is_leap() {
        assert!(is_leap(2000));
        assert!(!is_leap(1900));
        assert!(is_leap(2024));
        assert!(!is_leap(2026));
    }

    #[test]
    fn test_cp015_generate_run_id() {
        let id = generate_run_id();
        assert!(id.starts_with("r-"));
        assert_eq!(id.len(), 14);
    }

    #[test]
    fn test_cp015_event_log_path() {
        let p = event_log_path(Path::new("/state"), &TargetKey::new("realtime", "dev"));
        assert_eq!(p, PathBuf::from("/state/realtime/dev/events.jsonl"));
    }

    #[test]
    fn test_cp015_append_multiple() {
        let dir = tempfile::tempdir().unwrap();
        let target = TargetKey::new("p", "dev");
        append_event(
            dir.path(),
            &target,
            ProvenanceEvent::RunStarted {
                target: target.to_string(),
                run_id: "r-abc".to_string(),
                compositor_version: "0.1.0".to_string(),
            },
        )
        .unwrap();
        append_event(
            dir.path(),
            &target,
            ProvenanceEvent::InstanceFailed {
                instance: "api".to_string(),
                error: "throttled".to_string(),
            },
        )
        .unwrap();

        let content = std::fs::read_to_string(event_log_path(dir.path(), &target)).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("run_started"));
        assert!(lines[1].contains("instance_failed"));
        assert!(lines[1].contains("\"ts\":"));
    }
}
