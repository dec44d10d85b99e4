use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, TimeZone};
use dasp_sample::{Sample, ToSample};

use super::errors::{RecorderError, Result};

/// Extension of every artifact the recorder produces.
pub const CONTAINER_EXTENSION: &str = "aiff";

/// Timestamp layout used in artifact file names.
pub const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Accepts ids that name exactly one directory directly under the recordings root.
pub fn validate_session_id(id: &str) -> Result<()> {
    // both separators, so an id means the same directory on every host
    let has_separator = id.contains(['/', '\\']);
    let mut components = Path::new(id).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name == id
    );

    if has_separator || !single_normal {
        tracing::warn!("Rejected session id {:?}", id);
        return Err(RecorderError::InvalidSessionId(id.to_string()));
    }
    Ok(())
}

/// Builds `<base>/<session id>/device_<index>_<timestamp>.aiff`.
pub fn session_file_path<Tz>(
    base: &Path,
    session_id: &str,
    device_index: usize,
    started_at: &DateTime<Tz>,
) -> PathBuf
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let file_name = format!(
        "device_{}_{}.{}",
        device_index,
        started_at.format(FILE_TIMESTAMP_FORMAT),
        CONTAINER_EXTENSION
    );
    base.join(session_id).join(file_name)
}

/// Converts device samples of any format into the recorder's `i32` samples.
pub fn convert_samples<T>(data: &[T], out: &mut Vec<i32>)
where
    T: Sample + ToSample<i32>,
{
    out.reserve(data.len());
    out.extend(data.iter().map(|s| s.to_sample::<i32>()));
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn artifact_path_layout() {
        let started = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let path = session_file_path(Path::new("/data/rec"), "mic1", 2, &started);
        assert_eq!(
            path,
            PathBuf::from("/data/rec/mic1/device_2_20240309_140507.aiff")
        );
    }

    #[test]
    fn session_ids_stay_under_the_root() {
        for id in ["mic1", "desk-left", "take.2", "..hidden"] {
            assert!(validate_session_id(id).is_ok(), "{id} should be accepted");
        }
        for id in ["", ".", "..", "../escaped", "/tmp/abs", "a/b", "a\\b", "mic/"] {
            let err = validate_session_id(id).unwrap_err();
            assert!(
                matches!(err, RecorderError::InvalidSessionId(ref rejected) if rejected == id),
                "{id:?} should be rejected"
            );
        }
    }

    #[test]
    fn converts_common_sample_formats() {
        let mut out = Vec::new();
        convert_samples(&[i16::MAX, 0i16, i16::MIN], &mut out);
        assert_eq!(out, vec![i32::from(i16::MAX) << 16, 0, i32::MIN]);

        out.clear();
        convert_samples(&[0.0f32, -1.0], &mut out);
        assert_eq!(out, vec![0, i32::MIN]);
    }
}
