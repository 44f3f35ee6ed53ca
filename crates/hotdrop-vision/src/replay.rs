use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;
use tracing::debug;

use crate::{Detector, Frame, FrameDims};

/// Replays detector output recorded as JSON lines, one frame per line:
/// `{"ts_ms": 40, "detections": [{"cx": 320, "cy": 240, "w": 80, "h": 80, "conf": 0.9}]}`
/// Blank lines and lines starting with `#` are skipped.
pub struct ReplayDetector<R: BufRead + Send> {
    lines: Lines<R>,
    dims: FrameDims,
    line_no: usize,
}

impl ReplayDetector<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>, dims: FrameDims) -> Result<Self> {
        let path = path.as_ref();
        let f = File::open(path).with_context(|| format!("open replay file {}", path.display()))?;
        Ok(Self::from_reader(BufReader::new(f), dims))
    }
}

impl<R: BufRead + Send> ReplayDetector<R> {
    pub fn from_reader(reader: R, dims: FrameDims) -> Self {
        Self { lines: reader.lines(), dims, line_no: 0 }
    }
}

impl<R: BufRead + Send> Detector for ReplayDetector<R> {
    fn frame_dims(&self) -> FrameDims {
        self.dims
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        for line in self.lines.by_ref() {
            self.line_no += 1;
            let line = line.context("read replay line")?;
            let s = line.trim();
            if s.is_empty() || s.starts_with('#') {
                continue;
            }
            let mut frame: Frame = serde_json::from_str(s)
                .with_context(|| format!("parse replay frame at line {}", self.line_no))?;
            for d in &mut frame.detections {
                if d.ts_ms == 0 {
                    d.ts_ms = frame.ts_ms;
                }
            }
            debug!("replay: frame ts={} n={}", frame.ts_ms, frame.detections.len());
            return Ok(Some(frame));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    const LOG: &str = r#"
# recorded over the test field
{"ts_ms": 0, "detections": []}
{"ts_ms": 33, "detections": [{"cx": 320, "cy": 240, "w": 60, "h": 60, "conf": 0.91}]}
"#;

    #[test]
    fn replays_frames_in_order() {
        let mut det = ReplayDetector::from_reader(Cursor::new(LOG), FrameDims::new(640, 480));
        let first = det.next_frame().unwrap().unwrap();
        assert!(first.target().is_none());

        let second = det.next_frame().unwrap().unwrap();
        let t = second.target().unwrap();
        assert_eq!(t.ts_ms, 33);
        assert_eq!(t.size(), 60.0);

        assert!(det.next_frame().unwrap().is_none());
    }

    #[test]
    fn reports_line_of_bad_frame() {
        let mut det = ReplayDetector::from_reader(Cursor::new("{\"ts_ms\": 1}\nnot json\n"), FrameDims::default());
        assert!(det.next_frame().unwrap().is_some());
        let err = det.next_frame().unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));
    }

    #[test]
    fn opens_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "{{\"ts_ms\": 5, \"detections\": [{{\"cx\": 1, \"cy\": 2, \"w\": 3, \"h\": 3, \"conf\": 0.7}}]}}").unwrap();
        let mut det = ReplayDetector::open(tmp.path(), FrameDims::new(64, 64)).unwrap();
        assert_eq!(det.frame_dims(), FrameDims::new(64, 64));
        assert_eq!(det.next_frame().unwrap().unwrap().detections.len(), 1);
    }
}
