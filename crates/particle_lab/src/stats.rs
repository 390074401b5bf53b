//! Frame-rate statistics

use std::time::Instant;

/// Frames between two statistics reports
pub const REPORT_INTERVAL: u32 = 100;

/// One statistics report
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatisticsReport {
    /// Whole frames per second, rounded
    pub fps: u32,
    pub label: String,
}

/// Counts completed frames and reports the rate every `REPORT_INTERVAL`
#[derive(Debug)]
pub struct FrameStatistics {
    particle_count: usize,
    frames: u32,
    since: Instant,
}

impl FrameStatistics {
    pub fn new(particle_count: usize, now: Instant) -> Self {
        Self {
            particle_count,
            frames: 0,
            since: now,
        }
    }

    /// Count one completed frame; every `REPORT_INTERVAL` frames returns a
    /// report and restarts the window at `now`
    pub fn record_frame(&mut self, now: Instant) -> Option<StatisticsReport> {
        self.frames += 1;
        if self.frames < REPORT_INTERVAL {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.since).as_secs_f32();
        let fps = if elapsed > 0.0 {
            (REPORT_INTERVAL as f32 / elapsed).round() as u32
        } else {
            u32::MAX
        };
        self.frames = 0;
        self.since = now;

        Some(StatisticsReport {
            fps,
            label: format!("{} particles at {} fps", self.particle_count, fps),
        })
    }

    /// Frames counted since the last report
    pub fn pending_frames(&self) -> u32 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_one_report_per_hundred_frames() {
        let start = Instant::now();
        let mut stats = FrameStatistics::new(1 << 20, start);
        let mut reports = Vec::new();
        for frame in 1..=250u64 {
            let now = start + Duration::from_millis(frame * 10);
            if let Some(report) = stats.record_frame(now) {
                reports.push((frame, report));
            }
        }
        let frames: Vec<u64> = reports.iter().map(|(frame, _)| *frame).collect();
        assert_eq!(frames, vec![100, 200]);
        assert_eq!(stats.pending_frames(), 50);
    }

    #[test]
    fn test_fps_from_elapsed_time() {
        let start = Instant::now();
        let mut stats = FrameStatistics::new(262_144, start);
        for _ in 0..99 {
            assert!(stats.record_frame(start).is_none());
        }
        let report = stats.record_frame(start + Duration::from_secs(2)).unwrap();
        assert_eq!(report.fps, 50);
        assert_eq!(report.label, "262144 particles at 50 fps");
    }

    #[test]
    fn test_window_restarts_after_report() {
        let start = Instant::now();
        let mut stats = FrameStatistics::new(16, start);
        for _ in 0..100 {
            stats.record_frame(start + Duration::from_secs(10));
        }
        // Second window measured from the first report, not from start
        let mut last = None;
        for _ in 0..100 {
            last = stats.record_frame(start + Duration::from_secs(11));
        }
        assert_eq!(last.unwrap().fps, 100);
    }

    #[test]
    fn test_fps_is_rounded_to_whole_frames() {
        let start = Instant::now();
        let mut stats = FrameStatistics::new(16, start);
        let mut last = None;
        for _ in 0..100 {
            last = stats.record_frame(start + Duration::from_secs(3));
        }
        let report = last.unwrap();
        assert_eq!(report.fps, 33);
        assert_eq!(report.label, "16 particles at 33 fps");
    }
}
