use std::time::Duration;

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use uuid::Uuid;

use super::capture::{CaptureError, CaptureSettings};

pub type DetectorId = Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DetectorSpecification {
    pub width: u32,
    pub height: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorStatus {
    Idle,
    Disconnected,
    Capturing,
}

/// A detector as the backend reports it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DetectorInfo {
    pub id: DetectorId,
    pub specification: DetectorSpecification,
    pub status: DetectorStatus,
}

#[enum_dispatch]
pub trait CapturePlan {
    fn exposure_time(&self) -> Duration;

    /// `None` when the number of frames is not known up front.
    fn total_steps(&self) -> Option<u32>;

    fn validate(&self) -> Result<(), CaptureError>;

    fn estimated_remaining(&self, step: u32) -> Option<Duration>;

    fn describe(&self) -> String;
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SequenceCapture {
    pub num_frames: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub exposure_time: Duration,
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StreamCapture {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub exposure_time: Duration,
    /// Runs until cancelled when `None`.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub duration: Option<Duration>,
}

fn check_exposure(exposure_time: Duration) -> Result<(), CaptureError> {
    if exposure_time.is_zero() {
        return Err(CaptureError::InvalidSettings(
            "exposure time must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

impl CapturePlan for SequenceCapture {
    fn exposure_time(&self) -> Duration {
        self.exposure_time
    }

    fn total_steps(&self) -> Option<u32> {
        Some(self.num_frames)
    }

    fn validate(&self) -> Result<(), CaptureError> {
        check_exposure(self.exposure_time)?;
        if self.num_frames == 0 {
            return Err(CaptureError::InvalidSettings(
                "a sequence needs at least one frame".to_string(),
            ));
        }
        Ok(())
    }

    fn estimated_remaining(&self, step: u32) -> Option<Duration> {
        self.exposure_time
            .checked_mul(self.num_frames.saturating_sub(step))
    }

    fn describe(&self) -> String {
        format!(
            "sequence of {} frames at {}ms",
            self.num_frames,
            self.exposure_time.as_millis()
        )
    }
}

impl CapturePlan for StreamCapture {
    fn exposure_time(&self) -> Duration {
        self.exposure_time
    }

    fn total_steps(&self) -> Option<u32> {
        None
    }

    fn validate(&self) -> Result<(), CaptureError> {
        check_exposure(self.exposure_time)?;
        if self.duration.is_some_and(|d| d.is_zero()) {
            return Err(CaptureError::InvalidSettings(
                "stream duration must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn estimated_remaining(&self, step: u32) -> Option<Duration> {
        self.duration.map(|d| match self.exposure_time.checked_mul(step) {
            Some(elapsed) => d.saturating_sub(elapsed),
            None => Duration::ZERO,
        })
    }

    fn describe(&self) -> String {
        match self.duration {
            Some(d) => format!(
                "stream at {}ms for {}ms",
                self.exposure_time.as_millis(),
                d.as_millis()
            ),
            None => format!("stream at {}ms", self.exposure_time.as_millis()),
        }
    }
}

#[enum_dispatch(CapturePlan)]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum CaptureMode {
    Stream(StreamCapture),
    Sequence(SequenceCapture),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapturePhase {
    Acquiring,
    /// The last frame of a bounded capture has arrived.
    Done,
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CaptureReport {
    pub phase: CapturePhase,
    pub message: String,
    pub step: u32,
    pub total_steps: Option<u32>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub estimated_remaining: Option<Duration>,
}

impl CaptureReport {
    pub fn for_frame(mode: &CaptureMode, step: u32) -> Self {
        let total_steps = mode.total_steps();
        let phase = match total_steps {
            Some(total) if step >= total => CapturePhase::Done,
            _ => CapturePhase::Acquiring,
        };
        let message = match total_steps {
            Some(total) => format!("Captured frame {step} of {total}"),
            None => format!("Captured frame {step}"),
        };

        Self {
            phase,
            message,
            step,
            total_steps,
            estimated_remaining: mode.estimated_remaining(step),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Requested,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Requested | SessionState::Running)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Requested)
                | (Requested, Running)
                | (Requested, Cancelled)
                | (Requested, Failed)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Running, Failed)
        )
    }
}

/// What to do with a frame the backend delivers after a cancel was requested.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PartialFramePolicy {
    #[default]
    ExcludeInFlight,
    IncludeInFlight,
}

/// Everything the backend is asked to run.
#[derive(Clone, Debug)]
pub struct CaptureRequest {
    pub detector_id: DetectorId,
    pub mode: CaptureMode,
    pub settings: CaptureSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence(num_frames: u32) -> CaptureMode {
        CaptureMode::Sequence(SequenceCapture {
            num_frames,
            exposure_time: Duration::from_millis(100),
        })
    }

    #[test]
    fn sequence_reports_count_up_to_done() {
        let mode = sequence(3);
        let first = CaptureReport::for_frame(&mode, 1);
        assert_eq!(first.phase, CapturePhase::Acquiring);
        assert_eq!(first.total_steps, Some(3));
        assert_eq!(first.estimated_remaining, Some(Duration::from_millis(200)));

        let last = CaptureReport::for_frame(&mode, 3);
        assert_eq!(last.phase, CapturePhase::Done);
        assert_eq!(last.estimated_remaining, Some(Duration::ZERO));
    }

    #[test]
    fn stream_reports_are_open_ended() {
        let mode = CaptureMode::Stream(StreamCapture {
            exposure_time: Duration::from_millis(50),
            duration: None,
        });
        let report = CaptureReport::for_frame(&mode, 40);
        assert_eq!(report.total_steps, None);
        assert_eq!(report.phase, CapturePhase::Acquiring);
        assert_eq!(report.estimated_remaining, None);
    }

    #[test]
    fn huge_exposures_do_not_overflow_estimates() {
        let exposure_time = Duration::MAX / 2;
        let sequence = CaptureMode::Sequence(SequenceCapture {
            num_frames: 4,
            exposure_time,
        });
        assert!(sequence.validate().is_ok());
        assert_eq!(CaptureReport::for_frame(&sequence, 1).estimated_remaining, None);
        assert_eq!(
            CaptureReport::for_frame(&sequence, 3).estimated_remaining,
            Some(exposure_time)
        );

        let stream = CaptureMode::Stream(StreamCapture {
            exposure_time,
            duration: Some(Duration::from_secs(1)),
        });
        assert_eq!(
            CaptureReport::for_frame(&stream, 3).estimated_remaining,
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn invalid_modes_are_rejected() {
        assert!(sequence(0).validate().is_err());
        assert!(CaptureMode::Sequence(SequenceCapture {
            num_frames: 1,
            exposure_time: Duration::ZERO,
        })
        .validate()
        .is_err());
        assert!(CaptureMode::Stream(StreamCapture {
            exposure_time: Duration::from_millis(1),
            duration: Some(Duration::ZERO),
        })
        .validate()
        .is_err());
        assert!(sequence(5).validate().is_ok());
    }

    #[test]
    fn terminal_states_never_transition() {
        use SessionState::*;
        let all = [Idle, Requested, Running, Completed, Cancelled, Failed];
        for from in [Completed, Cancelled, Failed] {
            assert!(all.iter().all(|&to| !from.can_transition_to(to)));
        }
        assert!(!Requested.can_transition_to(Completed));
        assert!(Running.can_transition_to(Completed));
    }

    #[test]
    fn mode_serializes_with_type_tag() {
        let json = serde_json::to_value(sequence(2)).unwrap();
        assert_eq!(json["type"], "Sequence");
        assert_eq!(json["exposure_time"], 100);
    }
}
