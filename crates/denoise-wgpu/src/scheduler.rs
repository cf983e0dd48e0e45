//! Frame streaming schedule
//!
//! [`plan`] turns a topology, the overlap flag and the frame count into the full
//! ordered list of [`Step`]s a run executes. The driver in [`crate::run`] maps
//! each step onto pool writes, executed passes and reads, so the interleaving of
//! uploads and dispatches is decided here and nowhere else.
//!
//! Without overlap every neighbour upload and its accumulation dispatch are
//! separate submissions. With overlap two neighbour lanes alternate: the pass
//! that accumulates lane A also uploads the next frame into lane B.

use crate::{
    error::{Error, Result},
    topology::TopologyKind,
};
use std::fmt;

/// Phases of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Frame 0 is loaded and made readable by the kernels
    Priming,
    /// Frames are streamed through the dispatches
    Steady,
    /// The final normalization runs and the output is read back
    Draining,
    /// Every pass has completed
    Done,
}

/// One of the two neighbour slot sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    A,
    B,
}

impl Lane {
    /// The lane used for the `i`th accumulation
    pub fn for_frame(i: usize) -> Self {
        if i % 2 == 0 { Lane::A } else { Lane::B }
    }

    /// The other lane
    pub fn other(self) -> Self {
        match self {
            Lane::A => Lane::B,
            Lane::B => Lane::A,
        }
    }
}

/// Where a loaded frame is written on the host side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageTarget {
    /// Staging buffer of the input/target image
    Image,
    /// Staging buffer of a neighbour lane
    Lane(Lane),
}

/// The kernel a pass dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedDispatch {
    Bilateral,
    Accumulate { lane: Lane },
    Normalize,
}

/// Device work of one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassPlan {
    /// Zero the accumulation buffer
    pub clear_accumulation: bool,
    /// Copy the image staging buffer into the input/target image
    pub upload_image: bool,
    /// Copy a lane's staging buffer into its neighbour buffer
    pub upload_lane: Option<Lane>,
    /// Kernel dispatch, if any
    pub dispatch: Option<PlannedDispatch>,
    /// Copy the output buffer into its readback buffer
    pub download_output: bool,
    /// Copy the accumulation buffer into its readback buffer
    pub download_accumulation: bool,
}

impl fmt::Display for PassPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.clear_accumulation {
            parts.push("clear".to_string());
        }
        if self.upload_image {
            parts.push("upload image".to_string());
        }
        if let Some(lane) = self.upload_lane {
            parts.push(format!("upload lane {lane:?}"));
        }
        match self.dispatch {
            Some(PlannedDispatch::Bilateral) => parts.push("bilateral".to_string()),
            Some(PlannedDispatch::Accumulate { lane }) => parts.push(format!("accumulate lane {lane:?}")),
            Some(PlannedDispatch::Normalize) => parts.push("normalize".to_string()),
            None => {}
        }
        if self.download_output || self.download_accumulation {
            parts.push("download".to_string());
        }
        f.write_str(&parts.join(" + "))
    }
}

/// One step of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The scheduler enters a new phase
    Enter(SchedulerState),
    /// Load frame `frame` and write it into a staging buffer
    Stage { frame: usize, target: StageTarget },
    /// Execute one pass and wait for it
    Execute(PassPlan),
    /// Read the output buffer back as output frame `output`
    Collect { output: usize },
}

/// Plans every step of a run
///
/// # Arguments
/// * `kind` - Filter topology
/// * `overlap` - Ping-pong neighbour uploads with accumulation dispatches
/// * `frames` - Number of input frames
/// * `capture_accumulation` - Also download the final accumulation buffer
///
/// # Returns
/// The ordered steps, starting with `Enter(Priming)` and ending with `Enter(Done)`
pub fn plan(kind: TopologyKind, overlap: bool, frames: usize, capture_accumulation: bool) -> Result<Vec<Step>> {
    if frames == 0 {
        return Err(Error::FatalConfiguration("a run needs at least one frame".to_string()));
    }
    if overlap && kind == TopologyKind::SinglePass {
        return Err(Error::FatalConfiguration("overlap mode requires the two-pass topology".to_string()));
    }

    let mut steps = vec![Step::Enter(SchedulerState::Priming)];
    match kind {
        TopologyKind::SinglePass => plan_single_pass(&mut steps, frames),
        TopologyKind::TwoPass => {
            if overlap {
                plan_overlapped(&mut steps, frames);
            } else {
                plan_serial(&mut steps, frames);
            }
            steps.push(Step::Enter(SchedulerState::Draining));
            steps.push(Step::Execute(PassPlan {
                dispatch: Some(PlannedDispatch::Normalize),
                download_output: true,
                download_accumulation: capture_accumulation,
                ..Default::default()
            }));
            steps.push(Step::Collect { output: 0 });
        }
    }
    steps.push(Step::Enter(SchedulerState::Done));
    Ok(steps)
}

fn upload_image() -> Step {
    Step::Execute(PassPlan {
        upload_image: true,
        ..Default::default()
    })
}

fn bilateral() -> Step {
    Step::Execute(PassPlan {
        dispatch: Some(PlannedDispatch::Bilateral),
        download_output: true,
        ..Default::default()
    })
}

fn plan_single_pass(steps: &mut Vec<Step>, frames: usize) {
    steps.push(Step::Stage { frame: 0, target: StageTarget::Image });
    steps.push(upload_image());
    steps.push(Step::Enter(SchedulerState::Steady));
    steps.push(bilateral());
    steps.push(Step::Collect { output: 0 });
    for frame in 1..frames {
        steps.push(Step::Stage { frame, target: StageTarget::Image });
        steps.push(upload_image());
        steps.push(bilateral());
        steps.push(Step::Collect { output: frame });
    }
}

fn plan_serial(steps: &mut Vec<Step>, frames: usize) {
    steps.push(Step::Stage { frame: 0, target: StageTarget::Image });
    steps.push(Step::Execute(PassPlan {
        clear_accumulation: true,
        upload_image: true,
        ..Default::default()
    }));
    steps.push(Step::Enter(SchedulerState::Steady));
    for frame in 0..frames {
        steps.push(Step::Stage { frame, target: StageTarget::Lane(Lane::A) });
        steps.push(Step::Execute(PassPlan {
            upload_lane: Some(Lane::A),
            ..Default::default()
        }));
        steps.push(Step::Execute(PassPlan {
            dispatch: Some(PlannedDispatch::Accumulate { lane: Lane::A }),
            ..Default::default()
        }));
    }
}

fn plan_overlapped(steps: &mut Vec<Step>, frames: usize) {
    steps.push(Step::Stage { frame: 0, target: StageTarget::Image });
    steps.push(Step::Stage { frame: 0, target: StageTarget::Lane(Lane::A) });
    steps.push(Step::Execute(PassPlan {
        clear_accumulation: true,
        upload_image: true,
        upload_lane: Some(Lane::A),
        ..Default::default()
    }));
    steps.push(Step::Enter(SchedulerState::Steady));
    for frame in 0..frames {
        let lane = Lane::for_frame(frame);
        let upload_lane = (frame + 1 < frames).then(|| lane.other());
        if let Some(next) = upload_lane {
            steps.push(Step::Stage {
                frame: frame + 1,
                target: StageTarget::Lane(next),
            });
        }
        steps.push(Step::Execute(PassPlan {
            upload_lane,
            dispatch: Some(PlannedDispatch::Accumulate { lane }),
            ..Default::default()
        }));
    }
}

/// Whether a plan uses neighbour lane B
pub fn uses_lane_b(steps: &[Step]) -> bool {
    steps.iter().any(|step| matches!(step, Step::Stage { target: StageTarget::Lane(Lane::B), .. }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passes(steps: &[Step]) -> Vec<PassPlan> {
        steps
            .iter()
            .filter_map(|step| match step {
                Step::Execute(pass) => Some(*pass),
                _ => None,
            })
            .collect()
    }

    fn states(steps: &[Step]) -> Vec<SchedulerState> {
        steps
            .iter()
            .filter_map(|step| match step {
                Step::Enter(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn accumulated_lanes(steps: &[Step]) -> Vec<Lane> {
        passes(steps)
            .iter()
            .filter_map(|pass| match pass.dispatch {
                Some(PlannedDispatch::Accumulate { lane }) => Some(lane),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_invalid_configurations() {
        assert!(matches!(plan(TopologyKind::SinglePass, true, 1, false), Err(Error::FatalConfiguration(_))));
        assert!(matches!(plan(TopologyKind::TwoPass, false, 0, false), Err(Error::FatalConfiguration(_))));
    }

    #[test]
    fn test_single_pass_single_frame() {
        let steps = plan(TopologyKind::SinglePass, false, 1, false).unwrap();
        assert_eq!(
            steps,
            vec![
                Step::Enter(SchedulerState::Priming),
                Step::Stage { frame: 0, target: StageTarget::Image },
                upload_image(),
                Step::Enter(SchedulerState::Steady),
                bilateral(),
                Step::Collect { output: 0 },
                Step::Enter(SchedulerState::Done),
            ]
        );
    }

    #[test]
    fn test_single_pass_filters_every_frame() {
        let steps = plan(TopologyKind::SinglePass, false, 3, false).unwrap();
        let collected: Vec<usize> = steps
            .iter()
            .filter_map(|step| match step {
                Step::Collect { output } => Some(*output),
                _ => None,
            })
            .collect();
        assert_eq!(collected, vec![0, 1, 2]);
        assert_eq!(passes(&steps).iter().filter(|pass| pass.dispatch == Some(PlannedDispatch::Bilateral)).count(), 3);
        assert!(!states(&steps).contains(&SchedulerState::Draining));
    }

    #[test]
    fn test_serial_accumulation_separates_upload_and_dispatch() {
        let steps = plan(TopologyKind::TwoPass, false, 3, false).unwrap();
        assert_eq!(states(&steps), vec![SchedulerState::Priming, SchedulerState::Steady, SchedulerState::Draining, SchedulerState::Done]);
        assert_eq!(accumulated_lanes(&steps), vec![Lane::A; 3]);
        assert!(passes(&steps).iter().all(|pass| !(pass.upload_lane.is_some() && pass.dispatch.is_some())));
        assert!(!uses_lane_b(&steps));

        let normalizations = passes(&steps).iter().filter(|pass| pass.dispatch == Some(PlannedDispatch::Normalize)).count();
        assert_eq!(normalizations, 1);
        assert_eq!(steps[steps.len() - 2], Step::Collect { output: 0 });
    }

    #[test]
    fn test_overlap_alternates_lanes() {
        let steps = plan(TopologyKind::TwoPass, true, 4, true).unwrap();
        assert_eq!(accumulated_lanes(&steps), vec![Lane::A, Lane::B, Lane::A, Lane::B]);
        assert!(uses_lane_b(&steps));

        let combined: Vec<PassPlan> = passes(&steps).into_iter().filter(|pass| matches!(pass.dispatch, Some(PlannedDispatch::Accumulate { .. }))).collect();
        for pass in &combined[..3] {
            let Some(PlannedDispatch::Accumulate { lane }) = pass.dispatch else { unreachable!() };
            assert_eq!(pass.upload_lane, Some(lane.other()));
        }
        assert_eq!(combined[3].upload_lane, None);

        let priming = passes(&steps)[0];
        assert!(priming.clear_accumulation && priming.upload_image);
        assert_eq!(priming.upload_lane, Some(Lane::A));
        assert!(passes(&steps).last().is_some_and(|pass| pass.download_accumulation));
    }

    #[test]
    fn test_overlap_single_frame_uses_one_lane() {
        let steps = plan(TopologyKind::TwoPass, true, 1, false).unwrap();
        assert_eq!(accumulated_lanes(&steps), vec![Lane::A]);
        assert!(!uses_lane_b(&steps));
    }

    #[test]
    fn test_pass_plan_display() {
        let pass = PassPlan {
            upload_lane: Some(Lane::B),
            dispatch: Some(PlannedDispatch::Accumulate { lane: Lane::A }),
            ..Default::default()
        };
        assert_eq!(pass.to_string(), "upload lane B + accumulate lane A");
    }
}
