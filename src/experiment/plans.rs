//! Plans
//!
//! Plans are declarative generators that yield commands for the
//! [`RunEngine`](super::run_engine::RunEngine) to execute. A plan never touches
//! hardware itself; it describes what should happen point by point.
//!
//! # Plan Commands
//!
//! - `MoveTo` - move a motor and wait for it
//! - `Read` - read every field of a detector into the current event
//! - `Wait` - settle for a duration
//! - `Checkpoint` - safe point, where an abort is observed
//! - `EmitEvent` - close the current point as an EventDoc
//!
//! # Example
//!
//! ```rust,ignore
//! let plan = LineScan::new("sample_stage_y", -1.25, -3.25, 51)
//!     .with_detector("rasor_det");
//!
//! // MoveTo("sample_stage_y", -1.25)
//! // Checkpoint
//! // Read("rasor_det")
//! // EmitEvent
//! // MoveTo("sample_stage_y", -1.29)
//! // ...
//! ```

use std::collections::HashMap;

/// Commands that plans yield for the RunEngine to execute
#[derive(Debug, Clone, PartialEq)]
pub enum PlanCommand {
    /// Move a device to an absolute position and wait for completion
    MoveTo {
        /// Device to move
        device_id: String,
        /// Target position
        position: f64,
    },
    /// Read a detector into the pending event
    Read {
        /// Device to read
        device_id: String,
    },
    /// Wait for a duration in seconds
    Wait {
        /// Duration in seconds
        seconds: f64,
    },
    /// Checkpoint - safe point for abort
    Checkpoint {
        /// Checkpoint label
        label: String,
    },
    /// Emit the pending readings (plus mover readbacks) as an event
    EmitEvent {
        /// Stream name
        stream: String,
    },
}

/// Plan trait - all plans implement this to generate commands
pub trait Plan: Send + Sync {
    /// Plan type identifier (e.g., "line_scan", "count")
    fn plan_type(&self) -> &str;

    /// Human-readable plan name
    fn plan_name(&self) -> &str;

    /// Plan arguments recorded in the start document
    fn plan_args(&self) -> HashMap<String, String>;

    /// Devices that will be moved; their readbacks go in every event
    fn movers(&self) -> Vec<String>;

    /// Devices that will be read
    fn detectors(&self) -> Vec<String>;

    /// Total number of points
    fn num_points(&self) -> usize;

    /// Generate the next command, returning None when complete
    fn next_command(&mut self) -> Option<PlanCommand>;

    /// Reset the plan to start from the beginning
    fn reset(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PointStep {
    Move,
    Settle,
    Checkpoint,
    Read { detector_idx: usize },
    Emit,
}

/// Step scan of a single axis over `num_points` evenly spaced positions,
/// both ends included.
#[derive(Debug, Clone)]
pub struct LineScan {
    axis: String,
    start: f64,
    stop: f64,
    num_points: usize,
    detectors: Vec<String>,
    settle_time: f64,

    current_point: usize,
    current_step: PointStep,
}

impl LineScan {
    /// Create a new LineScan
    pub fn new(axis: &str, start: f64, stop: f64, num_points: usize) -> Self {
        Self {
            axis: axis.to_string(),
            start,
            stop,
            num_points,
            detectors: Vec::new(),
            settle_time: 0.0,
            current_point: 0,
            current_step: PointStep::Move,
        }
    }

    /// Add a detector to the scan
    pub fn with_detector(mut self, detector: &str) -> Self {
        self.detectors.push(detector.to_string());
        self
    }

    /// Settle time after each move, in seconds
    pub fn with_settle_time(mut self, seconds: f64) -> Self {
        self.settle_time = seconds;
        self
    }

    /// Position of the given point index
    pub fn position_at(&self, point: usize) -> f64 {
        if self.num_points <= 1 {
            self.start
        } else {
            let step = (self.stop - self.start) / (self.num_points - 1) as f64;
            self.start + step * point as f64
        }
    }
}

impl Plan for LineScan {
    fn plan_type(&self) -> &str {
        "line_scan"
    }

    fn plan_name(&self) -> &str {
        "Line Scan"
    }

    fn plan_args(&self) -> HashMap<String, String> {
        HashMap::from([
            ("axis".to_string(), self.axis.clone()),
            ("start".to_string(), self.start.to_string()),
            ("stop".to_string(), self.stop.to_string()),
            ("num_points".to_string(), self.num_points.to_string()),
            ("detectors".to_string(), self.detectors.join(",")),
        ])
    }

    fn movers(&self) -> Vec<String> {
        vec![self.axis.clone()]
    }

    fn detectors(&self) -> Vec<String> {
        self.detectors.clone()
    }

    fn num_points(&self) -> usize {
        self.num_points
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        loop {
            if self.current_point >= self.num_points {
                return None;
            }
            match self.current_step {
                PointStep::Move => {
                    self.current_step = if self.settle_time > 0.0 {
                        PointStep::Settle
                    } else {
                        PointStep::Checkpoint
                    };
                    return Some(PlanCommand::MoveTo {
                        device_id: self.axis.clone(),
                        position: self.position_at(self.current_point),
                    });
                }
                PointStep::Settle => {
                    self.current_step = PointStep::Checkpoint;
                    return Some(PlanCommand::Wait {
                        seconds: self.settle_time,
                    });
                }
                PointStep::Checkpoint => {
                    self.current_step = PointStep::Read { detector_idx: 0 };
                    return Some(PlanCommand::Checkpoint {
                        label: format!("point_{}", self.current_point),
                    });
                }
                PointStep::Read { detector_idx } => match self.detectors.get(detector_idx) {
                    Some(det) => {
                        self.current_step = PointStep::Read {
                            detector_idx: detector_idx + 1,
                        };
                        return Some(PlanCommand::Read {
                            device_id: det.clone(),
                        });
                    }
                    None => self.current_step = PointStep::Emit,
                },
                PointStep::Emit => {
                    self.current_point += 1;
                    self.current_step = PointStep::Move;
                    return Some(PlanCommand::EmitEvent {
                        stream: "primary".to_string(),
                    });
                }
            }
        }
    }

    fn reset(&mut self) {
        self.current_point = 0;
        self.current_step = PointStep::Move;
    }
}

/// Read detectors `num_points` times without moving anything.
#[derive(Debug, Clone)]
pub struct Count {
    num_points: usize,
    delay: f64,
    detectors: Vec<String>,
    current_point: usize,
    current_step: PointStep,
}

impl Count {
    /// Create a new Count plan
    pub fn new(num_points: usize) -> Self {
        Self {
            num_points,
            delay: 0.0,
            detectors: Vec::new(),
            current_point: 0,
            current_step: PointStep::Checkpoint,
        }
    }

    /// Add a detector to the plan
    pub fn with_detector(mut self, detector: &str) -> Self {
        self.detectors.push(detector.to_string());
        self
    }

    /// Add several detectors
    pub fn with_detectors<S: AsRef<str>>(mut self, detectors: &[S]) -> Self {
        self.detectors
            .extend(detectors.iter().map(|d| d.as_ref().to_string()));
        self
    }

    /// Delay between readings in seconds
    pub fn with_delay(mut self, seconds: f64) -> Self {
        self.delay = seconds;
        self
    }
}

impl Plan for Count {
    fn plan_type(&self) -> &str {
        "count"
    }

    fn plan_name(&self) -> &str {
        "Count"
    }

    fn plan_args(&self) -> HashMap<String, String> {
        HashMap::from([
            ("num_points".to_string(), self.num_points.to_string()),
            ("delay".to_string(), self.delay.to_string()),
            ("detectors".to_string(), self.detectors.join(",")),
        ])
    }

    fn movers(&self) -> Vec<String> {
        Vec::new()
    }

    fn detectors(&self) -> Vec<String> {
        self.detectors.clone()
    }

    fn num_points(&self) -> usize {
        self.num_points
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        loop {
            if self.current_point >= self.num_points {
                return None;
            }
            match self.current_step {
                // Count has nothing to move; the delay takes the move slot
                PointStep::Move | PointStep::Settle => {
                    self.current_step = PointStep::Checkpoint;
                    return Some(PlanCommand::Wait {
                        seconds: self.delay,
                    });
                }
                PointStep::Checkpoint => {
                    self.current_step = PointStep::Read { detector_idx: 0 };
                    return Some(PlanCommand::Checkpoint {
                        label: format!("count_{}", self.current_point),
                    });
                }
                PointStep::Read { detector_idx } => match self.detectors.get(detector_idx) {
                    Some(det) => {
                        self.current_step = PointStep::Read {
                            detector_idx: detector_idx + 1,
                        };
                        return Some(PlanCommand::Read {
                            device_id: det.clone(),
                        });
                    }
                    None => self.current_step = PointStep::Emit,
                },
                PointStep::Emit => {
                    self.current_point += 1;
                    self.current_step = if self.delay > 0.0 {
                        PointStep::Move
                    } else {
                        PointStep::Checkpoint
                    };
                    return Some(PlanCommand::EmitEvent {
                        stream: "primary".to_string(),
                    });
                }
            }
        }
    }

    fn reset(&mut self) {
        self.current_point = 0;
        self.current_step = PointStep::Checkpoint;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(plan: &mut dyn Plan) -> Vec<PlanCommand> {
        std::iter::from_fn(|| plan.next_command()).collect()
    }

    #[test]
    fn test_line_scan_command_order() {
        let mut plan = LineScan::new("stage_y", 0.0, 1.0, 2)
            .with_detector("det")
            .with_settle_time(0.1);

        let commands = drain(&mut plan);
        // Move, Wait, Checkpoint, Read, Emit per point
        assert_eq!(commands.len(), 10);
        assert_eq!(
            commands[0],
            PlanCommand::MoveTo {
                device_id: "stage_y".to_string(),
                position: 0.0
            }
        );
        assert_eq!(commands[1], PlanCommand::Wait { seconds: 0.1 });
        assert!(matches!(commands[3], PlanCommand::Read { .. }));
        assert!(matches!(commands[4], PlanCommand::EmitEvent { .. }));
    }

    #[test]
    fn test_line_scan_positions_descending() {
        let mut plan = LineScan::new("y", -1.25, -3.25, 51);

        let positions: Vec<f64> = drain(&mut plan)
            .into_iter()
            .filter_map(|cmd| match cmd {
                PlanCommand::MoveTo { position, .. } => Some(position),
                _ => None,
            })
            .collect();

        assert_eq!(positions.len(), 51);
        assert!((positions[0] + 1.25).abs() < 1e-10);
        assert!((positions[25] + 2.25).abs() < 1e-10);
        assert!((positions[50] + 3.25).abs() < 1e-10);
    }

    #[test]
    fn test_count_plan_reads_each_detector() {
        let mut plan = Count::new(3).with_detectors(&["a", "b"]);

        let commands = drain(&mut plan);
        let reads = commands
            .iter()
            .filter(|c| matches!(c, PlanCommand::Read { .. }))
            .count();
        let events = commands
            .iter()
            .filter(|c| matches!(c, PlanCommand::EmitEvent { .. }))
            .count();
        assert_eq!(reads, 6);
        assert_eq!(events, 3);
        assert!(!commands.iter().any(|c| matches!(c, PlanCommand::Wait { .. })));
    }

    #[test]
    fn test_count_delay_between_points() {
        let mut plan = Count::new(2).with_detector("d").with_delay(0.5);
        let waits = drain(&mut plan)
            .into_iter()
            .filter(|c| matches!(c, PlanCommand::Wait { .. }))
            .count();
        assert_eq!(waits, 1);
    }

    #[test]
    fn test_plan_reset() {
        let mut plan = LineScan::new("x", 0.0, 1.0, 3).with_detector("d");
        let first = drain(&mut plan);
        plan.reset();
        assert_eq!(drain(&mut plan), first);
    }
}
