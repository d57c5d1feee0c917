use serde::{Deserialize, Serialize};

/// Queue fill ratio above which a node counts as overloaded.
pub const QUEUE_OVERLOAD_RATIO: f64 = 0.8;

/// Slot usage ratio above which a node counts as overloaded.
pub const PROCESSING_OVERLOAD_RATIO: f64 = 0.9;

/// Pending items per requested helper clone.
pub const TASKS_PER_CLONE: usize = 20;

/// Point-in-time load, derived from node state and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub queue_load: f64,
    pub processing_load: f64,
    pub overall: f64,
    pub is_overloaded: bool,
}

impl LoadSnapshot {
    pub fn compute(queue_size: usize, max_queue: usize, processing: usize, max_concurrent: usize) -> Self {
        let queue_load = ratio(queue_size, max_queue);
        let processing_load = ratio(processing, max_concurrent);
        Self {
            queue_load,
            processing_load,
            overall: (queue_load + processing_load) / 2.0,
            is_overloaded: queue_load > QUEUE_OVERLOAD_RATIO
                || processing_load > PROCESSING_OVERLOAD_RATIO,
        }
    }
}

fn ratio(n: usize, max: usize) -> f64 {
    if max == 0 {
        0.0
    } else {
        n as f64 / max as f64
    }
}

/// Helper clones to ask for: one per [`TASKS_PER_CLONE`] pending items, at least one, capped.
pub fn clones_needed(queue_size: usize, clone_limit: usize) -> usize {
    queue_size.div_ceil(TASKS_PER_CLONE).max(1).min(clone_limit)
}

/// Coarse macro-state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodePhase {
    Normal,
    Overloaded,
    HelpRequested,
    Helped,
    ShuttingDown,
}

impl NodePhase {
    pub fn derive(shutting_down: bool, helpers: usize, help_in_flight: bool, load: &LoadSnapshot) -> Self {
        if shutting_down {
            Self::ShuttingDown
        } else if helpers > 0 {
            Self::Helped
        } else if help_in_flight {
            Self::HelpRequested
        } else if load.is_overloaded {
            Self::Overloaded
        } else {
            Self::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_ratio_above_threshold_is_overloaded() {
        let load = LoadSnapshot::compute(900, 1000, 0, 5);
        assert!((load.queue_load - 0.9).abs() < f64::EPSILON);
        assert_eq!(load.processing_load, 0.0);
        assert!((load.overall - 0.45).abs() < 1e-9);
        assert!(load.is_overloaded);
    }

    #[test]
    fn exactly_at_queue_threshold_is_not_overloaded() {
        let load = LoadSnapshot::compute(800, 1000, 0, 5);
        assert!(!load.is_overloaded);
    }

    #[test]
    fn saturated_slots_are_overloaded() {
        let load = LoadSnapshot::compute(0, 1000, 5, 5);
        assert_eq!(load.processing_load, 1.0);
        assert!(load.is_overloaded);

        let load = LoadSnapshot::compute(0, 1000, 9, 10);
        assert!(!load.is_overloaded);
    }

    #[test]
    fn clones_needed_scales_and_caps() {
        assert_eq!(clones_needed(0, 5), 1);
        assert_eq!(clones_needed(20, 5), 1);
        assert_eq!(clones_needed(21, 5), 2);
        assert_eq!(clones_needed(55, 5), 3);
        assert_eq!(clones_needed(900, 5), 5);
    }

    #[test]
    fn phase_precedence() {
        let calm = LoadSnapshot::compute(0, 10, 0, 5);
        let busy = LoadSnapshot::compute(9, 10, 0, 5);
        assert_eq!(NodePhase::derive(false, 0, false, &calm), NodePhase::Normal);
        assert_eq!(NodePhase::derive(false, 0, false, &busy), NodePhase::Overloaded);
        assert_eq!(NodePhase::derive(false, 0, true, &busy), NodePhase::HelpRequested);
        assert_eq!(NodePhase::derive(false, 2, true, &busy), NodePhase::Helped);
        assert_eq!(NodePhase::derive(true, 2, true, &busy), NodePhase::ShuttingDown);
    }
}
