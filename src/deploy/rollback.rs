// ABOUTME: Compensating actions for a deployment that failed part-way.
// ABOUTME: Steps are registered as the deploy progresses and run in reverse order on failure.

/// A compensating action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    /// Put the maintenance placeholder back in front of users.
    SwitchToMaintenance,
    /// Unmount the target directory and detach the image's loop device.
    ReleaseImage,
}

/// Ordered compensations for an in-flight deployment.
///
/// The plan starts armed; a successful deployment disarms it so nothing runs.
#[derive(Debug, Clone)]
pub struct RollbackPlan {
    steps: Vec<Compensation>,
    armed: bool,
}

impl Default for RollbackPlan {
    fn default() -> Self {
        Self::new()
    }
}

impl RollbackPlan {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            armed: true,
        }
    }

    /// Register `step`; it runs before every step registered earlier.
    pub fn register(&mut self, step: Compensation) {
        if !self.steps.contains(&step) {
            self.steps.push(step);
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Steps to run, most recent first. Empty once disarmed.
    pub fn steps(&self) -> Vec<Compensation> {
        if !self.armed {
            return Vec::new();
        }
        self.steps.iter().rev().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_run_in_reverse_registration_order() {
        let mut plan = RollbackPlan::new();
        plan.register(Compensation::ReleaseImage);
        plan.register(Compensation::SwitchToMaintenance);
        plan.register(Compensation::ReleaseImage);
        assert_eq!(
            plan.steps(),
            [Compensation::SwitchToMaintenance, Compensation::ReleaseImage]
        );
    }

    #[test]
    fn disarmed_plan_has_nothing_to_do() {
        let mut plan = RollbackPlan::new();
        plan.register(Compensation::SwitchToMaintenance);
        plan.disarm();
        assert!(!plan.is_armed());
        assert!(plan.steps().is_empty());
    }
}
