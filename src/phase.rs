use crate::config::SessionConfig;
use crate::protocol::AgentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Exploring,
    Solving,
    Ended,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Exploring => "Exploring",
            Phase::Solving => "Solving",
            Phase::Ended => "Ended",
        }
    }

    pub fn next(self) -> Phase {
        match self {
            Phase::Exploring => Phase::Solving,
            Phase::Solving => Phase::Ended,
            Phase::Ended => Phase::Exploring,
        }
    }

    /// Status carried by pings sent during this phase. `Ended` announces
    /// `Explore` because the answer to that ping resolves after the wrap.
    pub fn agent_status(self) -> AgentStatus {
        match self {
            Phase::Exploring | Phase::Ended => AgentStatus::Explore,
            Phase::Solving => AgentStatus::Solve,
        }
    }
}

/// Per-phase step budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepLimits {
    pub exploring: u32,
    pub solving: u32,
    pub ended: u32,
}

impl StepLimits {
    pub fn of(&self, phase: Phase) -> u32 {
        match phase {
            Phase::Exploring => self.exploring,
            Phase::Solving => self.solving,
            Phase::Ended => self.ended,
        }
    }
}

impl From<&SessionConfig> for StepLimits {
    fn from(cfg: &SessionConfig) -> Self {
        Self {
            exploring: cfg.max_exploration_steps,
            solving: cfg.max_solving_steps,
            ended: cfg.max_ended_steps,
        }
    }
}

/// Cyclic phase machine: `Exploring → Solving → Ended → Exploring`.
#[derive(Debug, Clone)]
pub struct PhaseClock {
    phase: Phase,
    step: u32,
    limits: StepLimits,
}

impl PhaseClock {
    pub fn new(limits: StepLimits) -> Self {
        Self {
            phase: Phase::Exploring,
            step: 0,
            limits,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn limit(&self) -> u32 {
        self.limits.of(self.phase)
    }

    /// Count one tick. Returns the new phase when the budget was reached.
    pub fn advance(&mut self) -> Option<Phase> {
        self.step += 1;
        if self.step >= self.limit() {
            self.phase = self.phase.next();
            self.step = 0;
            return Some(self.phase);
        }
        None
    }
}
