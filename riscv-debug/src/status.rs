use enum_primitive_derive::Primitive;

/// The status of a hart.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CoreStatus {
    /// The hart is currently running.
    Running,
    /// The hart is currently halted. This also specifies the reason as a payload.
    Halted(HaltReason),
    /// The hart exists, but is temporarily unavailable (powered down, in reset).
    Unavailable,
    /// The Debug Module reports that no hart with this index exists.
    NonExistent,
    /// The hart state is currently unknown. This is always the case when the hart is first created.
    Unknown,
}

impl CoreStatus {
    /// Returns `true` if the hart is currently halted.
    pub fn is_halted(&self) -> bool {
        matches!(self, CoreStatus::Halted(_))
    }

    /// Returns `true` if the hart is currently running.
    pub fn is_running(&self) -> bool {
        self == &Self::Running
    }
}

/// When the hart halts due to a breakpoint request, we can sometimes distinguish
/// between a software and hardware breakpoint.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BreakpointCause {
    /// We encountered a hardware breakpoint.
    Hardware,
    /// We encountered a software breakpoint instruction.
    Software,
    /// The target requested the host perform a semihosting operation.
    Semihosting,
}

/// The reason why a hart was halted.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum HaltReason {
    /// Hart halted due to a breakpoint.
    Breakpoint(BreakpointCause),
    /// Hart halted due to a data watchpoint, or a trigger we could not attribute.
    Watchpoint,
    /// Hart halted after single step
    Step,
    /// Hart halted because of a halt request, a reset halt request or a halt group.
    Request,
    /// Unknown reason for halt.
    ///
    /// This can happen for example when the hart is already halted when we connect.
    Unknown,
}

/// Value of `dcsr.cause`.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Primitive)]
pub enum DcsrCause {
    /// An `ebreak` instruction was executed.
    Ebreak = 1,
    /// A trigger fired.
    Trigger = 2,
    /// The debugger requested a halt.
    HaltRequest = 3,
    /// The hart single stepped.
    Step = 4,
    /// The hart halted directly out of reset.
    ResetHaltRequest = 5,
    /// The hart halted because of its halt group.
    Group = 6,
}

#[cfg(test)]
mod test {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn cause_decoding() {
        assert_eq!(DcsrCause::from_u32(2), Some(DcsrCause::Trigger));
        assert_eq!(DcsrCause::from_u32(6), Some(DcsrCause::Group));
        assert_eq!(DcsrCause::from_u32(0), None);
        assert_eq!(DcsrCause::from_u32(7), None);
    }

    #[test]
    fn status_predicates() {
        assert!(CoreStatus::Halted(HaltReason::Step).is_halted());
        assert!(!CoreStatus::Unavailable.is_running());
        assert!(CoreStatus::Running.is_running());
    }
}
