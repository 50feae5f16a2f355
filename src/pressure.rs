//! Coarse load labels shared by the scheduler and the batch subsystem.

use serde::Serialize;

// ---

/// Server-health label derived from queue pressure or process memory.
/// Ordered so the worse of two observations can be taken with `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl PressureLevel {
    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            PressureLevel::Low => "low",
            PressureLevel::Medium => "medium",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn ordering_lets_callers_take_the_worse_label() {
        // ---
        assert!(PressureLevel::Critical > PressureLevel::High);
        assert!(PressureLevel::High > PressureLevel::Medium);
        assert!(PressureLevel::Medium > PressureLevel::Low);
        assert_eq!(
            PressureLevel::Medium.max(PressureLevel::High),
            PressureLevel::High
        );
    }
}
