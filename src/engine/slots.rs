use crate::model::{Ms, Span};

// ── Slot grid ─────────────────────────────────────────────────────

/// Discretisation parameters for one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGrid {
    /// Start of the day; every slot start is `origin + k * step`.
    pub origin: Ms,
    pub duration: Ms,
    pub step: Ms,
    /// Lead-time cut-off; only set for the current day.
    pub earliest: Option<Ms>,
}

impl SlotGrid {
    /// Smallest grid instant `>= t`.
    pub fn align_up(&self, t: Ms) -> Ms {
        let offset = t - self.origin;
        self.origin + (offset + self.step - 1).div_euclid(self.step) * self.step
    }

    /// Ascending starts `t` inside `allowed` with `t + duration <= allowed.end`.
    pub fn starts_within(&self, allowed: &Span) -> Vec<Ms> {
        if self.duration <= 0 || self.step <= 0 {
            return Vec::new();
        }
        let floor = match self.earliest {
            Some(e) => allowed.start.max(e),
            None => allowed.start,
        };
        let last_start = allowed.end - self.duration;
        let mut t = self.align_up(floor);
        let mut out = Vec::new();
        while t <= last_start {
            out.push(t);
            t += self.step;
        }
        out
    }

    /// Slots across every free window, in order.
    pub fn slots(&self, free: &[Span]) -> Vec<Span> {
        free.iter()
            .flat_map(|w| self.starts_within(w))
            .map(|t| Span::new(t, t + self.duration))
            .collect()
    }
}

/// True if `candidate` overlaps any busy span. Touching is not a conflict.
pub fn conflicts_with(candidate: &Span, busy: &[Span]) -> bool {
    busy.iter().any(|b| candidate.overlaps(b))
}
