//! Population progress reporting.

/// Completed out of total units of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PopulationProgress {
    pub completed: u64,
    pub total: u64,
}

impl PopulationProgress {
    /// No work known yet.
    pub const NONE: PopulationProgress = PopulationProgress {
        completed: 0,
        total: 0,
    };

    /// Scale used when combining weighted parts.
    const SCALE: u64 = 1_000_000;

    pub fn single(completed: u64, total: u64) -> Self {
        Self {
            completed: completed.min(total),
            total,
        }
    }

    pub fn done() -> Self {
        Self::single(1, 1)
    }

    /// Completed fraction in `[0, 1]`. Unknown totals count as no progress.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }

    /// Starts a progress made of weighted parts.
    pub fn multiple() -> MultiProgressBuilder {
        MultiProgressBuilder::default()
    }
}

/// Combines several progress parts, each weighted by its expected share of
/// the total time.
#[derive(Debug, Default)]
pub struct MultiProgressBuilder {
    parts: Vec<(PopulationProgress, u32)>,
}

impl MultiProgressBuilder {
    pub fn add(mut self, part: PopulationProgress, weight: u32) -> Self {
        self.parts.push((part, weight));
        self
    }

    pub fn build(self) -> PopulationProgress {
        let total_weight: u64 = self.parts.iter().map(|(_, w)| *w as u64).sum();
        if total_weight == 0 {
            return PopulationProgress::NONE;
        }
        let weighted: f64 = self
            .parts
            .iter()
            .map(|(part, weight)| part.fraction() * *weight as f64)
            .sum();
        let completed = (weighted / total_weight as f64 * PopulationProgress::SCALE as f64) as u64;
        PopulationProgress::single(completed, PopulationProgress::SCALE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_progress() {
        assert_eq!(PopulationProgress::single(5, 10).fraction(), 0.5);
        assert_eq!(PopulationProgress::single(15, 10).completed, 10);
        assert_eq!(PopulationProgress::NONE.fraction(), 0.0);
        assert_eq!(PopulationProgress::done().fraction(), 1.0);
    }

    #[test]
    fn test_weighted_progress() {
        let progress = PopulationProgress::multiple()
            .add(PopulationProgress::done(), 4)
            .add(PopulationProgress::single(0, 10), 1)
            .add(PopulationProgress::NONE, 2)
            .build();
        let fraction = progress.fraction();
        assert!((fraction - 4.0 / 7.0).abs() < 1e-5, "fraction {}", fraction);

        let complete = PopulationProgress::multiple()
            .add(PopulationProgress::done(), 4)
            .add(PopulationProgress::done(), 2)
            .build();
        assert_eq!(complete.fraction(), 1.0);
    }
}
