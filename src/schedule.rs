use std::f64::consts::PI;

use burn::config::Config;

/// Cosine annealing that gives way to step decay once the first milestone passes.
///
/// Epochs are counted from 0. Milestones are exclusive: decay kicks in on the
/// epoch after the milestone.
#[derive(Config, Debug)]
pub struct LearningRateScheduleConfig {
    pub initial: f64,

    #[config(default = "vec![60, 80, 100]")]
    pub decay_epochs: Vec<usize>,

    #[config(default = 0.1)]
    pub decay_rate: f64,

    #[config(default = 200)]
    pub cosine_period: usize,

    #[config(default = 0.0)]
    pub min: f64,
}

impl LearningRateScheduleConfig {
    pub fn learning_rate(&self, epoch: usize) -> f64 {
        let steps = self.decay_epochs.iter().filter(|&&milestone| epoch > milestone).count();

        if steps > 0 {
            return self.initial * self.decay_rate.powi(steps as i32);
        }

        let progress = epoch as f64 / self.cosine_period as f64;
        self.min + (self.initial - self.min) * (1.0 + (PI * progress).cos()) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-12,
            "learning rate {actual}, expected {expected}"
        );
    }

    #[test]
    fn starts_at_initial_rate() {
        let schedule = LearningRateScheduleConfig::new(0.01);

        assert_close(schedule.learning_rate(0), 0.01);
    }

    #[test]
    fn follows_cosine_before_first_milestone() {
        let schedule = LearningRateScheduleConfig::new(0.01);

        assert_close(schedule.learning_rate(50), 0.01 * (1.0 + (PI / 4.0).cos()) / 2.0);
        assert_close(schedule.learning_rate(60), 0.01 * (1.0 + (0.3 * PI).cos()) / 2.0);
        assert!(schedule.learning_rate(30) < schedule.learning_rate(29));
    }

    #[test]
    fn steps_down_after_each_milestone() {
        let schedule = LearningRateScheduleConfig::new(0.01);

        assert_close(schedule.learning_rate(61), 1e-3);
        assert_close(schedule.learning_rate(80), 1e-3);
        assert_close(schedule.learning_rate(81), 1e-4);
        assert_close(schedule.learning_rate(100), 1e-4);
        assert_close(schedule.learning_rate(101), 1e-5);
        assert_close(schedule.learning_rate(299), 1e-5);
    }

    #[test]
    fn cosine_reaches_minimum_at_period_end() {
        let schedule = LearningRateScheduleConfig::new(0.1)
            .with_decay_epochs(vec![])
            .with_min(0.001);

        assert_close(schedule.learning_rate(200), 0.001);
        assert_close(schedule.learning_rate(100), 0.0505);
    }
}
