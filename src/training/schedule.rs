use burn::{lr_scheduler::LrScheduler, prelude::*, tensor::backend::Backend, LearningRate};

/// Step decay: the rate is multiplied by `gamma` every `step_size` iterations.
#[derive(Config, Debug)]
pub struct StepLrSchedulerConfig {
    pub initial_lr: LearningRate,
    /// Iterations between two decays.
    pub step_size: usize,
    #[config(default = 0.1)]
    pub gamma: f64,
}

impl StepLrSchedulerConfig {
    pub fn init(&self) -> StepLrScheduler {
        StepLrScheduler {
            initial_lr: self.initial_lr,
            step_size: self.step_size.max(1),
            gamma: self.gamma,
            iteration: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StepLrScheduler {
    initial_lr: LearningRate,
    step_size: usize,
    gamma: f64,
    iteration: usize,
}

impl StepLrScheduler {
    /// Rate used for iteration `iteration`, counting from zero.
    pub fn rate_at(&self, iteration: usize) -> LearningRate {
        let decays = (iteration / self.step_size).min(i32::MAX as usize) as i32;
        self.initial_lr * self.gamma.powi(decays)
    }
}

impl<B: Backend> LrScheduler<B> for StepLrScheduler {
    type Record = usize;

    fn step(&mut self) -> LearningRate {
        let rate = self.rate_at(self.iteration);
        self.iteration += 1;
        rate
    }

    fn to_record(&self) -> Self::Record {
        self.iteration
    }

    fn load_record(mut self, record: Self::Record) -> Self {
        self.iteration = record;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    fn step(scheduler: &mut StepLrScheduler) -> LearningRate {
        LrScheduler::<NdArray>::step(scheduler)
    }

    #[test]
    fn test_rate_decays_every_step_size_iterations() {
        let mut scheduler = StepLrSchedulerConfig::new(1.0e-3, 3).init();

        let rates: Vec<f64> = (0..7).map(|_| step(&mut scheduler)).collect();

        for rate in &rates[..3] {
            assert!((rate - 1.0e-3).abs() < 1e-12);
        }
        for rate in &rates[3..6] {
            assert!((rate - 1.0e-4).abs() < 1e-12);
        }
        assert!((rates[6] - 1.0e-5).abs() < 1e-12);
    }

    #[test]
    fn test_record_resumes_the_schedule() {
        let mut scheduler = StepLrSchedulerConfig::new(1.0, 2).with_gamma(0.5).init();
        step(&mut scheduler);
        step(&mut scheduler);
        let record = LrScheduler::<NdArray>::to_record(&scheduler);

        let mut resumed = LrScheduler::<NdArray>::load_record(
            StepLrSchedulerConfig::new(1.0, 2).with_gamma(0.5).init(),
            record,
        );

        assert_eq!(step(&mut resumed), 0.5);
        assert_eq!(step(&mut resumed), 0.5);
        assert_eq!(step(&mut resumed), 0.25);
    }

    #[test]
    fn test_zero_step_size_decays_every_iteration() {
        let mut scheduler = StepLrSchedulerConfig::new(1.0, 0).with_gamma(0.5).init();
        assert_eq!(step(&mut scheduler), 1.0);
        assert_eq!(step(&mut scheduler), 0.5);
    }
}
