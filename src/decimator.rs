//! # Display Decimation
//!
//! Thins the raw acquisition stream down to the visualization rate.
//!
//! A fractional counter accumulates one unit per frame. When it reaches the
//! sampling/visualization ratio the frame is emitted and the ratio is
//! subtracted, keeping the leftover phase. Resetting to zero instead would
//! drop the fraction every time and the display rate would drift low over a
//! long recording.

const MILLIS_PER_SECOND: f64 = 1000.0;

#[derive(Debug, Clone)]
pub struct Decimator {
    /// Raw frames per displayed frame
    sampling_frames: f64,
    sampling_counter: f64,
    /// Acquisition ticks seen so far
    time_counter: u64,
    x_value: f64,
    sampling_frequency: f64,
}

impl Decimator {
    /// Both frequencies must be positive. A visualization rate at or above the
    /// sampling rate displays every frame.
    pub fn new(sampling_frequency: u32, visualization_frequency: u32) -> Self {
        let sampling_frequency = f64::from(sampling_frequency.max(1));
        let visualization_frequency = f64::from(visualization_frequency.max(1));

        Self {
            sampling_frames: sampling_frequency / visualization_frequency,
            sampling_counter: 0.0,
            time_counter: 0,
            x_value: 0.0,
            sampling_frequency,
        }
    }

    /// Advance by one acquisition tick.
    ///
    /// Returns the display timestamp in milliseconds when this frame should be
    /// shown, `None` when it is skipped.
    pub fn on_frame(&mut self) -> Option<f64> {
        self.time_counter += 1;

        if self.sampling_frames <= 1.0 {
            return Some(self.update_x_value());
        }

        self.sampling_counter += 1.0;
        if self.sampling_counter >= self.sampling_frames {
            self.sampling_counter -= self.sampling_frames;
            Some(self.update_x_value())
        } else {
            None
        }
    }

    fn update_x_value(&mut self) -> f64 {
        self.x_value = self.time_counter as f64 / self.sampling_frequency * MILLIS_PER_SECOND;
        self.x_value
    }

    pub fn sampling_frames(&self) -> f64 {
        self.sampling_frames
    }

    /// Last emitted display timestamp
    pub fn x_value(&self) -> f64 {
        self.x_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(decimator: &mut Decimator, frames: u64) -> Vec<f64> {
        (0..frames).filter_map(|_| decimator.on_frame()).collect()
    }

    #[test]
    fn test_thousand_to_hundred() {
        let mut decimator = Decimator::new(1000, 100);
        let x_values = emitted(&mut decimator, 1000);

        assert_eq!(x_values.len(), 100);
        for (i, x) in x_values.iter().enumerate() {
            assert!((x - (i as f64 + 1.0) * 10.0).abs() < 1e-9, "x[{}] = {}", i, x);
        }
        assert!((decimator.x_value() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_equal_rates_emit_every_frame() {
        let mut decimator = Decimator::new(100, 100);
        assert_eq!(emitted(&mut decimator, 250).len(), 250);

        let mut faster_display = Decimator::new(100, 400);
        assert!(faster_display.sampling_frames() < 1.0);
        assert_eq!(emitted(&mut faster_display, 250).len(), 250);
    }

    #[test]
    fn test_fractional_ratio_does_not_drift() {
        let cases = [(1000u32, 300u32), (1000, 7), (100, 3), (44100, 60), (1000, 999)];

        for (sampling, visualization) in cases {
            let mut decimator = Decimator::new(sampling, visualization);
            let frames = 1_000_000u64;
            let count = emitted(&mut decimator, frames).len() as f64;
            let expected = frames as f64 * f64::from(visualization) / f64::from(sampling);

            assert!(
                (count - expected).abs() <= 1.0,
                "{} Hz -> {} Hz: {} emissions, expected {}",
                sampling,
                visualization,
                count,
                expected
            );
        }
    }

    #[test]
    fn test_x_values_increase() {
        let mut decimator = Decimator::new(1000, 300);
        let x_values = emitted(&mut decimator, 10_000);

        assert!(x_values.windows(2).all(|w| w[1] > w[0]));
    }
}
