//! Ultrasonic bin-level sensor.
//!
//! Triggers a pulse, times the echo under a hard timeout, smooths the
//! distance with a moving average, and maps it linearly to a fill
//! fraction between the configured empty and full distances.

use std::collections::VecDeque;
use std::time::Duration;

use sorter_common::config::BinSensorSettings;

use crate::gpio::{GpioBackend, HalError};

/// Speed of sound at room temperature [m/s].
const SPEED_OF_SOUND_MPS: f64 = 343.0;

/// One smoothed reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillReading {
    /// Smoothed distance to the fill surface [m].
    pub distance_m: f64,
    /// Linear fill fraction, clamped to `0..=1`.
    pub fill_fraction: f64,
}

pub struct UltrasonicSensor {
    trigger_pin: u8,
    echo_pin: u8,
    empty_distance_m: f64,
    full_distance_m: f64,
    timeout: Duration,
    smoothing_samples: usize,
    window: VecDeque<f64>,
}

impl UltrasonicSensor {
    pub fn from_settings(
        settings: &BinSensorSettings,
        measurement_timeout_s: f64,
        smoothing_samples: usize,
    ) -> Self {
        Self {
            trigger_pin: settings.trigger_pin_bcm,
            echo_pin: settings.echo_pin_bcm,
            empty_distance_m: settings.empty_distance_m,
            full_distance_m: settings.full_distance_m,
            timeout: Duration::from_secs_f64(measurement_timeout_s.max(0.001)),
            smoothing_samples: smoothing_samples.max(1),
            window: VecDeque::new(),
        }
    }

    /// Raw single-shot distance [m].
    fn measure_distance_m(&self, backend: &dyn GpioBackend) -> Result<f64, HalError> {
        let echo = backend.measure_echo(self.trigger_pin, self.echo_pin, self.timeout)?;
        let distance = echo.as_secs_f64() * SPEED_OF_SOUND_MPS / 2.0;
        // An echo far past the empty distance is a misread, not a level.
        if distance > self.empty_distance_m * 2.0 {
            return Err(HalError::Read {
                pin: self.echo_pin,
                reason: format!("implausible distance {distance:.3} m"),
            });
        }
        Ok(distance)
    }

    /// Measure, smooth, and translate to a fill fraction.
    pub fn read_fill(&mut self, backend: &dyn GpioBackend) -> Result<FillReading, HalError> {
        let distance = self.measure_distance_m(backend)?;
        if self.window.len() == self.smoothing_samples {
            self.window.pop_front();
        }
        self.window.push_back(distance);
        let avg = self.window.iter().sum::<f64>() / self.window.len() as f64;

        let span = self.empty_distance_m - self.full_distance_m;
        let fill = ((self.empty_distance_m - avg) / span).clamp(0.0, 1.0);
        Ok(FillReading {
            distance_m: avg,
            fill_fraction: fill,
        })
    }

    /// Drop the smoothing history, e.g. after the sensor was degraded.
    pub fn reset(&mut self) {
        self.window.clear();
    }
}
