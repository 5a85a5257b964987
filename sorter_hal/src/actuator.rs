//! Diverter actuators: stepper and on/off variants.
//!
//! Both variants expose the same capability set. A single activation may
//! be in flight per instance; a concurrent call fails fast. Crossing the
//! configured operation count raises the maintenance flag but the
//! activation still runs (operator policy).
//!
//! The variant set is a closed enum resolved from config at init; no
//! runtime plugin registration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use sorter_common::clock::Clock;
use sorter_common::config::{DiverterSettings, DiverterType, StepDirection};

use crate::gpio::{GpioBackend, HalError, Level};

/// Point-in-time actuator status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorStatus {
    pub enabled: bool,
    /// Monotonic timestamp of the last completed activation [ns].
    pub last_op_ts_ns: Option<u64>,
    pub op_count: u64,
    pub fault_count: u64,
    /// Operation count has crossed the maintenance threshold.
    pub maintenance_due: bool,
}

/// Counters shared between the owning worker and status readers.
///
/// The worker thread owns the actuator itself; the orchestrator reads and
/// flips these atomics without touching the hardware path.
#[derive(Debug)]
pub struct ActuatorShared {
    enabled: AtomicBool,
    in_flight: AtomicBool,
    op_count: AtomicU64,
    fault_count: AtomicU64,
    /// 0 = never activated.
    last_op_ts_ns: AtomicU64,
    maintenance_due: AtomicBool,
}

impl ActuatorShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            enabled: AtomicBool::new(true),
            in_flight: AtomicBool::new(false),
            op_count: AtomicU64::new(0),
            fault_count: AtomicU64::new(0),
            last_op_ts_ns: AtomicU64::new(0),
            maintenance_due: AtomicBool::new(false),
        })
    }

    pub fn status(&self) -> ActuatorStatus {
        let last = self.last_op_ts_ns.load(Ordering::Relaxed);
        ActuatorStatus {
            enabled: self.enabled.load(Ordering::Relaxed),
            last_op_ts_ns: (last != 0).then_some(last),
            op_count: self.op_count.load(Ordering::Relaxed),
            fault_count: self.fault_count.load(Ordering::Relaxed),
            maintenance_due: self.maintenance_due.load(Ordering::Relaxed),
        }
    }

    /// Supervisor enable/disable (auto-disable on repeated fault).
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

/// Uniform diverter capability.
pub trait Actuator: Send {
    /// Diverter handle, e.g. `"diverter:metal"`.
    fn name(&self) -> &str;

    /// Drive outputs to their safe resting levels. Called once before use.
    fn initialize(&mut self) -> Result<(), HalError>;

    /// One timed deflection pulse. Blocks the calling (worker) thread for
    /// the duration of the mechanical sequence.
    fn activate(&mut self, duration_s: f64) -> Result<(), HalError>;

    /// Return the mechanism to its home position.
    fn home(&mut self) -> Result<(), HalError>;

    fn status(&self) -> ActuatorStatus;

    /// Shared counter handle for status readers and the supervisor.
    fn shared(&self) -> Arc<ActuatorShared>;

    /// Release outputs. Called once at teardown.
    fn shutdown(&mut self) -> Result<(), HalError>;
}

/// Build the actuator variant a diverter config calls for.
pub fn build_actuator(
    name: impl Into<String>,
    settings: &DiverterSettings,
    backend: Arc<dyn GpioBackend>,
    clock: Arc<dyn Clock>,
) -> Result<Box<dyn Actuator>, HalError> {
    let name = name.into();
    match settings.diverter_type {
        DiverterType::Stepper => Ok(Box::new(StepperDiverter::from_settings(
            name, settings, backend, clock,
        )?)),
        DiverterType::OnOff => Ok(Box::new(OnOffDiverter::from_settings(
            name, settings, backend, clock,
        )?)),
    }
}

// ─── Stepper Variant ────────────────────────────────────────────────

/// Stepper-driven diverter arm: direction + step + enable pins, with a
/// linear ramp on the step delay.
pub struct StepperDiverter {
    name: String,
    backend: Arc<dyn GpioBackend>,
    clock: Arc<dyn Clock>,
    step_pin: u8,
    dir_pin: u8,
    enable_pin: u8,
    steps: u32,
    direction: StepDirection,
    return_to_home: bool,
    ramp_start_delay_us: u64,
    ramp_min_delay_us: u64,
    ramp_accel_steps: u32,
    max_operations: u64,
    shared: Arc<ActuatorShared>,
}

impl StepperDiverter {
    pub fn from_settings(
        name: String,
        settings: &DiverterSettings,
        backend: Arc<dyn GpioBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, HalError> {
        let (step_pin, dir_pin, enable_pin) = match (
            settings.step_pin_bcm,
            settings.dir_pin_bcm,
            settings.enable_pin_bcm,
        ) {
            (Some(s), Some(d), Some(e)) => (s, d, e),
            _ => {
                return Err(HalError::InitFailed(format!(
                    "{name}: stepper requires step, dir and enable pins"
                )));
            }
        };
        Ok(Self {
            name,
            backend,
            clock,
            step_pin,
            dir_pin,
            enable_pin,
            steps: settings.steps_per_activation,
            direction: settings.activation_direction,
            return_to_home: settings.return_to_home,
            ramp_start_delay_us: settings.ramp_start_delay_us,
            ramp_min_delay_us: settings.ramp_min_delay_us,
            ramp_accel_steps: settings.ramp_accel_steps,
            max_operations: settings.maintenance.max_operations,
            shared: ActuatorShared::new(),
        })
    }

    /// Step delay at ramp position `i`: linear from the start delay down
    /// to the minimum over the accel span, then flat.
    fn step_delay_us(&self, i: u32) -> u64 {
        if self.ramp_accel_steps == 0 || i >= self.ramp_accel_steps {
            return self.ramp_min_delay_us;
        }
        let span = self.ramp_start_delay_us - self.ramp_min_delay_us;
        self.ramp_start_delay_us - span * i as u64 / self.ramp_accel_steps as u64
    }

    fn dir_level(direction: StepDirection) -> Level {
        match direction {
            StepDirection::Forward => Level::High,
            StepDirection::Reverse => Level::Low,
        }
    }

    fn run_steps(&self, direction: StepDirection) -> Result<(), HalError> {
        self.backend.write(self.dir_pin, Self::dir_level(direction))?;
        for i in 0..self.steps {
            self.backend.write(self.step_pin, Level::High)?;
            self.backend.write(self.step_pin, Level::Low)?;
            self.clock
                .sleep(Duration::from_micros(self.step_delay_us(i)));
        }
        Ok(())
    }

    /// Full mechanical sequence: enable → out-pass → hold → return-pass
    /// → disable. The return pass completes before this returns, so the
    /// in-flight guard stays held through it.
    fn pulse_sequence(&self, duration_s: f64) -> Result<(), HalError> {
        self.backend.write(self.enable_pin, Level::High)?;
        let result = (|| {
            self.run_steps(self.direction)?;
            if duration_s > 0.0 {
                self.clock.sleep(Duration::from_secs_f64(duration_s));
            }
            if self.return_to_home {
                self.run_steps(self.direction.opposite())?;
            }
            Ok(())
        })();
        // Always drop the enable line, even on a failed pass.
        let disable = self.backend.write(self.enable_pin, Level::Low);
        result.and(disable)
    }
}

impl Actuator for StepperDiverter {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> Result<(), HalError> {
        self.backend.write(self.enable_pin, Level::Low)?;
        self.backend.write(self.step_pin, Level::Low)?;
        self.backend
            .write(self.dir_pin, Self::dir_level(self.direction))?;
        debug!(name = %self.name, "stepper diverter initialized");
        Ok(())
    }

    fn activate(&mut self, duration_s: f64) -> Result<(), HalError> {
        if !self.shared.is_enabled() {
            return Err(HalError::ActuatorDisabled);
        }
        if self
            .shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HalError::ActivationInProgress);
        }

        if self.shared.op_count.load(Ordering::Relaxed) >= self.max_operations {
            self.shared.maintenance_due.store(true, Ordering::Relaxed);
            warn!(name = %self.name, "operation count past maintenance threshold");
        }

        let result = self.pulse_sequence(duration_s);
        match &result {
            Ok(()) => {
                self.shared.op_count.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .last_op_ts_ns
                    .store(self.clock.now_ns().max(1), Ordering::Relaxed);
            }
            Err(_) => {
                self.shared.fault_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.shared.in_flight.store(false, Ordering::Release);
        result
    }

    fn home(&mut self) -> Result<(), HalError> {
        if self
            .shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HalError::ActivationInProgress);
        }
        let result = (|| {
            self.backend.write(self.enable_pin, Level::High)?;
            let pass = self.run_steps(self.direction.opposite());
            let disable = self.backend.write(self.enable_pin, Level::Low);
            pass.and(disable)
        })();
        if result.is_err() {
            self.shared.fault_count.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.in_flight.store(false, Ordering::Release);
        result
    }

    fn status(&self) -> ActuatorStatus {
        self.shared.status()
    }

    fn shared(&self) -> Arc<ActuatorShared> {
        Arc::clone(&self.shared)
    }

    fn shutdown(&mut self) -> Result<(), HalError> {
        self.backend.write(self.enable_pin, Level::Low)?;
        self.backend.write(self.step_pin, Level::Low)
    }
}

// ─── On/Off Variant ─────────────────────────────────────────────────

/// Gated-flap diverter: one pin asserted for the activation duration.
pub struct OnOffDiverter {
    name: String,
    backend: Arc<dyn GpioBackend>,
    clock: Arc<dyn Clock>,
    pin: u8,
    active: Level,
    max_operations: u64,
    shared: Arc<ActuatorShared>,
}

impl OnOffDiverter {
    pub fn from_settings(
        name: String,
        settings: &DiverterSettings,
        backend: Arc<dyn GpioBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, HalError> {
        let pin = settings.pin_bcm.ok_or_else(|| {
            HalError::InitFailed(format!("{name}: on_off diverter requires a pin"))
        })?;
        Ok(Self {
            name,
            backend,
            clock,
            pin,
            active: Level::from_bool(settings.active_high),
            max_operations: settings.maintenance.max_operations,
            shared: ActuatorShared::new(),
        })
    }
}

impl Actuator for OnOffDiverter {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> Result<(), HalError> {
        self.backend.write(self.pin, self.active.toggled())?;
        debug!(name = %self.name, "on/off diverter initialized");
        Ok(())
    }

    fn activate(&mut self, duration_s: f64) -> Result<(), HalError> {
        if !self.shared.is_enabled() {
            return Err(HalError::ActuatorDisabled);
        }
        if self
            .shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HalError::ActivationInProgress);
        }

        if self.shared.op_count.load(Ordering::Relaxed) >= self.max_operations {
            self.shared.maintenance_due.store(true, Ordering::Relaxed);
            warn!(name = %self.name, "operation count past maintenance threshold");
        }

        let result = (|| {
            self.backend.write(self.pin, self.active)?;
            if duration_s > 0.0 {
                self.clock.sleep(Duration::from_secs_f64(duration_s));
            }
            Ok(())
        })();
        // Release the pin even when the assert write failed.
        let release = self.backend.write(self.pin, self.active.toggled());
        let result = result.and(release);

        match &result {
            Ok(()) => {
                self.shared.op_count.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .last_op_ts_ns
                    .store(self.clock.now_ns().max(1), Ordering::Relaxed);
            }
            Err(_) => {
                self.shared.fault_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.shared.in_flight.store(false, Ordering::Release);
        result
    }

    fn home(&mut self) -> Result<(), HalError> {
        self.backend.write(self.pin, self.active.toggled())
    }

    fn status(&self) -> ActuatorStatus {
        self.shared.status()
    }

    fn shared(&self) -> Arc<ActuatorShared> {
        Arc::clone(&self.shared)
    }

    fn shutdown(&mut self) -> Result<(), HalError> {
        self.backend.write(self.pin, self.active.toggled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sorter_common::clock::MonotonicClock;
    use sorter_common::config::MaintenanceSettings;

    use crate::gpio::SimBackend;

    fn stepper_settings() -> DiverterSettings {
        DiverterSettings {
            diverter_type: DiverterType::Stepper,
            step_pin_bcm: Some(2),
            dir_pin_bcm: Some(3),
            enable_pin_bcm: Some(4),
            pin_bcm: None,
            active_high: true,
            steps_per_activation: 4,
            activation_direction: StepDirection::Forward,
            return_to_home: true,
            ramp_start_delay_us: 20,
            ramp_min_delay_us: 5,
            ramp_accel_steps: 2,
            activation_duration_s: Some(0.0),
            activation_lead_s: 0.0,
            maintenance: MaintenanceSettings { max_operations: 2 },
        }
    }

    fn onoff_settings() -> DiverterSettings {
        DiverterSettings {
            diverter_type: DiverterType::OnOff,
            step_pin_bcm: None,
            dir_pin_bcm: None,
            enable_pin_bcm: None,
            pin_bcm: Some(5),
            active_high: true,
            steps_per_activation: 0,
            activation_direction: StepDirection::Forward,
            return_to_home: false,
            ramp_start_delay_us: 0,
            ramp_min_delay_us: 0,
            ramp_accel_steps: 0,
            activation_duration_s: Some(0.0),
            activation_lead_s: 0.0,
            maintenance: MaintenanceSettings::default(),
        }
    }

    fn harness() -> (Arc<SimBackend>, Arc<MonotonicClock>) {
        (Arc::new(SimBackend::new()), Arc::new(MonotonicClock::new()))
    }

    #[test]
    fn stepper_pulses_out_and_back() {
        let (backend, clock) = harness();
        let mut stepper = StepperDiverter::from_settings(
            "diverter:metal".into(),
            &stepper_settings(),
            backend.clone() as Arc<dyn GpioBackend>,
            clock as Arc<dyn Clock>,
        )
        .unwrap();
        stepper.initialize().unwrap();
        stepper.activate(0.0).unwrap();

        // 4 steps out + 4 steps back.
        assert_eq!(backend.rising_edges(2), 8);
        // Enable line released at the end.
        assert_eq!(backend.output(4), Some(Level::Low));
        let status = stepper.status();
        assert_eq!(status.op_count, 1);
        assert_eq!(status.fault_count, 0);
        assert!(status.last_op_ts_ns.is_some());
    }

    #[test]
    fn stepper_without_return_only_steps_out() {
        let (backend, clock) = harness();
        let mut settings = stepper_settings();
        settings.return_to_home = false;
        let mut stepper = StepperDiverter::from_settings(
            "diverter:glass".into(),
            &settings,
            backend.clone() as Arc<dyn GpioBackend>,
            clock as Arc<dyn Clock>,
        )
        .unwrap();
        stepper.activate(0.0).unwrap();
        assert_eq!(backend.rising_edges(2), 4);
    }

    #[test]
    fn stepper_ramp_is_monotonic_to_min() {
        let (backend, clock) = harness();
        let stepper = StepperDiverter::from_settings(
            "diverter:metal".into(),
            &stepper_settings(),
            backend as Arc<dyn GpioBackend>,
            clock as Arc<dyn Clock>,
        )
        .unwrap();
        // start 20µs, min 5µs over 2 accel steps.
        assert_eq!(stepper.step_delay_us(0), 20);
        assert!(stepper.step_delay_us(1) < 20);
        assert_eq!(stepper.step_delay_us(2), 5);
        assert_eq!(stepper.step_delay_us(100), 5);
    }

    #[test]
    fn disabled_actuator_fails_fast() {
        let (backend, clock) = harness();
        let mut stepper = StepperDiverter::from_settings(
            "diverter:metal".into(),
            &stepper_settings(),
            backend.clone() as Arc<dyn GpioBackend>,
            clock as Arc<dyn Clock>,
        )
        .unwrap();
        stepper.shared().set_enabled(false);
        assert!(matches!(
            stepper.activate(0.0),
            Err(HalError::ActuatorDisabled)
        ));
        assert_eq!(backend.rising_edges(2), 0);
    }

    #[test]
    fn concurrent_activation_fails_fast() {
        let (backend, clock) = harness();
        let mut stepper = StepperDiverter::from_settings(
            "diverter:metal".into(),
            &stepper_settings(),
            backend as Arc<dyn GpioBackend>,
            clock as Arc<dyn Clock>,
        )
        .unwrap();
        // Simulate a stuck in-flight guard from another handle.
        stepper.shared().in_flight.store(true, Ordering::Release);
        assert!(matches!(
            stepper.activate(0.0),
            Err(HalError::ActivationInProgress)
        ));
    }

    #[test]
    fn maintenance_flag_raised_but_still_activates() {
        let (backend, clock) = harness();
        let mut stepper = StepperDiverter::from_settings(
            "diverter:metal".into(),
            &stepper_settings(),
            backend as Arc<dyn GpioBackend>,
            clock as Arc<dyn Clock>,
        )
        .unwrap();
        // max_operations = 2.
        stepper.activate(0.0).unwrap();
        stepper.activate(0.0).unwrap();
        assert!(!stepper.status().maintenance_due);
        stepper.activate(0.0).unwrap();
        let status = stepper.status();
        assert!(status.maintenance_due);
        assert_eq!(status.op_count, 3);
    }

    #[test]
    fn gpio_fault_counts_and_propagates() {
        let (backend, clock) = harness();
        let mut stepper = StepperDiverter::from_settings(
            "diverter:metal".into(),
            &stepper_settings(),
            backend.clone() as Arc<dyn GpioBackend>,
            clock as Arc<dyn Clock>,
        )
        .unwrap();
        backend.fail_pin(2);
        assert!(stepper.activate(0.0).is_err());
        let status = stepper.status();
        assert_eq!(status.op_count, 0);
        assert_eq!(status.fault_count, 1);
        // Guard released: a healed pin activates again.
        backend.heal_pin(2);
        stepper.activate(0.0).unwrap();
        assert_eq!(stepper.status().op_count, 1);
    }

    #[test]
    fn onoff_asserts_then_releases() {
        let (backend, clock) = harness();
        let mut flap = OnOffDiverter::from_settings(
            "diverter:plastic".into(),
            &onoff_settings(),
            backend.clone() as Arc<dyn GpioBackend>,
            clock as Arc<dyn Clock>,
        )
        .unwrap();
        flap.initialize().unwrap();
        flap.activate(0.0).unwrap();
        assert_eq!(
            backend.writes(),
            vec![(5, Level::Low), (5, Level::High), (5, Level::Low)]
        );
        assert_eq!(flap.status().op_count, 1);
    }

    #[test]
    fn onoff_active_low_polarity() {
        let (backend, clock) = harness();
        let mut settings = onoff_settings();
        settings.active_high = false;
        let mut flap = OnOffDiverter::from_settings(
            "diverter:carton".into(),
            &settings,
            backend.clone() as Arc<dyn GpioBackend>,
            clock as Arc<dyn Clock>,
        )
        .unwrap();
        flap.activate(0.0).unwrap();
        assert_eq!(backend.writes(), vec![(5, Level::Low), (5, Level::High)]);
    }

    #[test]
    fn factory_builds_matching_variant() {
        let (backend, clock) = harness();
        let stepper = build_actuator(
            "diverter:metal",
            &stepper_settings(),
            backend.clone() as Arc<dyn GpioBackend>,
            clock.clone() as Arc<dyn Clock>,
        )
        .unwrap();
        assert_eq!(stepper.name(), "diverter:metal");

        let flap = build_actuator(
            "diverter:plastic",
            &onoff_settings(),
            backend as Arc<dyn GpioBackend>,
            clock as Arc<dyn Clock>,
        )
        .unwrap();
        assert_eq!(flap.name(), "diverter:plastic");
    }

    #[test]
    fn factory_rejects_missing_pins() {
        let (backend, clock) = harness();
        let mut settings = stepper_settings();
        settings.dir_pin_bcm = None;
        assert!(build_actuator(
            "diverter:metal",
            &settings,
            backend as Arc<dyn GpioBackend>,
            clock as Arc<dyn Clock>,
        )
        .is_err());
    }
}
