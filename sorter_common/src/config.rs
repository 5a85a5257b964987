//! TOML configuration snapshot with validation and hot-reload scope.
//!
//! The whole configuration is one immutable snapshot handed out by the
//! orchestrator; consumers never mutate it. Validation rejects the first
//! bad field with a descriptive message. A hot reload parses a shadow
//! snapshot, re-validates it with the same rules, checks the reload scope
//! (pins, category set, and diverter types require a restart), and only
//! then swaps atomically; on any failure the active snapshot is untouched.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::item::Category;

// ─── Error Type ─────────────────────────────────────────────────────

/// Configuration loading/validation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("config I/O error: {0}")]
    Io(String),

    /// TOML parse error.
    #[error("config parse error: {0}")]
    Parse(String),

    /// First rejected field and why.
    #[error("invalid config: {field}: {reason}")]
    Invalid { field: String, reason: String },

    /// Two components claim the same BCM pin.
    #[error("pin {pin} claimed by both '{owner}' and '{claimant}'")]
    PinConflict {
        pin: u8,
        owner: String,
        claimant: String,
    },

    /// Hot-reload changed a field that requires a restart.
    #[error("reload scope violation: {0}")]
    ReloadScope(String),
}

// ─── System ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    pub error_recovery_enabled: bool,
    pub max_processing_errors: u32,
    pub auto_restart_on_error: bool,
    pub max_restart_attempts: u32,
    pub restart_delay_s: f64,
    pub data_retention_days: u32,
    /// Fires scheduled within this window of `now` may still complete on pause.
    pub pause_grace_ms: u64,
    /// Tolerance around scheduled fire times to absorb jitter.
    pub fire_grace_ms: u64,
    /// Maintenance auto-timeout back to idle.
    pub maintenance_timeout_s: f64,
    /// Shutdown drain deadline.
    pub max_shutdown_drain_s: f64,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            error_recovery_enabled: true,
            max_processing_errors: 10,
            auto_restart_on_error: true,
            max_restart_attempts: 3,
            restart_delay_s: 5.0,
            data_retention_days: 30,
            pause_grace_ms: 100,
            fire_grace_ms: 50,
            maintenance_timeout_s: 600.0,
            max_shutdown_drain_s: 5.0,
        }
    }
}

// ─── Camera ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub index: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub fps: u32,
    pub warmup_frames: u32,
    pub backup_cameras: Vec<u32>,
    pub auto_recovery: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            index: 0,
            frame_width: 1920,
            frame_height: 1080,
            fps: 30,
            warmup_frames: 5,
            backup_cameras: Vec::new(),
            auto_recovery: true,
        }
    }
}

// ─── AI Model ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiModelSettings {
    pub model_path: String,
    pub backup_model_path: Option<String>,
    /// Results below this confidence take the fallback category.
    pub min_confidence: f64,
    pub fallback_category: Category,
    /// Classifier label aliases → canonical category.
    pub class_mapping: BTreeMap<String, Category>,
    pub max_inference_time_ms: u64,
}

impl Default for AiModelSettings {
    fn default() -> Self {
        Self {
            model_path: "models/sorter.onnx".into(),
            backup_model_path: None,
            min_confidence: 0.5,
            fallback_category: Category::Other,
            class_mapping: BTreeMap::new(),
            max_inference_time_ms: 500,
        }
    }
}

// ─── Conveyor Belt ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConveyorBeltSettings {
    pub belt_speed_mps: f64,
    pub max_speed_mps: f64,
    /// Camera → diverter distance per category [m].
    pub distance_camera_to_diverters_m: BTreeMap<Category, f64>,
    /// Global default pulse length; per-diverter values override.
    pub diverter_activation_duration_s: f64,
    pub pwm_pin_bcm: u8,
    pub pwm_frequency_hz: f64,
    pub min_duty_cycle: f64,
    pub max_duty_cycle: f64,
    pub accel_time_s: f64,
    pub decel_time_s: f64,
    pub emergency_stop_pin_bcm: u8,
}

impl Default for ConveyorBeltSettings {
    fn default() -> Self {
        Self {
            belt_speed_mps: 0.15,
            max_speed_mps: 0.5,
            distance_camera_to_diverters_m: BTreeMap::new(),
            diverter_activation_duration_s: 0.5,
            pwm_pin_bcm: 18,
            pwm_frequency_hz: 1000.0,
            min_duty_cycle: 20.0,
            max_duty_cycle: 100.0,
            accel_time_s: 1.0,
            decel_time_s: 1.0,
            emergency_stop_pin_bcm: 17,
        }
    }
}

// ─── Sensors ────────────────────────────────────────────────────────

/// Edge polarity of the camera-trigger input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Rising,
    Falling,
}

impl Default for TriggerMode {
    fn default() -> Self {
        Self::Rising
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSensorSettings {
    pub pin_bcm: u8,
    pub trigger_mode: TriggerMode,
    pub debounce_time_ms: u64,
    /// Input poll interval for the sensor loop.
    pub poll_interval_ms: u64,
}

impl Default for TriggerSensorSettings {
    fn default() -> Self {
        Self {
            pin_bcm: 22,
            trigger_mode: TriggerMode::Rising,
            debounce_time_ms: 50,
            poll_interval_ms: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinSensorSettings {
    pub trigger_pin_bcm: u8,
    pub echo_pin_bcm: u8,
    /// Echo distance when the bin is empty [m].
    pub empty_distance_m: f64,
    /// Echo distance when the bin is full [m].
    pub full_distance_m: f64,
}

impl Default for BinSensorSettings {
    fn default() -> Self {
        Self {
            trigger_pin_bcm: 0,
            echo_pin_bcm: 0,
            empty_distance_m: 0.50,
            full_distance_m: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinLevelSettings {
    pub update_interval_s: f64,
    pub smoothing_samples: usize,
    pub measurement_timeout_s: f64,
    pub warn_threshold_percent: f64,
    pub full_threshold_percent: f64,
    pub critical_threshold_percent: f64,
    /// Per-category ultrasonic sensors.
    pub bins: BTreeMap<Category, BinSensorSettings>,
}

impl Default for BinLevelSettings {
    fn default() -> Self {
        Self {
            update_interval_s: 2.0,
            smoothing_samples: 5,
            measurement_timeout_s: 0.1,
            warn_threshold_percent: 75.0,
            full_threshold_percent: 90.0,
            critical_threshold_percent: 95.0,
            bins: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorsSettings {
    pub camera_trigger_sensor: TriggerSensorSettings,
    pub bin_level_sensors: BinLevelSettings,
}

// ─── Diverters ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiverterType {
    Stepper,
    OnOff,
}

/// Stepper rotation direction for the activation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDirection {
    Forward,
    Reverse,
}

impl StepDirection {
    pub const fn opposite(&self) -> Self {
        match self {
            Self::Forward => Self::Reverse,
            Self::Reverse => Self::Forward,
        }
    }
}

impl Default for StepDirection {
    fn default() -> Self {
        Self::Forward
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    /// Above this operation count the diverter reports a maintenance fault
    /// but keeps activating (operator policy).
    pub max_operations: u64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            max_operations: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiverterSettings {
    #[serde(rename = "type")]
    pub diverter_type: DiverterType,

    // Stepper pins
    pub step_pin_bcm: Option<u8>,
    pub dir_pin_bcm: Option<u8>,
    pub enable_pin_bcm: Option<u8>,

    // On/off pin
    pub pin_bcm: Option<u8>,
    /// Logic level that asserts an on/off diverter.
    #[serde(default = "default_active_high")]
    pub active_high: bool,

    #[serde(default = "default_steps_per_activation")]
    pub steps_per_activation: u32,
    #[serde(default)]
    pub activation_direction: StepDirection,
    #[serde(default = "default_return_to_home")]
    pub return_to_home: bool,

    /// Linear step ramp: start delay → min delay over the accel steps.
    #[serde(default = "default_ramp_start_delay_us")]
    pub ramp_start_delay_us: u64,
    #[serde(default = "default_ramp_min_delay_us")]
    pub ramp_min_delay_us: u64,
    #[serde(default = "default_ramp_accel_steps")]
    pub ramp_accel_steps: u32,

    /// Per-diverter pulse length; falls back to the belt-level default.
    pub activation_duration_s: Option<f64>,
    /// Actuator startup compensation subtracted from the fire time.
    #[serde(default)]
    pub activation_lead_s: f64,

    #[serde(default)]
    pub maintenance: MaintenanceSettings,
}

fn default_active_high() -> bool {
    true
}
fn default_steps_per_activation() -> u32 {
    200
}
fn default_return_to_home() -> bool {
    true
}
fn default_ramp_start_delay_us() -> u64 {
    2000
}
fn default_ramp_min_delay_us() -> u64 {
    500
}
fn default_ramp_accel_steps() -> u32 {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultToleranceSettings {
    pub max_consecutive_failures: u32,
    pub failure_recovery_delay_s: f64,
    pub auto_disable_on_fault: bool,
}

impl Default for FaultToleranceSettings {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            failure_recovery_delay_s: 5.0,
            auto_disable_on_fault: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiverterGlobalSettings {
    /// When false, overlapping fire windows across diverters serialize.
    pub simultaneous_activations: bool,
    pub timeout_between_activations_ms: u64,
    pub fault_tolerance: FaultToleranceSettings,
}

impl Default for DiverterGlobalSettings {
    fn default() -> Self {
        Self {
            simultaneous_activations: true,
            timeout_between_activations_ms: 200,
            fault_tolerance: FaultToleranceSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiverterControlSettings {
    pub diverters: BTreeMap<Category, DiverterSettings>,
    pub global_settings: DiverterGlobalSettings,
}

// ─── Safety ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationalLimits {
    pub max_continuous_runtime_hours: f64,
    pub max_objects_per_hour: u64,
    pub max_temperature_celsius: f32,
}

impl Default for OperationalLimits {
    fn default() -> Self {
        Self {
            max_continuous_runtime_hours: 16.0,
            max_objects_per_hour: 18_000,
            max_temperature_celsius: 85.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySettings {
    pub emergency_stop_enabled: bool,
    pub estop_sample_interval_ms: u64,
    /// Failed release attempts before the E-stop locks out.
    pub max_failed_attempts: u32,
    pub lockout_duration_minutes: f64,
    pub operational_limits: OperationalLimits,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            emergency_stop_enabled: true,
            estop_sample_interval_ms: 10,
            max_failed_attempts: 3,
            lockout_duration_minutes: 5.0,
            operational_limits: OperationalLimits::default(),
        }
    }
}

// ─── Monitoring ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub cpu_warning_percent: f32,
    pub cpu_critical_percent: f32,
    pub memory_warning_percent: f32,
    pub memory_critical_percent: f32,
    pub temperature_warning_celsius: f32,
    pub temperature_critical_celsius: f32,
    pub processing_time_warning_ms: u64,
    pub error_rate_warning_percent: f64,
    /// Gap below a threshold required before it clears.
    pub hysteresis_margin_percent: f32,
    /// Consecutive clear samples required before a latch releases.
    pub clear_samples: u32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_warning_percent: 85.0,
            cpu_critical_percent: 95.0,
            memory_warning_percent: 85.0,
            memory_critical_percent: 95.0,
            temperature_warning_celsius: 75.0,
            temperature_critical_celsius: 85.0,
            processing_time_warning_ms: 800,
            error_rate_warning_percent: 5.0,
            hysteresis_margin_percent: 5.0,
            clear_samples: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub metrics_interval_s: f64,
    /// Operational-limits sampling interval, independent of the metrics
    /// tick so short excursions still reach the watchdog.
    pub limits_interval_s: f64,
    pub alerts: AlertThresholds,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            metrics_interval_s: 5.0,
            limits_interval_s: 1.0,
            alerts: AlertThresholds::default(),
        }
    }
}

// ─── Snapshot ───────────────────────────────────────────────────────

/// Complete validated configuration snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterConfig {
    pub system_settings: SystemSettings,
    pub camera_settings: CameraSettings,
    pub ai_model_settings: AiModelSettings,
    pub conveyor_belt_settings: ConveyorBeltSettings,
    pub sensors_settings: SensorsSettings,
    pub diverter_control_settings: DiverterControlSettings,
    pub safety_settings: SafetySettings,
    pub monitoring_settings: MonitoringSettings,
}

impl SorterConfig {
    /// Load and validate from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("failed to read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&raw)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse and validate from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: SorterConfig =
            toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// A fully wired five-category simulation snapshot used by tests and
    /// the `--simulate` binary path. Pins are distinct by construction.
    pub fn example() -> Self {
        let mut config = SorterConfig::default();

        let distances = [
            (Category::Metal, 0.60),
            (Category::Plastic, 0.80),
            (Category::Glass, 1.00),
            (Category::Carton, 1.20),
            (Category::Other, 1.40),
        ];
        for (cat, d) in distances {
            config
                .conveyor_belt_settings
                .distance_camera_to_diverters_m
                .insert(cat, d);
        }

        // Steppers for the heavy materials, pneumatic flaps for the rest.
        let mut pin = 2u8;
        let mut next_pin = || {
            let p = pin;
            pin += 1;
            // Skip pins claimed by the belt, E-stop and trigger defaults.
            while [17, 18, 22].contains(&pin) {
                pin += 1;
            }
            p
        };
        for cat in Category::ALL {
            let stepper = matches!(cat, Category::Metal | Category::Glass);
            let settings = if stepper {
                DiverterSettings {
                    diverter_type: DiverterType::Stepper,
                    step_pin_bcm: Some(next_pin()),
                    dir_pin_bcm: Some(next_pin()),
                    enable_pin_bcm: Some(next_pin()),
                    pin_bcm: None,
                    active_high: true,
                    steps_per_activation: 200,
                    activation_direction: StepDirection::Forward,
                    return_to_home: true,
                    ramp_start_delay_us: 2000,
                    ramp_min_delay_us: 500,
                    ramp_accel_steps: 50,
                    activation_duration_s: Some(0.5),
                    activation_lead_s: 0.0,
                    maintenance: MaintenanceSettings::default(),
                }
            } else {
                DiverterSettings {
                    diverter_type: DiverterType::OnOff,
                    step_pin_bcm: None,
                    dir_pin_bcm: None,
                    enable_pin_bcm: None,
                    pin_bcm: Some(next_pin()),
                    active_high: true,
                    steps_per_activation: 0,
                    activation_direction: StepDirection::Forward,
                    return_to_home: false,
                    ramp_start_delay_us: 0,
                    ramp_min_delay_us: 0,
                    ramp_accel_steps: 0,
                    activation_duration_s: Some(0.5),
                    activation_lead_s: 0.0,
                    maintenance: MaintenanceSettings::default(),
                }
            };
            config
                .diverter_control_settings
                .diverters
                .insert(cat, settings);

            config.sensors_settings.bin_level_sensors.bins.insert(
                cat,
                BinSensorSettings {
                    trigger_pin_bcm: next_pin(),
                    echo_pin_bcm: next_pin(),
                    ..BinSensorSettings::default()
                },
            );
        }

        config
    }

    /// Validate the snapshot. Returns the first rejected field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let belt = &self.conveyor_belt_settings;
        if belt.belt_speed_mps <= 0.0 {
            return Err(invalid(
                "conveyor_belt_settings.belt_speed_mps",
                "must be positive",
            ));
        }
        if belt.max_speed_mps < belt.belt_speed_mps {
            return Err(invalid(
                "conveyor_belt_settings.max_speed_mps",
                "must be at least belt_speed_mps",
            ));
        }
        if belt.min_duty_cycle < 0.0
            || belt.max_duty_cycle > 100.0
            || belt.min_duty_cycle >= belt.max_duty_cycle
        {
            return Err(invalid(
                "conveyor_belt_settings.min_duty_cycle",
                "duty cycle range must satisfy 0 <= min < max <= 100",
            ));
        }
        if belt.pwm_frequency_hz <= 0.0 {
            return Err(invalid(
                "conveyor_belt_settings.pwm_frequency_hz",
                "must be positive",
            ));
        }
        if belt.diverter_activation_duration_s <= 0.0 {
            return Err(invalid(
                "conveyor_belt_settings.diverter_activation_duration_s",
                "must be positive",
            ));
        }

        for (cat, settings) in &self.diverter_control_settings.diverters {
            let field = |name: &str| format!("diverter_control_settings.diverters.{cat}.{name}");
            match settings.diverter_type {
                DiverterType::Stepper => {
                    if settings.step_pin_bcm.is_none()
                        || settings.dir_pin_bcm.is_none()
                        || settings.enable_pin_bcm.is_none()
                    {
                        return Err(ConfigError::Invalid {
                            field: field("step_pin_bcm"),
                            reason: "stepper diverters need step, dir and enable pins".into(),
                        });
                    }
                    if settings.steps_per_activation == 0 {
                        return Err(ConfigError::Invalid {
                            field: field("steps_per_activation"),
                            reason: "must be positive for stepper diverters".into(),
                        });
                    }
                    if settings.ramp_accel_steps > 0
                        && settings.ramp_min_delay_us > settings.ramp_start_delay_us
                    {
                        return Err(ConfigError::Invalid {
                            field: field("ramp_min_delay_us"),
                            reason: "ramp must not exceed the start delay".into(),
                        });
                    }
                }
                DiverterType::OnOff => {
                    if settings.pin_bcm.is_none() {
                        return Err(ConfigError::Invalid {
                            field: field("pin_bcm"),
                            reason: "on_off diverters need a pin".into(),
                        });
                    }
                }
            }
            if let Some(duration) = settings.activation_duration_s {
                if duration <= 0.0 {
                    return Err(ConfigError::Invalid {
                        field: field("activation_duration_s"),
                        reason: "must be positive".into(),
                    });
                }
            }
            if settings.activation_lead_s < 0.0 {
                return Err(ConfigError::Invalid {
                    field: field("activation_lead_s"),
                    reason: "must not be negative".into(),
                });
            }
            // Every diverter needs a camera → diverter distance.
            match belt.distance_camera_to_diverters_m.get(cat) {
                Some(d) if *d > 0.0 => {}
                Some(_) => {
                    return Err(ConfigError::Invalid {
                        field: format!(
                            "conveyor_belt_settings.distance_camera_to_diverters_m.{cat}"
                        ),
                        reason: "must be positive".into(),
                    });
                }
                None => {
                    return Err(ConfigError::Invalid {
                        field: format!(
                            "conveyor_belt_settings.distance_camera_to_diverters_m.{cat}"
                        ),
                        reason: "missing distance for configured diverter".into(),
                    });
                }
            }
        }

        let ai = &self.ai_model_settings;
        if !(0.0..=1.0).contains(&ai.min_confidence) {
            return Err(invalid(
                "ai_model_settings.min_confidence",
                "must be within 0..=1",
            ));
        }
        if ai.max_inference_time_ms == 0 {
            return Err(invalid(
                "ai_model_settings.max_inference_time_ms",
                "must be positive",
            ));
        }

        let bins = &self.sensors_settings.bin_level_sensors;
        if bins.smoothing_samples == 0 {
            return Err(invalid(
                "sensors_settings.bin_level_sensors.smoothing_samples",
                "must be at least 1",
            ));
        }
        if bins.update_interval_s <= 0.0 {
            return Err(invalid(
                "sensors_settings.bin_level_sensors.update_interval_s",
                "must be positive",
            ));
        }
        if !(bins.warn_threshold_percent < bins.full_threshold_percent
            && bins.full_threshold_percent <= bins.critical_threshold_percent
            && bins.critical_threshold_percent <= 100.0)
        {
            return Err(invalid(
                "sensors_settings.bin_level_sensors.full_threshold_percent",
                "thresholds must satisfy warn < full <= critical <= 100",
            ));
        }
        for (cat, sensor) in &bins.bins {
            if sensor.empty_distance_m <= sensor.full_distance_m {
                return Err(ConfigError::Invalid {
                    field: format!("sensors_settings.bin_level_sensors.bins.{cat}.empty_distance_m"),
                    reason: "empty distance must exceed full distance".into(),
                });
            }
        }

        if self.monitoring_settings.metrics_interval_s <= 0.0 {
            return Err(invalid(
                "monitoring_settings.metrics_interval_s",
                "must be positive",
            ));
        }
        if self.monitoring_settings.limits_interval_s <= 0.0 {
            return Err(invalid(
                "monitoring_settings.limits_interval_s",
                "must be positive",
            ));
        }

        self.check_pin_claims()?;
        Ok(())
    }

    /// Collect every (pin, owner) claim this snapshot makes. Shared with
    /// the HAL pin registry at init so startup and validation agree.
    pub fn pin_claims(&self) -> Vec<(u8, String)> {
        let mut claims: Vec<(u8, String)> = Vec::new();
        let belt = &self.conveyor_belt_settings;
        claims.push((belt.pwm_pin_bcm, "belt.pwm".into()));
        if self.safety_settings.emergency_stop_enabled {
            claims.push((belt.emergency_stop_pin_bcm, "safety.e_stop".into()));
        }
        claims.push((
            self.sensors_settings.camera_trigger_sensor.pin_bcm,
            "sensors.camera_trigger".into(),
        ));
        for (cat, sensor) in &self.sensors_settings.bin_level_sensors.bins {
            claims.push((sensor.trigger_pin_bcm, format!("bin:{cat}.trigger")));
            claims.push((sensor.echo_pin_bcm, format!("bin:{cat}.echo")));
        }
        for (cat, diverter) in &self.diverter_control_settings.diverters {
            let mut push = |pin: Option<u8>, name: &str| {
                if let Some(p) = pin {
                    claims.push((p, format!("diverter:{cat}.{name}")));
                }
            };
            push(diverter.step_pin_bcm, "step");
            push(diverter.dir_pin_bcm, "dir");
            push(diverter.enable_pin_bcm, "enable");
            push(diverter.pin_bcm, "pin");
        }
        claims
    }

    fn check_pin_claims(&self) -> Result<(), ConfigError> {
        let mut seen: BTreeMap<u8, String> = BTreeMap::new();
        for (pin, claimant) in self.pin_claims() {
            if let Some(owner) = seen.get(&pin) {
                return Err(ConfigError::PinConflict {
                    pin,
                    owner: owner.clone(),
                    claimant,
                });
            }
            seen.insert(pin, claimant);
        }
        Ok(())
    }

    /// Effective activation duration for a category's diverter.
    pub fn activation_duration_s(&self, category: Category) -> f64 {
        self.diverter_control_settings
            .diverters
            .get(&category)
            .and_then(|d| d.activation_duration_s)
            .unwrap_or(self.conveyor_belt_settings.diverter_activation_duration_s)
    }
}

// ─── Hot-Reload Scope ───────────────────────────────────────────────

/// Check that a shadow snapshot only changes reloadable fields.
///
/// **Reloadable**: belt speed, distances, durations, thresholds,
/// confidence gate, intervals, limits.
///
/// **NOT reloadable** (restart required): any pin assignment, the set of
/// configured diverters/bins, and diverter types.
pub fn validate_reload_scope(
    active: &SorterConfig,
    shadow: &SorterConfig,
) -> Result<(), ConfigError> {
    let active_cats: Vec<_> = active
        .diverter_control_settings
        .diverters
        .keys()
        .collect();
    let shadow_cats: Vec<_> = shadow
        .diverter_control_settings
        .diverters
        .keys()
        .collect();
    if active_cats != shadow_cats {
        return Err(ConfigError::ReloadScope(format!(
            "diverter category set changed: {active_cats:?} → {shadow_cats:?} (requires restart)"
        )));
    }

    for (cat, a) in &active.diverter_control_settings.diverters {
        let s = &shadow.diverter_control_settings.diverters[cat];
        if a.diverter_type != s.diverter_type {
            return Err(ConfigError::ReloadScope(format!(
                "diverter {cat} type changed (requires restart)"
            )));
        }
    }

    let mut active_pins = active.pin_claims();
    let mut shadow_pins = shadow.pin_claims();
    active_pins.sort();
    shadow_pins.sort();
    if active_pins != shadow_pins {
        return Err(ConfigError::ReloadScope(
            "pin assignments changed (requires restart)".into(),
        ));
    }

    Ok(())
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}
