//! Orchestrator: component wiring, lifecycle, and the control surface.
//!
//! Instantiates components leaf-first from a validated configuration
//! snapshot, runs the trigger → classify → schedule → fire pipeline, and
//! exposes the control operations the external API layer calls. The
//! pipeline advances through `step`, which drains safety intents before
//! anything else, so forced transitions always win.
//!
//! Classification and dispatch each run in one of two modes: dedicated
//! worker threads fed by bounded channels (production; the control loop
//! never blocks on inference or GPIO, so due fires dispatch on time), or
//! inline on the control loop (tests and `--simulate`, deterministic
//! under a virtual clock). A shared halt flag plus a fire-command
//! generation tag make cancelled work a no-op in both modes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use sorter_common::clock::{millis_to_ns, secs_to_ns, Clock, NANOS_PER_SEC};
use sorter_common::config::{validate_reload_scope, AiModelSettings, ConfigError, SorterConfig};
use sorter_common::event::{BinState, MetricsSnapshot, TelemetryEvent, Topic};
use sorter_common::fault::{Fault, FaultKind, FaultReport, Severity};
use sorter_common::item::{Category, Classification, DropReason, Item, ItemId, ItemOutcome};
use sorter_common::state::SystemState;

use sorter_hal::actuator::{build_actuator, Actuator, ActuatorShared, ActuatorStatus};
use sorter_hal::belt::{BeltController, BeltState};
use sorter_hal::edge::EdgeDetector;
use sorter_hal::gpio::GpioBackend;
use sorter_hal::pins::PinRegistry;
use sorter_hal::ultrasonic::UltrasonicSensor;
use sorter_hal::HalError;

use crate::bins::BinMonitor;
use crate::classifier::{Classifier, ClassifierClient, ClassifyError, ModelSlot};
use crate::machine::{ForcedTransition, GuardContext, SorterStateMachine, TransitionError};
use crate::metrics::{wall_ts_ms, MetricsCollector, SystemSample};
use crate::recovery::{FailoverTarget, RecoveryAction, RecoveryPolicy, RecoverySupervisor};
use crate::safety::estop::ReleaseError;
use crate::safety::limits::{LimitAction, LimitsWatchdog, SystemSampler};
use crate::safety::EStopMonitor;
use crate::scheduler::{DispatchScheduler, DueAction, FireCommand, ScheduleInputs, ScheduleRequest};
use crate::telemetry::{DropPolicy, Subscription, TelemetryBus};

/// Control-surface error.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("invalid config: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error(transparent)]
    Hal(#[from] HalError),

    #[error(transparent)]
    EStopRelease(#[from] ReleaseError),
}

/// Where classification and diverter pulses execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Dedicated worker threads: one for the classifier, one per
    /// diverter. The control loop never blocks on inference or GPIO.
    Workers,
    /// Both stages run on the control loop. Deterministic under a
    /// virtual clock; used by tests and simulation runs.
    Inline,
}

/// Point-in-time system status for the API layer.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub state: SystemState,
    pub state_reason: String,
    pub belt_state: BeltState,
    pub belt_speed_mps: f64,
    pub estop_asserted: bool,
    pub items_in_flight: usize,
    pub bins: Vec<(Category, BinState, f64)>,
    pub diverters: Vec<(Category, ActuatorStatus)>,
    pub faults: Vec<Fault>,
    pub last_metrics: Option<MetricsSnapshot>,
}

/// Outcome of one diverter pulse, reported back to the control loop.
#[derive(Debug)]
struct ActuationResult {
    command: FireCommand,
    op_count: u64,
    maintenance_due: bool,
    outcome: Result<(), HalError>,
    /// Cancelled by generation/halt before it ran.
    skipped: bool,
}

struct DiverterWorker {
    category: Category,
    tx: Option<SyncSender<FireCommand>>,
    join: Option<JoinHandle<()>>,
}

enum Dispatcher {
    Workers(Vec<DiverterWorker>),
    Inline(Vec<(Category, Box<dyn Actuator>)>),
}

/// Work handed to the classification worker.
enum ClassifyCommand {
    Frame {
        item_id: ItemId,
        trigger_ts_ns: u64,
        frame_ref: u64,
        deadline_ns: u64,
    },
    Reload(ModelSlot),
    UpdateSettings(Box<AiModelSettings>),
}

/// What comes back from the classification worker.
enum ClassifyEvent {
    Classified {
        item_id: ItemId,
        trigger_ts_ns: u64,
        started_ns: u64,
        classify_ts_ns: u64,
        result: Result<Classification, ClassifyError>,
    },
    ReloadFailed {
        slot: ModelSlot,
        error: ClassifyError,
    },
}

/// Classification stage: a dedicated worker in production so inference
/// latency can never delay due fires, inline for deterministic tests.
enum ClassifyStage {
    Worker {
        jobs_tx: Option<SyncSender<ClassifyCommand>>,
        events_rx: Receiver<ClassifyEvent>,
        join: Option<JoinHandle<()>>,
    },
    Inline(ClassifierClient),
}

pub struct Orchestrator {
    config: Arc<SorterConfig>,
    clock: Arc<dyn Clock>,
    backend: Arc<dyn GpioBackend>,
    bus: Arc<TelemetryBus>,

    machine: SorterStateMachine,
    scheduler: DispatchScheduler,
    belt: BeltController,
    bins: BinMonitor,
    bin_sensors: Vec<(Category, UltrasonicSensor)>,
    degraded_sensors: HashSet<String>,
    recovery: RecoverySupervisor,
    limits: LimitsWatchdog,
    estop: EStopMonitor,
    metrics: MetricsCollector,
    sampler: Box<dyn SystemSampler>,
    classify: ClassifyStage,

    trigger_detector: EdgeDetector,
    trigger_pin: u8,
    estop_pin: u8,

    dispatcher: Dispatcher,
    diverter_shared: Vec<(Category, Arc<ActuatorShared>)>,
    results_tx: SyncSender<ActuationResult>,
    results_rx: Receiver<ActuationResult>,
    intents_tx: SyncSender<ForcedTransition>,
    intents_rx: Receiver<ForcedTransition>,

    /// Reflex stop: set before the intent is drained so no pulse starts.
    halt: Arc<AtomicBool>,
    /// Live fire-command generation; stale commands are no-ops.
    live_generation: Arc<AtomicU64>,

    items: HashMap<ItemId, Item>,
    pending_triggers: VecDeque<ItemId>,
    next_item_id: ItemId,

    /// State to return to after a successful recovery.
    recovering_return: Option<SystemState>,
    /// Watchdog limit that forced the current pause, if any.
    pause_cause: Option<&'static str>,
    /// Consecutive classifier errors with no success in between.
    consecutive_processing_errors: u32,
    /// Error-rate alert latch, cleared once the rate falls back.
    error_rate_alerted: bool,
    run_started_ns: Option<u64>,
    last_metrics_ns: u64,
    last_limits_ns: u64,
    last_bin_poll_ns: u64,
    last_sample: SystemSample,
    last_snapshot: Option<MetricsSnapshot>,
    estop_thread: Option<JoinHandle<()>>,
    shutdown_flag: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Wire everything up, leaf-first. Claims every configured pin and
    /// refuses duplicates before any output is driven.
    pub fn build(
        config: SorterConfig,
        backend: Arc<dyn GpioBackend>,
        classifier_backend: Box<dyn Classifier>,
        clock: Arc<dyn Clock>,
        mode: DispatchMode,
        sampler: Box<dyn SystemSampler>,
    ) -> Result<Self, ControlError> {
        config.validate()?;

        let mut registry = PinRegistry::new();
        registry.claim_all(config.pin_claims())?;

        let bus = Arc::new(TelemetryBus::new());
        let belt = BeltController::from_settings(&config.conveyor_belt_settings, backend.clone());
        let bins = BinMonitor::from_settings(&config.sensors_settings.bin_level_sensors);
        let bin_settings = &config.sensors_settings.bin_level_sensors;
        let bin_sensors = bin_settings
            .bins
            .iter()
            .map(|(cat, settings)| {
                (
                    *cat,
                    UltrasonicSensor::from_settings(
                        settings,
                        bin_settings.measurement_timeout_s,
                        bin_settings.smoothing_samples,
                    ),
                )
            })
            .collect();

        let halt = Arc::new(AtomicBool::new(false));
        let live_generation = Arc::new(AtomicU64::new(1));
        let (results_tx, results_rx) = sync_channel(256);
        let (intents_tx, intents_rx) = sync_channel(16);

        // Actuators, then the dispatcher that owns them.
        let mut actuators: Vec<(Category, Box<dyn Actuator>)> = Vec::new();
        let mut diverter_shared = Vec::new();
        for (cat, settings) in &config.diverter_control_settings.diverters {
            let mut actuator = build_actuator(
                format!("diverter:{cat}"),
                settings,
                backend.clone(),
                clock.clone(),
            )?;
            actuator.initialize()?;
            diverter_shared.push((*cat, actuator.shared()));
            actuators.push((*cat, actuator));
        }
        let dispatcher = match mode {
            DispatchMode::Inline => Dispatcher::Inline(actuators),
            DispatchMode::Workers => Dispatcher::Workers(
                actuators
                    .into_iter()
                    .map(|(cat, actuator)| {
                        spawn_diverter_worker(
                            cat,
                            actuator,
                            results_tx.clone(),
                            halt.clone(),
                            live_generation.clone(),
                        )
                    })
                    .collect(),
            ),
        };

        let trigger = &config.sensors_settings.camera_trigger_sensor;
        let trigger_detector = EdgeDetector::new(
            trigger.trigger_mode,
            millis_to_ns(trigger.debounce_time_ms),
        );

        let classifier = ClassifierClient::new(classifier_backend, &config.ai_model_settings);
        let classify = match mode {
            DispatchMode::Inline => ClassifyStage::Inline(classifier),
            DispatchMode::Workers => spawn_classify_worker(classifier, clock.clone()),
        };

        let orchestrator = Self {
            machine: SorterStateMachine::new(secs_to_ns(
                config.system_settings.maintenance_timeout_s,
            )),
            scheduler: DispatchScheduler::from_config(&config),
            belt,
            bins,
            bin_sensors,
            degraded_sensors: HashSet::new(),
            recovery: RecoverySupervisor::new(RecoveryPolicy::from_config(&config)),
            limits: LimitsWatchdog::new(
                config.monitoring_settings.alerts.clone(),
                config.safety_settings.operational_limits.clone(),
            ),
            estop: EStopMonitor::from_settings(&config.safety_settings),
            metrics: MetricsCollector::new(),
            sampler,
            classify,
            trigger_detector,
            trigger_pin: trigger.pin_bcm,
            estop_pin: config.conveyor_belt_settings.emergency_stop_pin_bcm,
            dispatcher,
            diverter_shared,
            results_tx,
            results_rx,
            intents_tx,
            intents_rx,
            halt,
            live_generation,
            items: HashMap::new(),
            pending_triggers: VecDeque::new(),
            next_item_id: 1,
            recovering_return: None,
            pause_cause: None,
            consecutive_processing_errors: 0,
            error_rate_alerted: false,
            run_started_ns: None,
            last_metrics_ns: 0,
            last_limits_ns: 0,
            last_bin_poll_ns: 0,
            last_sample: SystemSample::default(),
            last_snapshot: None,
            estop_thread: None,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            config: Arc::new(config),
            clock,
            backend,
            bus,
        };
        Ok(orchestrator)
    }

    /// Finish initialization: initializing → idle.
    pub fn initialize(&mut self) -> Result<SystemState, ControlError> {
        let now = self.clock.now_ns();
        let change = self
            .machine
            .request(SystemState::Idle, "initialization complete", &self.guards(), now)?;
        self.publish_state_change(change);
        Ok(self.machine.state())
    }

    // ─── Control Surface ────────────────────────────────────────────

    /// idle → running. Ramps the belt up first; fails when unhealthy or
    /// E-stop is asserted.
    pub fn start(&mut self) -> Result<SystemState, ControlError> {
        let now = self.clock.now_ns();
        if self.estop.is_asserted() {
            return Err(TransitionError::GuardFailed("E-stop asserted").into());
        }
        if self.machine.state() != SystemState::Idle {
            return Err(TransitionError::Illegal {
                from: self.machine.state(),
                to: SystemState::Running,
            }
            .into());
        }
        self.belt
            .start(self.config.conveyor_belt_settings.belt_speed_mps, now)?;
        self.ramp_belt_to_completion()?;
        let now = self.clock.now_ns();
        let change = self
            .machine
            .request(SystemState::Running, "operator start", &self.guards(), now)?;
        self.run_started_ns = Some(now);
        self.publish_state_change(change);
        Ok(self.machine.state())
    }

    /// any → shutting_down → shutdown, draining the pipeline under the
    /// configured deadline.
    pub fn stop(&mut self) -> Result<SystemState, ControlError> {
        let now = self.clock.now_ns();
        if self.machine.state() == SystemState::Shutdown {
            return Ok(SystemState::Shutdown);
        }
        let change = match self.machine.request(
            SystemState::ShuttingDown,
            "operator stop",
            &self.guards(),
            now,
        ) {
            Ok(change) => Some(change),
            // Forced path for states without a direct edge.
            Err(_) => self.machine.force(SystemState::ShuttingDown, "operator stop", now),
        };
        if let Some(change) = change {
            self.publish_state_change(change);
        }
        self.belt.stop(true, now)?;
        self.drain_pipeline();

        let now = self.clock.now_ns();
        self.belt.tick(now)?;
        if let Ok(change) =
            self.machine
                .request(SystemState::Shutdown, "drain complete", &self.guards(), now)
        {
            self.publish_state_change(change);
        }
        self.teardown_workers();
        Ok(self.machine.state())
    }

    /// running → paused. Imminent fires may complete; the rest cancel.
    pub fn pause(&mut self) -> Result<SystemState, ControlError> {
        let now = self.clock.now_ns();
        let change =
            self.machine
                .request(SystemState::Paused, "operator pause", &self.guards(), now)?;
        self.publish_state_change(change);
        self.cancel_beyond_grace(now);
        self.belt.pause(now)?;
        Ok(self.machine.state())
    }

    /// paused → running.
    pub fn resume(&mut self) -> Result<SystemState, ControlError> {
        let now = self.clock.now_ns();
        if self.machine.state() != SystemState::Paused {
            return Err(TransitionError::Illegal {
                from: self.machine.state(),
                to: SystemState::Running,
            }
            .into());
        }
        self.belt.resume(now)?;
        self.ramp_belt_to_completion()?;
        let now = self.clock.now_ns();
        let change =
            self.machine
                .request(SystemState::Running, "operator resume", &self.guards(), now)?;
        self.pause_cause = None;
        self.publish_state_change(change);
        Ok(self.machine.state())
    }

    /// Operator-commanded emergency stop: identical sequence to the
    /// hardware input, reason aside.
    pub fn emergency_stop(&mut self) -> Result<SystemState, ControlError> {
        self.estop.force_asserted();
        self.execute_emergency("operator emergency stop");
        Ok(self.machine.state())
    }

    /// Release the E-stop latch (input must be clear) and reset the
    /// recovery budget. error → recovering → idle.
    pub fn release_estop(&mut self) -> Result<SystemState, ControlError> {
        let now = self.clock.now_ns();
        let input_active = self
            .backend
            .read(self.estop_pin)
            .map(|level| level.is_high())
            .unwrap_or(true);
        self.estop.release(input_active, now)?;
        self.recovery.reset();
        self.belt.clear_emergency();
        for (_, shared) in &self.diverter_shared {
            shared.set_enabled(true);
        }
        for cat in Category::ALL {
            if self.config.diverter_control_settings.diverters.contains_key(&cat) {
                self.scheduler.set_diverter_enabled(cat, true);
            }
        }
        self.halt.store(false, Ordering::Release);
        if self.machine.state() == SystemState::Error {
            if let Some(change) = self.machine.force(SystemState::Recovering, "E-stop released", now)
            {
                self.publish_state_change(change);
            }
            if let Some(change) = self.machine.force(SystemState::Idle, "operator reset", now) {
                self.publish_state_change(change);
            }
        }
        Ok(self.machine.state())
    }

    /// idle|paused → maintenance (auto-times-out back to idle).
    pub fn enter_maintenance(&mut self) -> Result<SystemState, ControlError> {
        let now = self.clock.now_ns();
        let change = self.machine.request(
            SystemState::Maintenance,
            "operator maintenance",
            &self.guards(),
            now,
        )?;
        self.publish_state_change(change);
        Ok(self.machine.state())
    }

    /// maintenance → idle.
    pub fn exit_maintenance(&mut self) -> Result<SystemState, ControlError> {
        let now = self.clock.now_ns();
        let change =
            self.machine
                .request(SystemState::Idle, "maintenance complete", &self.guards(), now)?;
        self.publish_state_change(change);
        Ok(self.machine.state())
    }

    /// Validate and atomically swap the configuration snapshot. On any
    /// failure the active snapshot is untouched. Reloading the current
    /// snapshot is observably a no-op.
    pub fn reload_config(&mut self, shadow: SorterConfig) -> Result<(), ControlError> {
        if *self.config == shadow {
            return Ok(());
        }
        shadow.validate().map_err(|e| {
            self.report_config_rejected(&e);
            e
        })?;
        validate_reload_scope(&self.config, &shadow).map_err(|e| {
            self.report_config_rejected(&e);
            e
        })?;

        self.config = Arc::new(shadow);
        self.scheduler.update_params(&self.config);
        self.bins
            .update_settings(&self.config.sensors_settings.bin_level_sensors);
        self.limits.update_settings(
            self.config.monitoring_settings.alerts.clone(),
            self.config.safety_settings.operational_limits.clone(),
        );
        match &mut self.classify {
            ClassifyStage::Inline(client) => {
                client.update_settings(&self.config.ai_model_settings);
            }
            ClassifyStage::Worker {
                jobs_tx: Some(tx), ..
            } => {
                let _ = tx.try_send(ClassifyCommand::UpdateSettings(Box::new(
                    self.config.ai_model_settings.clone(),
                )));
            }
            ClassifyStage::Worker { jobs_tx: None, .. } => {}
        }
        self.recovery
            .update_policy(RecoveryPolicy::from_config(&self.config));
        info!("configuration snapshot reloaded");
        Ok(())
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            state: self.machine.state(),
            state_reason: self.machine.last_reason().to_string(),
            belt_state: self.belt.state(),
            belt_speed_mps: self.belt.nominal_speed_mps(),
            estop_asserted: self.estop.is_asserted(),
            items_in_flight: self.items.len(),
            bins: Category::ALL
                .iter()
                .map(|cat| (*cat, self.bins.state(*cat), self.bins.fill_fraction(*cat)))
                .collect(),
            diverters: self
                .diverter_shared
                .iter()
                .map(|(cat, shared)| (*cat, shared.status()))
                .collect(),
            faults: self.recovery.faults(),
            last_metrics: self.last_snapshot,
        }
    }

    pub fn subscribe(&self, topics: &[Topic], capacity: usize, policy: DropPolicy) -> Subscription {
        self.bus.subscribe(topics, capacity, policy)
    }

    pub fn metrics_window(&self, n: usize) -> Vec<MetricsSnapshot> {
        self.metrics.window(n)
    }

    #[inline]
    pub fn state(&self) -> SystemState {
        self.machine.state()
    }

    /// Current configuration snapshot (immutable; consumers never mutate).
    pub fn config(&self) -> Arc<SorterConfig> {
        Arc::clone(&self.config)
    }

    // ─── Pipeline Step ──────────────────────────────────────────────

    /// One control-loop iteration. Order matters: safety intents first,
    /// then inputs, classification hand-off, dispatch, results,
    /// housekeeping. Due fires dispatch before anything else can stall
    /// the tick.
    pub fn step(&mut self) {
        let now = self.clock.now_ns();
        self.drain_intents(now);
        self.poll_estop();
        self.poll_trigger();
        self.submit_classification();
        self.drain_classify_events();
        self.poll_bins();
        self.dispatch_due();
        self.drain_results();
        if let Some(change) = self.machine.tick(self.clock.now_ns()) {
            self.publish_state_change(change);
        }
        if let Err(e) = self.belt.tick(self.clock.now_ns()) {
            self.report_fault(
                FaultReport::new(
                    FaultKind::BeltFailure,
                    "belt",
                    Severity::Error,
                    self.clock.now_ns(),
                    e.to_string(),
                ),
            );
        }
        self.evaluate_limits(self.clock.now_ns());
        self.metrics_tick(now);
    }

    /// Blocking control loop for production runs. Paces itself on the
    /// earliest of: next scheduled fire, metrics tick, input poll.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<(), ControlError> {
        self.shutdown_flag = Arc::clone(&shutdown);
        self.spawn_estop_reflex();
        info!("control loop entered");
        while !shutdown.load(Ordering::Relaxed) {
            self.step();
            let now = self.clock.now_ns();
            let poll_ns = millis_to_ns(
                self.config
                    .sensors_settings
                    .camera_trigger_sensor
                    .poll_interval_ms
                    .max(1),
            );
            let wake = self
                .scheduler
                .next_due_ns()
                .unwrap_or(now + poll_ns)
                .min(now + poll_ns);
            self.clock.sleep_until(wake);
        }
        info!("shutdown requested");
        self.stop()?;
        Ok(())
    }

    // ─── Inputs ─────────────────────────────────────────────────────

    fn poll_trigger(&mut self) {
        let state = self.machine.state();
        // Items are taken while running, and also while recovering: a
        // successful classification is what confirms the recovery.
        if !(state.accepts_new_items() || state == SystemState::Recovering) {
            // Keep the detector level-current so a later edge is real.
            if let Ok(level) = self.backend.read(self.trigger_pin) {
                self.trigger_detector.sample(level, self.clock.now_ns());
            }
            return;
        }
        let level = match self.backend.read(self.trigger_pin) {
            Ok(level) => level,
            Err(e) => {
                self.report_fault(FaultReport::new(
                    FaultKind::SensorFailure,
                    "sensors.camera_trigger",
                    Severity::Error,
                    self.clock.now_ns(),
                    e.to_string(),
                ));
                return;
            }
        };
        if let Some(edge) = self.trigger_detector.sample(level, self.clock.now_ns()) {
            self.on_trigger(edge.ts_ns);
        }
    }

    /// Register a detected item. The frame reference is opaque; the
    /// camera driver owns capture.
    pub fn on_trigger(&mut self, trigger_ts_ns: u64) -> ItemId {
        let id = self.next_item_id;
        self.next_item_id += 1;
        self.items.insert(id, Item::triggered(id, trigger_ts_ns, id));
        self.pending_triggers.push_back(id);
        debug!(item = id, trigger_ts_ns, "item triggered");
        id
    }

    fn poll_estop(&mut self) {
        let active = self
            .backend
            .read(self.estop_pin)
            .map(|level| level.is_high())
            .unwrap_or(false);
        if self.estop.sample(active) {
            self.halt.store(true, Ordering::Release);
            self.execute_emergency("E_STOP");
        }
    }

    // ─── Classification & Scheduling ────────────────────────────────

    /// Hand queued triggers to the classification stage. Inline mode
    /// classifies on the spot; worker mode enqueues and returns
    /// immediately, so dispatch timing never waits on inference.
    fn submit_classification(&mut self) {
        while let Some(item_id) = self.pending_triggers.pop_front() {
            let Some(item) = self.items.get(&item_id) else {
                continue;
            };
            let trigger_ts_ns = item.trigger_ts_ns;
            let frame_ref = item.image_ref;
            let started_ns = self.clock.now_ns();
            let deadline_ns =
                started_ns + millis_to_ns(self.config.ai_model_settings.max_inference_time_ms);

            let inline_result = match &mut self.classify {
                ClassifyStage::Inline(client) => Some(client.classify(frame_ref, deadline_ns)),
                ClassifyStage::Worker {
                    jobs_tx: Some(tx), ..
                } => {
                    let job = ClassifyCommand::Frame {
                        item_id,
                        trigger_ts_ns,
                        frame_ref,
                        deadline_ns,
                    };
                    if tx.try_send(job).is_err() {
                        // Worker backlog: keep the trigger queued and
                        // retry next tick.
                        self.pending_triggers.push_front(item_id);
                        break;
                    }
                    None
                }
                ClassifyStage::Worker { jobs_tx: None, .. } => None,
            };
            if let Some(result) = inline_result {
                let classify_ts_ns = self.clock.now_ns();
                self.handle_classification(item_id, trigger_ts_ns, started_ns, classify_ts_ns, result);
            }
        }
    }

    /// Drain classification outcomes from the worker (no-op inline).
    fn drain_classify_events(&mut self) {
        loop {
            let event = match &self.classify {
                ClassifyStage::Worker { events_rx, .. } => match events_rx.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
                ClassifyStage::Inline(_) => break,
            };
            match event {
                ClassifyEvent::Classified {
                    item_id,
                    trigger_ts_ns,
                    started_ns,
                    classify_ts_ns,
                    result,
                } => {
                    self.handle_classification(
                        item_id,
                        trigger_ts_ns,
                        started_ns,
                        classify_ts_ns,
                        result,
                    );
                }
                ClassifyEvent::ReloadFailed { slot, error } => {
                    let now = self.clock.now_ns();
                    self.report_fault(FaultReport::new(
                        FaultKind::AiModelFailure,
                        "classifier",
                        Severity::Critical,
                        now,
                        format!("{slot:?} model failed to load: {error}"),
                    ));
                }
            }
        }
    }

    /// One classification outcome: schedule the item or drop it.
    fn handle_classification(
        &mut self,
        item_id: ItemId,
        trigger_ts_ns: u64,
        started_ns: u64,
        classify_ts_ns: u64,
        result: Result<Classification, ClassifyError>,
    ) {
        // The item may have been cancelled while inference ran.
        let item_live = self.items.contains_key(&item_id);
        match result {
            Ok(classification) => {
                self.consecutive_processing_errors = 0;
                let processing_ms = classify_ts_ns.saturating_sub(started_ns) / 1_000_000;
                if processing_ms > self.config.monitoring_settings.alerts.processing_time_warning_ms
                {
                    self.bus.publish(TelemetryEvent::Alert {
                        severity: Severity::Warn,
                        kind: "processing_time".into(),
                        component: "classifier".into(),
                        message: format!("classification took {processing_ms} ms"),
                    });
                }
                self.recovery.on_recovery_success(
                    FaultKind::AiModelFailure,
                    "classifier",
                    classify_ts_ns,
                );
                self.finish_recovering_if_pending();
                if !item_live {
                    return;
                }
                if let Some(item) = self.items.get_mut(&item_id) {
                    item.classification = Some(classification.clone());
                    item.classify_ts_ns = Some(classify_ts_ns);
                }

                let request = ScheduleRequest {
                    item_id,
                    trigger_ts_ns,
                    classify_ts_ns,
                    category: classification.category,
                    confidence: classification.confidence,
                    bbox: classification.bbox,
                    fallback_applied: classification.fallback_applied,
                };
                let inputs = ScheduleInputs {
                    state: self.machine.state(),
                    belt_speed_mps: self.belt.nominal_speed_mps(),
                    bin_accepting: self.bins.accepting(),
                };
                match self.scheduler.schedule(&request, &inputs, self.clock.now_ns()) {
                    Ok(fire_ts_ns) => {
                        if let Some(item) = self.items.get_mut(&item_id) {
                            item.fire_deadline_ns = Some(fire_ts_ns);
                        }
                    }
                    Err(reason) => {
                        self.drop_item(item_id, Some(classification.category), reason);
                    }
                }
            }
            Err(e) => {
                let now = self.clock.now_ns();
                self.metrics.record_error();
                self.consecutive_processing_errors += 1;
                let severity = match &e {
                    ClassifyError::Timeout(_) => Severity::Warn,
                    ClassifyError::Model(_) => Severity::Error,
                };
                self.report_fault(FaultReport::new(
                    FaultKind::AiModelFailure,
                    "classifier",
                    severity,
                    now,
                    e.to_string(),
                ));
                if item_live {
                    self.drop_item(item_id, None, DropReason::ClassifierError);
                }
                if self.consecutive_processing_errors
                    >= self.config.system_settings.max_processing_errors
                {
                    if let Some(change) = self.machine.force(
                        SystemState::Error,
                        "max processing errors exceeded",
                        now,
                    ) {
                        self.publish_state_change(change);
                    }
                    let _ = self.belt.stop(false, now);
                    self.cancel_all_fires();
                }
            }
        }
    }

    /// Route a model-slot reload to the classification stage. Worker
    /// reload failures come back as `ReloadFailed` events.
    fn classifier_reload(&mut self, slot: ModelSlot) -> Result<(), ClassifyError> {
        match &mut self.classify {
            ClassifyStage::Inline(client) => client.reload(slot),
            ClassifyStage::Worker {
                jobs_tx: Some(tx), ..
            } => {
                let _ = tx.try_send(ClassifyCommand::Reload(slot));
                Ok(())
            }
            ClassifyStage::Worker { jobs_tx: None, .. } => Ok(()),
        }
    }

    // ─── Dispatch & Results ─────────────────────────────────────────

    fn dispatch_due(&mut self) {
        let now = self.clock.now_ns();
        for action in self.scheduler.collect_due(now) {
            match action {
                DueAction::Stale {
                    item_id, category, ..
                } => {
                    self.drop_item(item_id, Some(category), DropReason::Late);
                }
                DueAction::Fire(command) => self.execute_fire(command),
            }
        }
    }

    fn execute_fire(&mut self, command: FireCommand) {
        let rejected = match &mut self.dispatcher {
            Dispatcher::Workers(workers) => {
                let tx = workers
                    .iter()
                    .find(|w| w.category == command.category)
                    .and_then(|w| w.tx.as_ref());
                match tx {
                    Some(tx) => match tx.try_send(command) {
                        Ok(()) => None,
                        Err(
                            TrySendError::Full(command) | TrySendError::Disconnected(command),
                        ) => Some(command),
                    },
                    None => None,
                }
            }
            Dispatcher::Inline(actuators) => {
                let halted = self.halt.load(Ordering::Acquire)
                    || command.generation != self.live_generation.load(Ordering::Acquire);
                if let Some((_, actuator)) = actuators
                    .iter_mut()
                    .find(|(cat, _)| *cat == command.category)
                {
                    let outcome = if halted {
                        Ok(())
                    } else {
                        actuator.activate(command.activation_s)
                    };
                    let status = actuator.status();
                    // Same path as the worker mode: results drain next.
                    let _ = self.results_tx.try_send(ActuationResult {
                        outcome,
                        op_count: status.op_count,
                        maintenance_due: status.maintenance_due,
                        skipped: halted,
                        command,
                    });
                }
                None
            }
        };
        if let Some(command) = rejected {
            // Worker backlog counts as a hardware fault.
            let now = self.clock.now_ns();
            let category = command.category;
            self.report_fault(
                FaultReport::new(
                    FaultKind::HardwareFailure,
                    format!("diverter:{category}"),
                    Severity::Error,
                    now,
                    "worker queue rejected fire command",
                )
                .with_category(category),
            );
            self.drop_item(command.item_id, Some(category), DropReason::Congested);
        }
    }

    fn drain_results(&mut self) {
        while let Ok(result) = self.results_rx.try_recv() {
            self.handle_actuation_result(result);
        }
    }

    fn handle_actuation_result(&mut self, result: ActuationResult) {
        let command = &result.command;
        let category = command.category;
        if result.skipped {
            self.drop_item(command.item_id, Some(category), DropReason::BeltNotReady);
            return;
        }
        match &result.outcome {
            Ok(()) => {
                let now = self.clock.now_ns();
                self.metrics
                    .record_actuated(category, command.confidence, now);
                if let Some(mut item) = self.items.remove(&command.item_id) {
                    item.actuated = true;
                    item.outcome = Some(ItemOutcome::Delivered);
                }
                self.recovery.on_recovery_success(
                    FaultKind::HardwareFailure,
                    &format!("diverter:{category}"),
                    now,
                );
                self.bus.publish(TelemetryEvent::ItemActuated {
                    item_id: command.item_id,
                    trigger_ts_ns: command.trigger_ts_ns,
                    classify_ts_ns: command.classify_ts_ns,
                    fire_ts_ns: command.fire_ts_ns,
                    category,
                    confidence: command.confidence,
                    bbox: command.bbox,
                    diverter_op_count: result.op_count,
                });
                if result.maintenance_due {
                    self.bus.publish(TelemetryEvent::Alert {
                        severity: Severity::Warn,
                        kind: "maintenance_due".into(),
                        component: format!("diverter:{category}"),
                        message: "operation count past maintenance threshold".into(),
                    });
                }
            }
            Err(e) => {
                let now = self.clock.now_ns();
                self.metrics.record_error();
                self.report_fault(
                    FaultReport::new(
                        FaultKind::HardwareFailure,
                        format!("diverter:{category}"),
                        Severity::Error,
                        now,
                        e.to_string(),
                    )
                    .with_category(category),
                );
                if let Some(mut item) = self.items.remove(&command.item_id) {
                    item.outcome = Some(ItemOutcome::Failed);
                }
                // The failed pulse let the item pass the diverter.
                self.metrics.record_dropped(DropReason::Late, now);
                self.bus.publish(TelemetryEvent::ItemDropped {
                    item_id: command.item_id,
                    trigger_ts_ns: command.trigger_ts_ns,
                    category: Some(category),
                    reason: DropReason::Late,
                });
            }
        }
    }

    // ─── Bins & Metrics ─────────────────────────────────────────────

    fn poll_bins(&mut self) {
        let now = self.clock.now_ns();
        let interval =
            secs_to_ns(self.config.sensors_settings.bin_level_sensors.update_interval_s);
        if now.saturating_sub(self.last_bin_poll_ns) < interval {
            return;
        }
        self.last_bin_poll_ns = now;

        let mut faults = Vec::new();
        let mut transitions = Vec::new();
        let mut recovered = Vec::new();
        for (cat, sensor) in &mut self.bin_sensors {
            let component = format!("bin:{cat}");
            match sensor.read_fill(self.backend.as_ref()) {
                Ok(reading) => {
                    if self.degraded_sensors.remove(&component) {
                        recovered.push(component);
                    }
                    if let Some(transition) = self.bins.update(*cat, reading.fill_fraction, now) {
                        transitions.push(transition);
                    }
                }
                Err(e) => {
                    if !self.degraded_sensors.contains(&component) {
                        faults.push(FaultReport::new(
                            FaultKind::SensorFailure,
                            component,
                            Severity::Warn,
                            now,
                            e.to_string(),
                        ));
                    }
                }
            }
        }
        for component in recovered {
            self.recovery
                .on_recovery_success(FaultKind::SensorFailure, &component, now);
        }
        for fault in faults {
            self.report_fault(fault);
        }
        for transition in transitions {
            self.bus.publish(TelemetryEvent::BinChanged {
                category: transition.category,
                fill_fraction: transition.fill_fraction,
                state: transition.to,
            });
            if transition.to == BinState::Critical {
                self.report_fault(
                    FaultReport::new(
                        FaultKind::BinFull,
                        format!("bin:{}", transition.category),
                        Severity::Error,
                        now,
                        format!("fill at {:.0}%", transition.fill_fraction * 100.0),
                    )
                    .with_category(transition.category),
                );
            }
        }
    }

    /// Operational-limits watchdog, on its own sampling interval so a
    /// short excursion between metrics ticks still reaches it.
    fn evaluate_limits(&mut self, now_ns: u64) {
        let interval = secs_to_ns(self.config.monitoring_settings.limits_interval_s);
        if now_ns.saturating_sub(self.last_limits_ns) < interval {
            return;
        }
        self.last_limits_ns = now_ns;
        self.last_sample = self.sampler.sample();

        let runtime_h = self
            .run_started_ns
            .map(|start| now_ns.saturating_sub(start) as f64 / (3600.0 * NANOS_PER_SEC as f64))
            .unwrap_or(0.0);
        let items_last_hour = self.metrics.items_in_last_hour(now_ns);
        let actions = self
            .limits
            .evaluate(&self.last_sample, runtime_h, items_last_hour);
        for action in actions {
            self.apply_limit_action(action, now_ns);
        }
    }

    fn metrics_tick(&mut self, now_ns: u64) {
        let interval = secs_to_ns(self.config.monitoring_settings.metrics_interval_s);
        if now_ns.saturating_sub(self.last_metrics_ns) < interval {
            return;
        }
        self.last_metrics_ns = now_ns;
        // `last_sample` is refreshed by the limits watchdog, which runs
        // at least as often as the metrics tick.
        let snapshot = self
            .metrics
            .snapshot(now_ns, wall_ts_ms(), self.last_sample);
        self.last_snapshot = Some(snapshot);
        self.bus.publish(TelemetryEvent::Metrics(snapshot));

        let rate_pct = snapshot.error_rate * 100.0;
        let rate_limit = self.config.monitoring_settings.alerts.error_rate_warning_percent;
        if rate_pct > rate_limit && !self.error_rate_alerted {
            self.error_rate_alerted = true;
            self.bus.publish(TelemetryEvent::Alert {
                severity: Severity::Warn,
                kind: "error_rate".into(),
                component: "pipeline".into(),
                message: format!("error rate at {rate_pct:.1}% (limit {rate_limit:.1}%)"),
            });
        } else if rate_pct <= rate_limit {
            self.error_rate_alerted = false;
        }
    }

    fn apply_limit_action(&mut self, action: LimitAction, now_ns: u64) {
        match action {
            LimitAction::Pause { kind, message } => {
                self.bus.publish(TelemetryEvent::Alert {
                    severity: Severity::Warn,
                    kind: kind.into(),
                    component: "limits".into(),
                    message,
                });
                if let Some(change) = self.machine.force(SystemState::Paused, kind, now_ns) {
                    self.pause_cause = Some(kind);
                    self.publish_state_change(change);
                    self.cancel_beyond_grace(now_ns);
                    let _ = self.belt.pause(now_ns);
                }
            }
            LimitAction::Escalate { kind, message } => {
                self.bus.publish(TelemetryEvent::Alert {
                    severity: Severity::Critical,
                    kind: kind.into(),
                    component: "limits".into(),
                    message,
                });
                if let Some(change) = self.machine.force(SystemState::Error, kind, now_ns) {
                    self.publish_state_change(change);
                }
                let _ = self.belt.stop(false, now_ns);
                self.cancel_all_fires();
            }
            LimitAction::Clear { kind } => {
                self.bus.publish(TelemetryEvent::Alert {
                    severity: Severity::Info,
                    kind: kind.into(),
                    component: "limits".into(),
                    message: "limit cleared".into(),
                });
                // Temperature pauses auto-resume once hysteresis clears;
                // everything else waits for the operator.
                if kind == "high_temperature"
                    && self.pause_cause == Some(kind)
                    && self.machine.state() == SystemState::Paused
                {
                    if let Err(e) = self.resume() {
                        warn!(error = %e, "auto-resume after temperature clear failed");
                    }
                }
            }
        }
    }

    // ─── Faults & Recovery ──────────────────────────────────────────

    fn report_fault(&mut self, report: FaultReport) {
        warn!(kind = %report.kind, component = %report.component, detail = %report.detail, "fault");
        self.bus.publish(TelemetryEvent::Alert {
            severity: report.severity,
            kind: report.kind.as_str().into(),
            component: report.component.clone(),
            message: report.detail.clone(),
        });
        let now = report.ts_ns;
        let action = self.recovery.on_fault(&report, now);
        self.apply_recovery_action(action, &report, now);
    }

    fn apply_recovery_action(&mut self, action: RecoveryAction, report: &FaultReport, now_ns: u64) {
        match action {
            RecoveryAction::Retry { component } => {
                self.enter_recovering(&component, now_ns);
                if report.kind == FaultKind::AiModelFailure {
                    let _ = self.classifier_reload(ModelSlot::Primary);
                }
            }
            RecoveryAction::Failover { component, target } => {
                self.enter_recovering(&component, now_ns);
                match target {
                    FailoverTarget::BackupModel => {
                        if self.classifier_reload(ModelSlot::Backup).is_err() {
                            self.report_fault(FaultReport::new(
                                FaultKind::AiModelFailure,
                                component,
                                Severity::Critical,
                                now_ns,
                                "backup model failed to load",
                            ));
                        }
                    }
                    FailoverTarget::BackupCamera(index) => {
                        info!(index, "switching to backup camera");
                    }
                }
            }
            RecoveryAction::RestartComponent { component } => {
                self.enter_recovering(&component, now_ns);
                info!(component, "component restart requested");
            }
            RecoveryAction::DegradeSensor { component } => {
                self.degraded_sensors.insert(component);
            }
            RecoveryAction::DisableDiverter { category } => {
                self.scheduler.set_diverter_enabled(category, false);
                for (cat, shared) in &self.diverter_shared {
                    if *cat == category {
                        shared.set_enabled(false);
                    }
                }
                self.bus.publish(TelemetryEvent::Alert {
                    severity: Severity::Error,
                    kind: "diverter_disabled".into(),
                    component: format!("diverter:{category}"),
                    message: "disabled after repeated faults".into(),
                });
            }
            RecoveryAction::PauseCategory { category } => {
                // The bin gate already refuses the category; surface it.
                self.bus.publish(TelemetryEvent::Alert {
                    severity: Severity::Error,
                    kind: "category_paused".into(),
                    component: format!("bin:{category}"),
                    message: "bin critical; operator intervention required".into(),
                });
            }
            RecoveryAction::StopBelt => {
                let _ = self.belt.stop(false, now_ns);
                if let Some(change) = self.machine.force(SystemState::Error, "belt failure", now_ns)
                {
                    self.publish_state_change(change);
                }
                self.cancel_all_fires();
            }
            RecoveryAction::Pause { reason } => {
                if let Some(change) = self.machine.force(SystemState::Paused, &reason, now_ns) {
                    self.pause_cause = Some("high_temperature");
                    self.publish_state_change(change);
                    self.cancel_beyond_grace(now_ns);
                    let _ = self.belt.pause(now_ns);
                }
            }
            RecoveryAction::Escalate { reason } => {
                if let Some(change) = self.machine.force(SystemState::Error, &reason, now_ns) {
                    self.publish_state_change(change);
                }
                let _ = self.belt.stop(false, now_ns);
                self.cancel_all_fires();
                self.bus.publish(TelemetryEvent::Alert {
                    severity: Severity::Critical,
                    kind: report.kind.as_str().into(),
                    component: report.component.clone(),
                    message: reason,
                });
            }
            RecoveryAction::None => {}
        }
    }

    fn enter_recovering(&mut self, component: &str, now_ns: u64) {
        if self.machine.state() == SystemState::Running {
            if let Some(change) =
                self.machine
                    .force(SystemState::Recovering, format!("recovering {component}"), now_ns)
            {
                self.recovering_return = Some(SystemState::Running);
                self.publish_state_change(change);
            }
        }
    }

    /// Return to the pre-fault state after a successful recovery.
    fn finish_recovering_if_pending(&mut self) {
        if self.machine.state() != SystemState::Recovering {
            return;
        }
        let Some(target) = self.recovering_return.take() else {
            return;
        };
        let now = self.clock.now_ns();
        match self
            .machine
            .request(target, "recovery succeeded", &self.guards(), now)
        {
            Ok(change) => self.publish_state_change(change),
            Err(e) => {
                warn!(error = %e, "could not return to pre-fault state");
                self.recovering_return = Some(target);
            }
        }
    }

    fn report_config_rejected(&mut self, error: &ConfigError) {
        let now = self.clock.now_ns();
        warn!(error = %error, "config reload rejected; keeping active snapshot");
        self.bus.publish(TelemetryEvent::Alert {
            severity: Severity::Warn,
            kind: FaultKind::ConfigInvalid.as_str().into(),
            component: "config".into(),
            message: error.to_string(),
        });
        let report = FaultReport::new(
            FaultKind::ConfigInvalid,
            "config",
            Severity::Warn,
            now,
            error.to_string(),
        );
        let _ = self.recovery.on_fault(&report, now);
    }

    // ─── Safety Sequences ───────────────────────────────────────────

    fn execute_emergency(&mut self, reason: &str) {
        let now = self.clock.now_ns();
        self.halt.store(true, Ordering::Release);
        if let Some(change) = self.machine.force(SystemState::Error, reason, now) {
            self.publish_state_change(change);
        }
        let _ = self.belt.emergency_stop();
        self.cancel_all_fires();
        for (_, shared) in &self.diverter_shared {
            shared.set_enabled(false);
        }
        self.bus.publish(TelemetryEvent::Alert {
            severity: Severity::Critical,
            kind: FaultKind::EStop.as_str().into(),
            component: "safety".into(),
            message: reason.to_string(),
        });
        let report = FaultReport::new(FaultKind::EStop, "safety", Severity::Critical, now, reason);
        let _ = self.recovery.on_fault(&report, now);
    }

    fn drain_intents(&mut self, now_ns: u64) {
        while let Ok(intent) = self.intents_rx.try_recv() {
            if intent.target == SystemState::Error && intent.reason == "E_STOP" {
                if self.estop.force_asserted() {
                    self.execute_emergency("E_STOP");
                }
                continue;
            }
            if let Some(change) = self.machine.force(intent.target, intent.reason, now_ns) {
                self.publish_state_change(change);
            }
        }
    }

    fn cancel_all_fires(&mut self) {
        let cancelled = self.scheduler.cancel_all();
        self.live_generation
            .store(self.scheduler.generation(), Ordering::Release);
        for fire in cancelled {
            self.drop_item(fire.item_id, Some(fire.category), DropReason::BeltNotReady);
        }
    }

    fn cancel_beyond_grace(&mut self, now_ns: u64) {
        for fire in self.scheduler.cancel_beyond_grace(now_ns) {
            self.drop_item(fire.item_id, Some(fire.category), DropReason::BeltNotReady);
        }
    }

    // ─── Helpers ────────────────────────────────────────────────────

    fn guards(&self) -> GuardContext {
        GuardContext {
            belt_running: self.belt.state() == BeltState::Running,
            components_healthy: !self.recovery.is_escalated(),
            estop_asserted: self.estop.is_asserted(),
        }
    }

    fn drop_item(&mut self, item_id: ItemId, category: Option<Category>, reason: DropReason) {
        let now = self.clock.now_ns();
        self.metrics.record_dropped(reason, now);
        let trigger_ts_ns = match self.items.remove(&item_id) {
            Some(mut item) => {
                item.outcome = Some(ItemOutcome::Dropped(reason));
                item.trigger_ts_ns
            }
            None => 0,
        };
        debug!(item = item_id, %reason, "item dropped");
        self.bus.publish(TelemetryEvent::ItemDropped {
            item_id,
            trigger_ts_ns,
            category,
            reason,
        });
    }

    fn publish_state_change(&mut self, change: crate::machine::StateChange) {
        self.bus.publish(TelemetryEvent::StateChanged {
            from: change.from,
            to: change.to,
            reason: change.reason,
        });
    }

    fn ramp_belt_to_completion(&mut self) -> Result<(), ControlError> {
        let deadline = self.clock.now_ns()
            + secs_to_ns(self.config.conveyor_belt_settings.accel_time_s + 1.0);
        while self.belt.state() == BeltState::Accelerating && self.clock.now_ns() < deadline {
            self.clock.sleep(Duration::from_millis(20));
            self.belt.tick(self.clock.now_ns())?;
        }
        Ok(())
    }

    /// Drain classified-but-unfired work under the shutdown deadline.
    fn drain_pipeline(&mut self) {
        let deadline = self.clock.now_ns()
            + secs_to_ns(self.config.system_settings.max_shutdown_drain_s);
        while !self.items.is_empty() && self.clock.now_ns() < deadline {
            self.submit_classification();
            self.drain_classify_events();
            self.dispatch_due();
            self.drain_results();
            if self.items.is_empty() {
                break;
            }
            self.clock.sleep(Duration::from_millis(20));
        }
        // Whatever remains is cancelled, not leaked.
        self.cancel_all_fires();
        let leftover: Vec<ItemId> = self.items.keys().copied().collect();
        for item_id in leftover {
            self.drop_item(item_id, None, DropReason::BeltNotReady);
        }
    }

    fn teardown_workers(&mut self) {
        if let ClassifyStage::Worker { jobs_tx, join, .. } = &mut self.classify {
            *jobs_tx = None;
            if let Some(join) = join.take() {
                let _ = join.join();
            }
        }
        if let Dispatcher::Workers(workers) = &mut self.dispatcher {
            for worker in workers.iter_mut() {
                worker.tx = None;
            }
            for worker in workers.iter_mut() {
                if let Some(join) = worker.join.take() {
                    let _ = join.join();
                }
            }
        }
        if let Some(join) = self.estop_thread.take() {
            self.shutdown_flag.store(true, Ordering::Relaxed);
            let _ = join.join();
        }
    }

    /// Fast-reflex E-stop sampler: sets the halt flag and queues the
    /// forced transition without waiting for the control loop.
    fn spawn_estop_reflex(&mut self) {
        if !self.estop.is_enabled() || self.estop_thread.is_some() {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let clock = Arc::clone(&self.clock);
        let halt = Arc::clone(&self.halt);
        let intents = self.intents_tx.clone();
        let shutdown = Arc::clone(&self.shutdown_flag);
        let pin = self.estop_pin;
        let interval =
            Duration::from_millis(self.config.safety_settings.estop_sample_interval_ms.max(1));
        self.estop_thread = Some(std::thread::spawn(move || {
            let mut last_active = false;
            while !shutdown.load(Ordering::Relaxed) {
                let active = backend
                    .read(pin)
                    .map(|level| level.is_high())
                    .unwrap_or(false);
                if active && !last_active {
                    halt.store(true, Ordering::Release);
                    let _ = intents.try_send(ForcedTransition {
                        target: SystemState::Error,
                        reason: "E_STOP".into(),
                    });
                }
                last_active = active;
                clock.sleep(interval);
            }
        }));
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        self.teardown_workers();
    }
}

// ─── Classification Worker ──────────────────────────────────────────

/// Spawn the inference worker: frames in, classification outcomes out.
/// Owns the `ClassifierClient`, so reloads and setting updates arrive on
/// the same channel and apply in order.
fn spawn_classify_worker(
    mut client: ClassifierClient,
    clock: Arc<dyn Clock>,
) -> ClassifyStage {
    let (jobs_tx, jobs_rx) = sync_channel::<ClassifyCommand>(64);
    let (events_tx, events_rx) = sync_channel::<ClassifyEvent>(64);
    let join = std::thread::spawn(move || {
        while let Ok(command) = jobs_rx.recv() {
            match command {
                ClassifyCommand::Frame {
                    item_id,
                    trigger_ts_ns,
                    frame_ref,
                    deadline_ns,
                } => {
                    let started_ns = clock.now_ns();
                    let result = client.classify(frame_ref, deadline_ns);
                    let classify_ts_ns = clock.now_ns();
                    let event = ClassifyEvent::Classified {
                        item_id,
                        trigger_ts_ns,
                        started_ns,
                        classify_ts_ns,
                        result,
                    };
                    if events_tx.send(event).is_err() {
                        break;
                    }
                }
                ClassifyCommand::Reload(slot) => {
                    if let Err(error) = client.reload(slot) {
                        let _ = events_tx.try_send(ClassifyEvent::ReloadFailed { slot, error });
                    }
                }
                ClassifyCommand::UpdateSettings(settings) => {
                    client.update_settings(&settings);
                }
            }
        }
    });
    ClassifyStage::Worker {
        jobs_tx: Some(jobs_tx),
        events_rx,
        join: Some(join),
    }
}

// ─── Diverter Worker ────────────────────────────────────────────────

fn spawn_diverter_worker(
    category: Category,
    mut actuator: Box<dyn Actuator>,
    results: SyncSender<ActuationResult>,
    halt: Arc<AtomicBool>,
    live_generation: Arc<AtomicU64>,
) -> DiverterWorker {
    let (tx, rx) = sync_channel::<FireCommand>(8);
    let join = std::thread::spawn(move || {
        while let Ok(command) = rx.recv() {
            let skipped = halt.load(Ordering::Acquire)
                || command.generation != live_generation.load(Ordering::Acquire);
            let outcome = if skipped {
                Ok(())
            } else {
                actuator.activate(command.activation_s)
            };
            let status = actuator.status();
            let result = ActuationResult {
                command,
                op_count: status.op_count,
                maintenance_due: status.maintenance_due,
                outcome,
                skipped,
            };
            if results.send(result).is_err() {
                break;
            }
        }
        let _ = actuator.shutdown();
    });
    DiverterWorker {
        category,
        tx: Some(tx),
        join: Some(join),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sorter_common::clock::{MonotonicClock, VirtualClock};
    use sorter_hal::gpio::{Level, SimBackend};

    use crate::classifier::{ClassifyError, ScriptedClassifier, ScriptedStep, StubClassifier};

    struct StaticSampler(SystemSample);
    impl SystemSampler for StaticSampler {
        fn sample(&mut self) -> SystemSample {
            self.0
        }
    }

    fn harness(
        script: Vec<ScriptedStep>,
    ) -> (Orchestrator, Arc<SimBackend>, Arc<VirtualClock>) {
        let clock = Arc::new(VirtualClock::new());
        clock.set_auto_advance(true);
        let backend = Arc::new(SimBackend::new());
        let mut classifier = ScriptedClassifier::new(Arc::clone(&clock));
        for step in script {
            classifier.push(step);
        }
        let orchestrator = Orchestrator::build(
            SorterConfig::example(),
            backend.clone() as Arc<dyn GpioBackend>,
            Box::new(classifier),
            clock.clone() as Arc<dyn Clock>,
            DispatchMode::Inline,
            Box::new(StaticSampler(SystemSample::default())),
        )
        .unwrap();
        (orchestrator, backend, clock)
    }

    #[test]
    fn build_claims_pins_and_initializes() {
        let (mut orch, _, _) = harness(vec![]);
        assert_eq!(orch.state(), SystemState::Initializing);
        assert_eq!(orch.initialize().unwrap(), SystemState::Idle);
    }

    #[test]
    fn start_ramps_belt_then_runs() {
        let (mut orch, _, _) = harness(vec![]);
        orch.initialize().unwrap();
        assert_eq!(orch.start().unwrap(), SystemState::Running);
        assert_eq!(orch.status().belt_state, BeltState::Running);
        assert!(orch.status().belt_speed_mps > 0.0);
    }

    #[test]
    fn start_refused_when_estop_asserted() {
        let (mut orch, backend, _) = harness(vec![]);
        orch.initialize().unwrap();
        backend.set_input(17, Level::High);
        orch.step();
        assert_eq!(orch.state(), SystemState::Error);
        assert!(orch.start().is_err());
    }

    #[test]
    fn trigger_to_actuation_happy_path() {
        let (mut orch, backend, clock) = harness(vec![ScriptedStep::ok(
            Duration::from_millis(200),
            "metal",
            0.9,
        )]);
        let events = orch.subscribe(&[Topic::ItemActuated], 16, DropPolicy::DropOldest);
        orch.initialize().unwrap();
        orch.start().unwrap();

        // Seed the edge detector with the idle level.
        orch.step();
        backend.set_input(22, Level::High);
        orch.step();
        backend.set_input(22, Level::Low);

        // Travel for metal at 0.15 m/s over 0.60 m = 4 s; the scripted
        // classifier already consumed 200 ms of it.
        clock.advance(Duration::from_millis(3800));
        orch.step();

        let event = events.try_recv().expect("actuation event");
        match event {
            TelemetryEvent::ItemActuated {
                category,
                fire_ts_ns,
                trigger_ts_ns,
                ..
            } => {
                assert_eq!(category, Category::Metal);
                assert_eq!(fire_ts_ns - trigger_ts_ns, 4 * NANOS_PER_SEC);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(orch.status().items_in_flight, 0);
    }

    #[test]
    fn reload_current_snapshot_is_noop() {
        let (mut orch, _, _) = harness(vec![]);
        orch.initialize().unwrap();
        let events = orch.subscribe(&[], 16, DropPolicy::DropOldest);
        let snapshot = (*orch.config()).clone();
        orch.reload_config(snapshot).unwrap();
        assert!(events.is_empty());
        assert_eq!(orch.state(), SystemState::Idle);
    }

    #[test]
    fn reload_invalid_config_keeps_active_snapshot() {
        let (mut orch, _, _) = harness(vec![]);
        orch.initialize().unwrap();
        let active = orch.config();
        let mut bad = (*active).clone();
        bad.conveyor_belt_settings.belt_speed_mps = -1.0;
        assert!(orch.reload_config(bad).is_err());
        assert_eq!(*orch.config(), *active);
    }

    #[test]
    fn maintenance_round_trip() {
        let (mut orch, _, _) = harness(vec![]);
        orch.initialize().unwrap();
        assert_eq!(orch.enter_maintenance().unwrap(), SystemState::Maintenance);
        assert_eq!(orch.exit_maintenance().unwrap(), SystemState::Idle);
    }

    #[test]
    fn stop_reaches_terminal_state() {
        let (mut orch, _, _) = harness(vec![]);
        orch.initialize().unwrap();
        orch.start().unwrap();
        assert_eq!(orch.stop().unwrap(), SystemState::Shutdown);
    }

    /// Worker mode: classification and actuation both run off the
    /// control loop, fed and drained through bounded channels.
    #[test]
    fn workers_mode_classifies_and_fires_off_loop() {
        let clock = Arc::new(MonotonicClock::new());
        let backend = Arc::new(SimBackend::new());
        let mut config = SorterConfig::example();
        config.conveyor_belt_settings.accel_time_s = 0.05;
        config.conveyor_belt_settings.decel_time_s = 0.05;
        // Short travel and pulse so the test runs in real time.
        config
            .conveyor_belt_settings
            .distance_camera_to_diverters_m
            .insert(Category::Metal, 0.03);
        config
            .diverter_control_settings
            .diverters
            .get_mut(&Category::Metal)
            .unwrap()
            .activation_duration_s = Some(0.05);

        let mut orch = Orchestrator::build(
            config,
            backend.clone() as Arc<dyn GpioBackend>,
            // Stub classifies the first frame as metal.
            Box::new(StubClassifier::new()),
            clock as Arc<dyn Clock>,
            DispatchMode::Workers,
            Box::new(StaticSampler(SystemSample::default())),
        )
        .unwrap();
        let events = orch.subscribe(&[Topic::ItemActuated], 16, DropPolicy::DropOldest);
        orch.initialize().unwrap();
        orch.start().unwrap();

        // Seed the trigger detector, then pulse the input.
        orch.step();
        backend.set_input(22, Level::High);
        orch.step();
        backend.set_input(22, Level::Low);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut actuated = None;
        while std::time::Instant::now() < deadline {
            orch.step();
            if let Some(event) = events.try_recv() {
                actuated = Some(event);
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        match actuated.expect("actuation within the deadline") {
            TelemetryEvent::ItemActuated { category, .. } => {
                assert_eq!(category, Category::Metal);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(orch.status().items_in_flight, 0);
        orch.stop().unwrap();
    }
}
