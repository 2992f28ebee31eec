use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, Timelike};
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, BrokerConfig, FieldUpdate};
use crate::error::{Error, Result};
use crate::logger::{MessageLogMode, MessageLogger};
use crate::overrides::{BoostController, WindowController};
use crate::profile::{PROFILE_TOPIC_PREFIX, ScheduleStore};
use crate::schedule::{self, ResolveInputs, TEMP_FALLBACK};
use crate::types::{GlobalEntity, StateSource, Update, ZoneConfig, ZoneEntity, ZoneMode};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_BOOST_DURATION_MIN: f64 = 60.0;
const DEFAULT_BOOST_TEMP: f64 = 25.0;
const DEFAULT_HYSTERESIS: f64 = 0.5;
const DEFAULT_WINDOW_DELAY_MIN: f64 = 10.0;

/// Setpoint changes smaller than this are not pushed.
const PUSH_EPSILON: f64 = 0.1;

/// Host states treated as "no value".
const IGNORED_STATES: [&str; 2] = ["unknown", "unavailable"];

type UpdateCallback = Box<dyn Fn(&Update) + Send + Sync>;

/// Derived runtime data per zone; created lazily, dropped only with the
/// manager itself.
#[derive(Debug, Default)]
struct ZoneRuntime {
    last_sent: Option<f64>,
    last_current: Option<f64>,
}

#[derive(Debug, Default)]
struct AggregateState {
    deficit: f64,
    demand: bool,
}

pub struct ProfileManagerBuilder {
    source: Arc<dyn StateSource>,
    broker: Option<BrokerConfig>,
    poll_interval: Duration,
    cleanup_timeout: Duration,
    callbacks: Vec<UpdateCallback>,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
}

impl ProfileManagerBuilder {
    fn new(source: Arc<dyn StateSource>) -> Self {
        Self {
            source,
            broker: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
            callbacks: Vec::new(),
            log_mode: None,
            log_path: None,
        }
    }

    pub fn broker(mut self, config: BrokerConfig) -> Self {
        self.broker = Some(config);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    pub fn on_update(mut self, f: impl Fn(&Update) + Send + Sync + 'static) -> Self {
        self.callbacks.push(Box::new(f));
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> ProfileManager {
        ProfileManager {
            state: Arc::new(Mutex::new(ManagerState {
                source: self.source,
                store: ScheduleStore::default(),
                zones: HashMap::new(),
                boost: BoostController::default(),
                windows: WindowController::default(),
                aggregate: AggregateState::default(),
                broker: None,
                callbacks: self.callbacks,
                logger: None,
                cleanup_timeout: self.cleanup_timeout,
            })),
            broker_config: self.broker,
            poll_interval: self.poll_interval,
            log_mode: self.log_mode,
            log_path: self.log_path,
            tasks: Vec::new(),
            running: false,
        }
    }
}

/// Owns all schedule, zone-runtime and aggregate state plus the timer
/// handles. Everything is mutated under the one manager lock.
struct ManagerState {
    source: Arc<dyn StateSource>,
    store: ScheduleStore,
    zones: HashMap<String, ZoneRuntime>,
    boost: BoostController,
    windows: WindowController,
    aggregate: AggregateState,
    broker: Option<BrokerClient>,
    callbacks: Vec<UpdateCallback>,
    logger: Option<MessageLogger>,
    cleanup_timeout: Duration,
}

/// The profile manager: assembles broker-fed weekly schedules, resolves
/// per-zone target temperatures on a fixed interval (and on demand) and
/// aggregates the global heat-demand signal.
pub struct ProfileManager {
    state: Arc<Mutex<ManagerState>>,
    broker_config: Option<BrokerConfig>,
    poll_interval: Duration,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
    tasks: Vec<JoinHandle<()>>,
    running: bool,
}

impl ProfileManager {
    pub fn builder(source: Arc<dyn StateSource>) -> ProfileManagerBuilder {
        ProfileManagerBuilder::new(source)
    }

    /// Connects the broker and starts the interval loop.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(Error::AlreadyRunning);
        }
        info!("starting profile manager");

        {
            let mut state = self.state.lock().await;
            if let (Some(mode), Some(path)) = (self.log_mode, self.log_path.as_deref()) {
                state.logger = Some(MessageLogger::new(mode, path)?);
            }
            match &self.broker_config {
                Some(config) => {
                    let (broker, updates) = BrokerClient::connect(config);
                    state.broker = Some(broker);
                    self.tasks.push(spawn_ingest(Arc::clone(&self.state), updates));
                }
                None => warn!("no broker configured, schedules will stay empty"),
            }
        }

        self.tasks
            .push(spawn_poll_loop(Arc::clone(&self.state), self.poll_interval));
        self.running = true;
        Ok(())
    }

    /// Cancels every pending timer and background task, then releases the
    /// broker connection. Nothing fires after this returns.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        info!("stopping profile manager");
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let mut state = self.state.lock().await;
        state.boost.clear();
        state.windows.clear();
        if let Some(broker) = state.broker.take() {
            broker.shutdown();
        }
        self.running = false;
    }

    /// Runs exactly one poll/aggregation pass on demand. Passes serialize
    /// against the interval loop and the timer callbacks.
    pub async fn force_update(&self) {
        let mut state = self.state.lock().await;
        state.update_temps().await;
    }

    /// Starts (or restarts) a boost session for a zone using the global
    /// boost duration and temperature settings.
    pub async fn start_boost(&self, zone_id: &str) {
        let mut state = self.state.lock().await;
        let duration = state.boost_duration();
        let temp = state.boost_temp();
        let generation = state.boost.begin(zone_id, temp, duration);
        info!(zone = %zone_id, temp, ?duration, "boost started");

        let shared = Arc::clone(&self.state);
        let zone = zone_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let mut state = shared.lock().await;
            if state.boost.expire(&zone, generation) {
                info!(zone = %zone, "boost expired");
                state.update_temps().await;
            }
        });
        state.boost.arm(zone_id, timer);
        state.update_temps().await;
    }

    /// Cancels a running boost session. No-op when none is active.
    pub async fn stop_boost(&self, zone_id: &str) {
        let mut state = self.state.lock().await;
        if !state.boost.cancel(zone_id) {
            return;
        }
        info!(zone = %zone_id, "boost stopped");
        // The controller is the source of truth for the session, so the
        // indicator is forced off directly instead of via the push path.
        state.emit(Update::BoostIndicator {
            zone_id: zone_id.to_string(),
            on: false,
        });
        state.log_event("boost_stopped", &json!({ "zone": zone_id }));
        state.update_temps().await;
    }

    /// Window contact reported open. Arms the per-zone lockout delay; the
    /// 0°C override only applies once the delay has elapsed.
    pub async fn window_opened(&self, zone_id: &str) {
        let mut state = self.state.lock().await;
        let Some(generation) = state.windows.open(zone_id) else {
            return;
        };
        let delay = state.window_delay(zone_id);
        debug!(zone = %zone_id, ?delay, "window opened, lockout delayed");

        let shared = Arc::clone(&self.state);
        let zone = zone_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = shared.lock().await;
            if state.windows.delay_elapsed(&zone, generation) {
                debug!(zone = %zone, "window-open delay elapsed");
                state.update_temps().await;
            }
        });
        state.windows.arm(zone_id, timer);
    }

    /// Window contact reported closed. Reacts immediately, there is no
    /// delay on this side.
    pub async fn window_closed(&self, zone_id: &str) {
        let mut state = self.state.lock().await;
        if !state.windows.close(zone_id) {
            return;
        }
        debug!(zone = %zone_id, "window closed");
        state.update_temps().await;
    }

    pub async fn is_boost_active(&self, zone_id: &str) -> bool {
        self.state.lock().await.boost.is_active(zone_id)
    }

    pub async fn boost_remaining(&self, zone_id: &str) -> Option<Duration> {
        self.state.lock().await.boost.remaining(zone_id)
    }

    pub async fn is_window_open(&self, zone_id: &str) -> bool {
        self.state.lock().await.windows.is_open(zone_id)
    }

    /// Whether the window-open delay timer is still pending (distinct from
    /// the window simply being open).
    pub async fn is_window_delay_active(&self, zone_id: &str) -> bool {
        self.state.lock().await.windows.is_delay_active(zone_id)
    }

    pub async fn heating_demand(&self) -> bool {
        self.state.lock().await.aggregate.demand
    }

    pub async fn last_deficit(&self) -> f64 {
        self.state.lock().await.aggregate.deficit
    }

    pub async fn last_current_temperature(&self, zone_id: &str) -> Option<f64> {
        self.state
            .lock()
            .await
            .zones
            .get(zone_id)
            .and_then(|z| z.last_current)
    }
}

fn spawn_poll_loop(state: Arc<Mutex<ManagerState>>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut state = state.lock().await;
            state.update_temps().await;
        }
    })
}

fn spawn_ingest(
    state: Arc<Mutex<ManagerState>>,
    mut updates: mpsc::UnboundedReceiver<FieldUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            let mut state = state.lock().await;
            if let Some(logger) = state.logger.as_mut() {
                logger.log_field(&update.topic, &update.field, &update.value);
            }
            state
                .store
                .upsert_field(&update.topic, &update.field, &update.value);
        }
    })
}

impl ManagerState {
    /// One full poll/aggregation pass: subscribe newly referenced
    /// profiles, resolve and push every enabled zone, update the demand
    /// aggregate, then reap expired profiles. A single zone's bad data
    /// never aborts the pass.
    async fn update_temps(&mut self) {
        let zones: Vec<ZoneConfig> = self.source.zones();
        let now = Local::now();
        let weekday = now.weekday().number_from_monday();
        let minutes = now.hour() * 60 + now.minute();
        debug!(zones = zones.len(), "running update pass");

        let mut used: HashSet<String> = HashSet::new();
        for zone in zones.iter().filter(|z| z.enabled) {
            if let Some(topic) = self.zone_topic(&zone.id) {
                used.insert(topic);
            }
        }
        for topic in &used {
            if !self.store.contains(topic) {
                info!(topic = %topic, "tracking new schedule profile");
                self.store.ensure(topic);
                if let Some(broker) = &self.broker {
                    broker.subscribe_profile(topic).await;
                }
            }
        }

        let mut weighted_deficit = 0.0;
        let mut priority_sum = 0.0;

        for zone in zones.iter().filter(|z| z.enabled) {
            let target = self.resolve_zone(&zone.id, weekday, minutes);
            let current = self.read_zone_f64(&zone.id, ZoneEntity::CurrentTemperature);
            let priority = self
                .read_zone_f64(&zone.id, ZoneEntity::Priority)
                .unwrap_or(0.0)
                .max(0.0);

            let authoritative = (target - TEMP_FALLBACK).abs() > f64::EPSILON;
            let push = {
                let runtime = self.zones.entry(zone.id.clone()).or_default();
                runtime.last_current = current;
                if authoritative
                    && runtime
                        .last_sent
                        .is_none_or(|last| (last - target).abs() >= PUSH_EPSILON)
                {
                    runtime.last_sent = Some(target);
                    true
                } else {
                    false
                }
            };

            if push {
                debug!(zone = %zone.id, target, "pushing target temperature");
                self.log_push(&zone.id, target);
                self.emit(Update::TargetTemperature {
                    zone_id: zone.id.clone(),
                    temp: target,
                });
            } else if authoritative {
                debug!(zone = %zone.id, target, "target unchanged, push suppressed");
            } else {
                debug!(zone = %zone.id, "no authoritative target, push suppressed");
            }

            if priority > 0.0 {
                priority_sum += priority;
                if let Some(current) = current {
                    weighted_deficit += priority * (target - current).max(0.0);
                }
            }
        }

        let deficit = if priority_sum > 0.0 {
            weighted_deficit / priority_sum
        } else {
            0.0
        };
        self.update_demand(deficit);
        self.cleanup_profiles(&used).await;
    }

    /// Resolves one zone's target through the precedence chain.
    fn resolve_zone(&mut self, zone_id: &str, weekday: u32, minutes: u32) -> f64 {
        let mode = self
            .read_zone(zone_id, ZoneEntity::Mode)
            .as_deref()
            .and_then(ZoneMode::from_state_str);
        let present = self.read_zone(zone_id, ZoneEntity::Present).as_deref() != Some("off");
        let manual = self.read_zone(zone_id, ZoneEntity::ManualTemperature);
        let boost_temp = self.boost.active_temp(zone_id);
        let window_lockout = self.windows.lockout_active(zone_id);

        let topic = self.zone_topic(zone_id);
        let record = topic.as_deref().and_then(|t| self.store.lookup(t));

        schedule::resolve_target(
            zone_id,
            &ResolveInputs {
                mode,
                manual_temp: manual.as_deref(),
                present,
                boost_temp,
                window_lockout,
                record,
                weekday,
                minutes,
            },
        )
    }

    /// Asymmetric hysteresis: on above the band, off only at zero.
    fn update_demand(&mut self, deficit: f64) {
        let hysteresis = self.hysteresis();
        let previous = self.aggregate.demand;
        let demand = if deficit > hysteresis {
            true
        } else if deficit <= 0.0 {
            false
        } else {
            previous
        };

        if (self.aggregate.deficit - deficit).abs() >= 0.01 {
            self.emit(Update::HeatingDeficit { value: deficit });
        }
        self.aggregate.deficit = deficit;

        if demand != previous {
            info!(demand, deficit, "heat demand changed");
            self.aggregate.demand = demand;
            self.log_event("heating_demand", &json!({ "demand": demand, "deficit": deficit }));
            self.emit(Update::HeatingDemand { on: demand });
        }
    }

    /// Drops profiles no zone referenced this pass once they expire, and
    /// releases their broker subscriptions.
    async fn cleanup_profiles(&mut self, used: &HashSet<String>) {
        for topic in self.store.topics() {
            if used.contains(&topic) {
                continue;
            }
            if !self.store.is_expired(&topic, self.cleanup_timeout) {
                continue;
            }
            info!(topic = %topic, "dropping unused schedule profile");
            if let Some(broker) = &self.broker {
                broker.unsubscribe_profile(&topic).await;
            }
            self.store.remove(&topic);
        }
    }

    /// The broker topic a zone's profile selection maps to.
    fn zone_topic(&self, zone_id: &str) -> Option<String> {
        let profile = self.read_zone(zone_id, ZoneEntity::Profile)?;
        Some(format!("{PROFILE_TOPIC_PREFIX}{}", profile.to_lowercase()))
    }

    fn boost_duration(&self) -> Duration {
        let minutes = self
            .read_global_f64(GlobalEntity::BoostDuration)
            .unwrap_or(DEFAULT_BOOST_DURATION_MIN);
        Duration::from_secs_f64(minutes.max(0.0) * 60.0)
    }

    fn boost_temp(&self) -> f64 {
        self.read_global_f64(GlobalEntity::BoostTemperature)
            .unwrap_or(DEFAULT_BOOST_TEMP)
    }

    fn hysteresis(&self) -> f64 {
        self.read_global_f64(GlobalEntity::Hysteresis)
            .unwrap_or(DEFAULT_HYSTERESIS)
    }

    fn window_delay(&self, zone_id: &str) -> Duration {
        let minutes = self
            .read_zone_f64(zone_id, ZoneEntity::WindowDelay)
            .unwrap_or(DEFAULT_WINDOW_DELAY_MIN);
        Duration::from_secs_f64(minutes.max(0.0) * 60.0)
    }

    fn read_zone(&self, zone_id: &str, entity: ZoneEntity) -> Option<String> {
        self.source
            .zone_state(zone_id, entity)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && !IGNORED_STATES.contains(&s.as_str()))
    }

    fn read_zone_f64(&self, zone_id: &str, entity: ZoneEntity) -> Option<f64> {
        self.read_zone(zone_id, entity)?.parse().ok()
    }

    fn read_global_f64(&self, entity: GlobalEntity) -> Option<f64> {
        self.source
            .global_state(entity)
            .and_then(|s| s.trim().parse().ok())
    }

    fn emit(&self, update: Update) {
        for callback in &self.callbacks {
            callback(&update);
        }
    }

    fn log_push(&mut self, zone_id: &str, temp: f64) {
        if let Some(logger) = self.logger.as_mut() {
            logger.log_push(zone_id, temp);
        }
    }

    fn log_event(&mut self, kind: &str, detail: &serde_json::Value) {
        if let Some(logger) = self.logger.as_mut() {
            logger.log_event(kind, detail);
        }
    }
}
