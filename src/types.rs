use std::fmt;

/// Operating mode of a heating zone.
///
/// `Off`, `Manual`, `Profile`, `Holiday` and `Bypass` are user-selectable;
/// `Away` is normally derived from the presence flag during resolution but
/// is accepted as an input state for hosts that expose it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneMode {
    Off,
    Manual,
    Profile,
    Holiday,
    Bypass,
    Away,
}

impl ZoneMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneMode::Off => "off",
            ZoneMode::Manual => "manual",
            ZoneMode::Profile => "profile",
            ZoneMode::Holiday => "holiday",
            ZoneMode::Bypass => "bypass",
            ZoneMode::Away => "away",
        }
    }

    pub fn from_state_str(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ZoneMode::Off),
            "manual" => Some(ZoneMode::Manual),
            "profile" => Some(ZoneMode::Profile),
            "holiday" => Some(ZoneMode::Holiday),
            "bypass" => Some(ZoneMode::Bypass),
            "away" => Some(ZoneMode::Away),
            _ => None,
        }
    }
}

impl fmt::Display for ZoneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured heating zone as the host reports it.
#[derive(Debug, Clone)]
pub struct ZoneConfig {
    pub id: String,
    pub name: String,
    pub enabled: bool,
}

impl ZoneConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
        }
    }
}

/// Per-zone entity states the resolver reads from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneEntity {
    Mode,
    Profile,
    Present,
    ManualTemperature,
    Priority,
    WindowDelay,
    CurrentTemperature,
}

/// Global settings the resolver reads from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalEntity {
    BoostDuration,
    BoostTemperature,
    Hysteresis,
}

/// Read access to host-owned state.
///
/// Values are raw state strings exactly as the host holds them; all
/// parsing and parse-failure fallback happens inside this crate. Missing
/// entities are `None`.
pub trait StateSource: Send + Sync {
    /// Current zone set, in display order. Re-read on every update pass.
    fn zones(&self) -> Vec<ZoneConfig>;

    fn zone_state(&self, zone_id: &str, entity: ZoneEntity) -> Option<String>;

    fn global_state(&self, entity: GlobalEntity) -> Option<String>;
}

/// Outbound state changes, delivered through the update callbacks.
///
/// All of these are fire-and-forget requests to the host; the manager
/// only emits them when the underlying value actually changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// New setpoint for a zone's actuator.
    TargetTemperature { zone_id: String, temp: f64 },
    /// Boost indicator forced to a state (manual stop only).
    BoostIndicator { zone_id: String, on: bool },
    /// Global heat-demand flag transition.
    HeatingDemand { on: bool },
    /// New priority-weighted average temperature deficit.
    HeatingDeficit { value: f64 },
}
