//! # Voltage Debouncer
//!
//! Classifies voltage samples of one phase into a ladder of risk states and
//! reports state transitions.
//!
//! ## Bands
//!
//! Relative to the nominal contracted voltage `V`, checked top-down, lower
//! bound inclusive:
//!
//! | State | Band |
//! |-------|------|
//! | `CriticalHigh` | `>= 1.06 V` |
//! | `PrecariousHigh` | `[1.04 V, 1.06 V)` |
//! | `Normal` | `[0.91 V, 1.04 V)` |
//! | `PrecariousLow` | `[0.86 V, 0.91 V)` |
//! | `CriticalLow` | `[0.50 V, 0.86 V)` |
//! | `PhaseDown` | `< 0.50 V` |
//!
//! The band of the current state is widened by 0.5% on both finite sides
//! before each classification, so a sample hovering at a boundary does not
//! flip the state back and forth.
//!
//! ## Example
//!
//! ```rust
//! use voltage_collector::{VoltageDebouncer, VoltageState};
//!
//! let mut debouncer = VoltageDebouncer::new(220.0);
//! debouncer.update(220.0);
//! assert_eq!(debouncer.update(229.0).current, VoltageState::PrecariousHigh);
//! assert_eq!(debouncer.update(228.7).current, VoltageState::PrecariousHigh);
//! ```

use std::collections::VecDeque;
use std::fmt;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::events::EventSink;

/// Samples kept per phase unless configured otherwise.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// Relative widening applied to the current state's band.
const HYSTERESIS: f64 = 0.005;

/// Voltage risk state, ordered by voltage band (`PhaseDown` lowest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VoltageState {
    PhaseDown,
    CriticalLow,
    PrecariousLow,
    Normal,
    PrecariousHigh,
    CriticalHigh,
}

impl VoltageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoltageState::CriticalHigh => "critical_high",
            VoltageState::PrecariousHigh => "precarious_high",
            VoltageState::Normal => "normal",
            VoltageState::PrecariousLow => "precarious_low",
            VoltageState::CriticalLow => "critical_low",
            VoltageState::PhaseDown => "phase_down",
        }
    }
}

impl fmt::Display for VoltageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Band of one state as factors of the nominal voltage.
struct Band {
    state: VoltageState,
    lower: f64,
    upper: f64,
}

/// Top-down classification order.
const BANDS: [Band; 6] = [
    Band {
        state: VoltageState::CriticalHigh,
        lower: 1.06,
        upper: f64::INFINITY,
    },
    Band {
        state: VoltageState::PrecariousHigh,
        lower: 1.04,
        upper: 1.06,
    },
    Band {
        state: VoltageState::Normal,
        lower: 0.91,
        upper: 1.04,
    },
    Band {
        state: VoltageState::PrecariousLow,
        lower: 0.86,
        upper: 0.91,
    },
    Band {
        state: VoltageState::CriticalLow,
        lower: 0.5,
        upper: 0.86,
    },
    Band {
        state: VoltageState::PhaseDown,
        lower: f64::NEG_INFINITY,
        upper: 0.5,
    },
];

/// Classify `sample` for nominal voltage `nominal`, widening the band of
/// `current`. `None` for NaN.
///
/// Bands are matched from `CriticalHigh` down and the first match wins, so
/// only the widened lower bound of the current band has an effect: its
/// widened upper bound overlaps the band above, which is checked first.
/// A state is therefore held a little below its band and left as soon as
/// the sample reaches the band above.
pub fn classify(sample: f64, nominal: f64, current: VoltageState) -> Option<VoltageState> {
    BANDS.iter().find_map(|band| {
        let mut lower = band.lower * nominal;
        let mut upper = band.upper * nominal;
        if band.state == current {
            if lower.is_finite() {
                lower *= 1.0 - HYSTERESIS;
            }
            if upper.is_finite() {
                upper *= 1.0 + HYSTERESIS;
            }
        }
        let above = sample >= lower;
        let below = sample < upper || upper == f64::INFINITY;
        (above && below).then_some(band.state)
    })
}

/// `(previous, current)` pair recorded on every update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: VoltageState,
    pub current: VoltageState,
}

impl Transition {
    #[inline]
    pub fn is_change(&self) -> bool {
        self.previous != self.current
    }
}

/// State machine for one (device, phase).
#[derive(Debug, Clone)]
pub struct VoltageDebouncer {
    nominal: f64,
    capacity: usize,
    history: VecDeque<f64>,
    mean: f64,
    last_measurement: Option<f64>,
    current_state: VoltageState,
    last_transition: Option<Transition>,
}

impl VoltageDebouncer {
    /// Debouncer starting in `Normal` for nominal voltage `nominal`.
    pub fn new(nominal: f64) -> Self {
        Self::with_capacity(nominal, DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(nominal: f64, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            nominal,
            capacity,
            history: VecDeque::with_capacity(capacity),
            mean: 0.0,
            last_measurement: None,
            current_state: VoltageState::Normal,
            last_transition: None,
        }
    }

    /// Feed one sample.
    ///
    /// The instantaneous sample, not the mean, decides the state. A NaN
    /// sample is recorded but leaves the state unchanged.
    pub fn update(&mut self, sample: f64) -> Transition {
        if self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(sample);
        self.mean = self.history.iter().sum::<f64>() / self.history.len() as f64;
        self.last_measurement = Some(sample);

        let previous = self.current_state;
        let current = classify(sample, self.nominal, previous).unwrap_or(previous);
        let transition = Transition { previous, current };

        self.current_state = current;
        self.last_transition = Some(transition);
        transition
    }

    pub fn current_state(&self) -> VoltageState {
        self.current_state
    }

    /// Mean of the retained history.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn last_measurement(&self) -> Option<f64> {
        self.last_measurement
    }

    pub fn last_transition(&self) -> Option<Transition> {
        self.last_transition
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn nominal(&self) -> f64 {
        self.nominal
    }
}

/// Voltage phase of a three-phase installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    A,
    B,
    C,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::A => "a",
            Phase::B => "b",
            Phase::C => "c",
        }
    }

    /// Phase fed by a measurement field (`voltage_a` → `A`).
    pub fn from_field(field: &str) -> Option<Self> {
        match field {
            "voltage_a" => Some(Phase::A),
            "voltage_b" => Some(Phase::B),
            "voltage_c" => Some(Phase::C),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Debouncers per (device, phase), created on first sample.
#[derive(Debug)]
pub struct DebouncerRegistry {
    history_capacity: usize,
    instances: DashMap<(String, Phase), VoltageDebouncer>,
}

impl Default for DebouncerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl DebouncerRegistry {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            history_capacity,
            instances: DashMap::new(),
        }
    }

    /// Feed a sample and forward a state change to `events`.
    ///
    /// On a change the event of the previous state loses this phase, and a
    /// non-normal new state opens or continues its event with `sample`.
    pub async fn observe<S: EventSink + ?Sized>(
        &self,
        device_id: &str,
        phase: Phase,
        nominal: f64,
        sample: f64,
        events: &S,
    ) -> Transition {
        let transition = self
            .instances
            .entry((device_id.to_string(), phase))
            .or_insert_with(|| VoltageDebouncer::with_capacity(nominal, self.history_capacity))
            .update(sample);

        if !transition.is_change() {
            return transition;
        }

        info!(
            "Device {} phase {}: {} -> {} at {}",
            device_id, phase, transition.previous, transition.current, sample
        );
        if transition.previous != VoltageState::Normal {
            events.close_event(device_id, phase).await;
        }
        if transition.current != VoltageState::Normal {
            events
                .open_or_update_event(device_id, phase, transition.current, sample)
                .await;
        }
        transition
    }

    pub fn state(&self, device_id: &str, phase: Phase) -> Option<VoltageState> {
        self.instances
            .get(&(device_id.to_string(), phase))
            .map(|d| d.current_state())
    }

    /// Forget every debouncer of `device_id`.
    pub fn evict_device(&self, device_id: &str) {
        self.instances.retain(|(device, _), _| device != device_id);
        debug!("Debouncers of {} evicted", device_id);
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
