use crate::common::{DomainError, DomainResult};
use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Minute of the day, serialized as `"HH:MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn new(hour: u16, minute: u16) -> DomainResult<Self> {
        if hour > 24 || minute > 59 || (hour == 24 && minute != 0) {
            return Err(DomainError::InvalidSchedule {
                reason: format!("{hour:02}:{minute:02} is not a time of day"),
            });
        }
        Ok(Self(hour * 60 + minute))
    }

    /// Infallible constructor for literals; out-of-range parts wrap.
    pub const fn at(hour: u16, minute: u16) -> Self {
        Self((hour % 24) * 60 + minute % 60)
    }

    pub fn midnight() -> Self {
        Self(0)
    }

    pub fn minutes(&self) -> u16 {
        self.0
    }

    pub fn from_time(time: NaiveTime) -> Self {
        Self((time.hour() * 60 + time.minute()) as u16)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl std::str::FromStr for TimeOfDay {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DomainError::InvalidSchedule {
            reason: format!("expected HH:MM, got {s:?}"),
        };
        let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hour = h.parse().map_err(|_| invalid())?;
        let minute = m.parse().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Limits in force while a window is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowLimits {
    pub memory_ceiling_bytes: u64,
    pub max_workers: usize,
    pub allow_hyperthreading: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub label: String,
    /// Inclusive start.
    pub start: TimeOfDay,
    /// Exclusive end. An end at or before the start wraps past midnight.
    pub end: TimeOfDay,
    #[serde(flatten)]
    pub limits: WindowLimits,
}

impl ScheduleWindow {
    fn contains(&self, minute: u16) -> bool {
        let (s, e) = (self.start.minutes(), self.end.minutes());
        if s < e {
            minute >= s && minute < e
        } else {
            minute >= s || minute < e
        }
    }

    /// Non-wrapping `[start, end)` minute spans covered by this window.
    fn spans(&self) -> Vec<(u16, u16)> {
        let (s, e) = (self.start.minutes(), self.end.minutes());
        if s < e {
            vec![(s, e)]
        } else {
            let mut spans = vec![(s, MINUTES_PER_DAY)];
            if e > 0 {
                spans.push((0, e));
            }
            spans
        }
    }
}

/// The window (or override tier) that governs resources at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveWindow {
    pub label: String,
    pub limits: WindowLimits,
    pub emergency: bool,
}

/// Time-of-day memory/worker schedule with an optional emergency tier.
///
/// Windows must partition the day. The emergency tier, when present and
/// switched on, replaces whichever window is current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSchedule {
    pub windows: Vec<ScheduleWindow>,
    /// Below this per-worker grant, workers are shut down instead of squeezed.
    pub min_memory_per_worker_bytes: u64,
    #[serde(default)]
    pub emergency: Option<WindowLimits>,
    #[serde(default)]
    pub emergency_active: bool,
}

impl ResourceSchedule {
    pub fn new(windows: Vec<ScheduleWindow>, min_memory_per_worker_bytes: u64) -> DomainResult<Self> {
        let schedule = Self {
            windows,
            min_memory_per_worker_bytes,
            emergency: None,
            emergency_active: false,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    /// One window covering the whole day.
    pub fn uniform(limits: WindowLimits, min_memory_per_worker_bytes: u64) -> Self {
        Self {
            windows: vec![ScheduleWindow {
                label: "all-day".to_string(),
                start: TimeOfDay::midnight(),
                end: TimeOfDay::midnight(),
                limits,
            }],
            min_memory_per_worker_bytes,
            emergency: None,
            emergency_active: false,
        }
    }

    /// Day/night split: `day` covers `[day_start, night_start)`, `night` the rest.
    pub fn day_night(
        day_start: TimeOfDay,
        night_start: TimeOfDay,
        day: WindowLimits,
        night: WindowLimits,
        min_memory_per_worker_bytes: u64,
    ) -> DomainResult<Self> {
        Self::new(
            vec![
                ScheduleWindow {
                    label: "day".to_string(),
                    start: day_start,
                    end: night_start,
                    limits: day,
                },
                ScheduleWindow {
                    label: "night".to_string(),
                    start: night_start,
                    end: day_start,
                    limits: night,
                },
            ],
            min_memory_per_worker_bytes,
        )
    }

    pub fn with_emergency(mut self, limits: WindowLimits) -> Self {
        self.emergency = Some(limits);
        self
    }

    /// Check that the windows cover every minute of the day exactly once.
    pub fn validate(&self) -> DomainResult<()> {
        if self.windows.is_empty() {
            return Err(DomainError::InvalidSchedule {
                reason: "schedule has no windows".to_string(),
            });
        }
        let mut spans: Vec<(u16, u16, &str)> = self
            .windows
            .iter()
            .flat_map(|w| w.spans().into_iter().map(move |(s, e)| (s, e, w.label.as_str())))
            .collect();
        spans.sort_by_key(|(s, _, _)| *s);

        let mut cursor = 0u16;
        for (start, end, label) in spans {
            if start > cursor {
                return Err(DomainError::InvalidSchedule {
                    reason: format!(
                        "gap between {} and {}",
                        TimeOfDay(cursor),
                        TimeOfDay(start)
                    ),
                });
            }
            if start < cursor {
                return Err(DomainError::InvalidSchedule {
                    reason: format!("window {label} overlaps at {}", TimeOfDay(start)),
                });
            }
            cursor = end;
        }
        if cursor != MINUTES_PER_DAY {
            return Err(DomainError::InvalidSchedule {
                reason: format!("gap between {} and 24:00", TimeOfDay(cursor)),
            });
        }
        Ok(())
    }

    /// Window containing `at`. Pure function of the time of day.
    pub fn window_at(&self, at: TimeOfDay) -> Option<&ScheduleWindow> {
        self.windows.iter().find(|w| w.contains(at.minutes()))
    }

    pub fn active_at(&self, at: TimeOfDay) -> Option<ActiveWindow> {
        if self.emergency_active {
            if let Some(limits) = &self.emergency {
                return Some(ActiveWindow {
                    label: "emergency".to_string(),
                    limits: limits.clone(),
                    emergency: true,
                });
            }
        }
        self.window_at(at).map(|w| ActiveWindow {
            label: w.label.clone(),
            limits: w.limits.clone(),
            emergency: false,
        })
    }

    /// First window boundary strictly after `at`, wrapping to the next day.
    pub fn next_boundary_after(&self, at: TimeOfDay) -> TimeOfDay {
        let now = at.minutes();
        self.windows
            .iter()
            .flat_map(|w| [w.start.minutes(), w.end.minutes()])
            .map(|b| {
                let ahead = (b + MINUTES_PER_DAY - now) % MINUTES_PER_DAY;
                (if ahead == 0 { MINUTES_PER_DAY } else { ahead }, b)
            })
            .min_by_key(|(ahead, _)| *ahead)
            .map(|(_, b)| TimeOfDay(b % MINUTES_PER_DAY))
            .unwrap_or(at)
    }
}
