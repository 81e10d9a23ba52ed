//! Warn/kill timeout pair with sentinel resolution.

use std::time::Duration;

/// Default period between liveness warnings for a running command.
pub const DEFAULT_WARN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default deadline after which a running command is forcibly killed.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Effectively-infinite timeout used for unlimited settings.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Timeout knob as supplied by task configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimeoutSetting {
    /// Fall back to the built-in default.
    #[default]
    Default,
    /// Effectively disable the timer.
    Unlimited,
    /// Fire after the given duration. A zero duration behaves like
    /// [`Default`](Self::Default).
    After(Duration),
}

impl TimeoutSetting {
    fn resolve(self, default: Duration) -> Duration {
        match self {
            Self::Default => default,
            Self::Unlimited => MAX_TIMEOUT,
            Self::After(duration) if duration.is_zero() => default,
            Self::After(duration) => duration,
        }
    }
}

/// Warn and kill timeouts for one command execution.
///
/// The kill deadline is kept off the warn ticker's grid: when it lands on an
/// exact multiple of the warn period it is pulled back by one second, so the
/// final warning cannot race the kill message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    warn: Duration,
    kill: Duration,
}

impl Timeouts {
    /// Resolves both settings and applies the anti-race adjustment.
    #[must_use]
    pub fn new(warn: TimeoutSetting, kill: TimeoutSetting) -> Self {
        let mut timeouts = Self {
            warn: warn.resolve(DEFAULT_WARN_TIMEOUT),
            kill: kill.resolve(DEFAULT_KILL_TIMEOUT),
        };
        timeouts.adjust();
        timeouts
    }

    /// Period between liveness warnings.
    #[must_use]
    pub fn warn(&self) -> Duration {
        self.warn
    }

    /// Deadline after which the command is forcibly killed.
    #[must_use]
    pub fn kill(&self) -> Duration {
        self.kill
    }

    /// Replaces the warn period.
    pub fn set_warn(&mut self, setting: TimeoutSetting) {
        self.warn = setting.resolve(DEFAULT_WARN_TIMEOUT);
        self.adjust();
    }

    /// Replaces the kill deadline.
    pub fn set_kill(&mut self, setting: TimeoutSetting) {
        self.kill = setting.resolve(DEFAULT_KILL_TIMEOUT);
        self.adjust();
    }

    fn adjust(&mut self) {
        // Sub-second deadlines stay exact; they cannot afford the pull-back.
        if self.kill > Duration::from_secs(1) && self.kill.as_nanos() % self.warn.as_nanos() == 0 {
            self.kill -= Duration::from_secs(1);
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::new(TimeoutSetting::Default, TimeoutSetting::Default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pull_the_kill_deadline_off_the_warn_grid() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.warn(), Duration::from_secs(300));
        assert_eq!(timeouts.kill(), Duration::from_secs(899));
    }

    #[test]
    fn exact_multiples_are_adjusted() {
        let timeouts = Timeouts::new(
            TimeoutSetting::After(Duration::from_secs(120)),
            TimeoutSetting::After(Duration::from_secs(600)),
        );
        assert_eq!(timeouts.kill(), Duration::from_secs(599));
        assert_ne!(timeouts.kill().as_nanos() % timeouts.warn().as_nanos(), 0);
    }

    #[test]
    fn non_multiples_are_untouched() {
        let timeouts = Timeouts::new(
            TimeoutSetting::After(Duration::from_secs(120)),
            TimeoutSetting::After(Duration::from_secs(601)),
        );
        assert_eq!(timeouts.kill(), Duration::from_secs(601));
    }

    #[test]
    fn sub_second_pairs_stay_exact() {
        let timeouts = Timeouts::new(
            TimeoutSetting::After(Duration::from_millis(50)),
            TimeoutSetting::After(Duration::from_millis(150)),
        );
        assert_eq!(timeouts.warn(), Duration::from_millis(50));
        assert_eq!(timeouts.kill(), Duration::from_millis(150));
    }

    #[test]
    fn zero_behaves_like_default() {
        let timeouts = Timeouts::new(
            TimeoutSetting::After(Duration::ZERO),
            TimeoutSetting::After(Duration::ZERO),
        );
        assert_eq!(timeouts, Timeouts::default());
    }

    #[test]
    fn unlimited_resolves_to_a_year() {
        let timeouts = Timeouts::new(TimeoutSetting::Default, TimeoutSetting::Unlimited);
        assert_eq!(timeouts.kill(), MAX_TIMEOUT);
    }

    #[test]
    fn setters_reapply_the_adjustment() {
        let mut timeouts = Timeouts::new(
            TimeoutSetting::After(Duration::from_secs(7)),
            TimeoutSetting::After(Duration::from_secs(100)),
        );
        assert_eq!(timeouts.kill(), Duration::from_secs(100));
        timeouts.set_warn(TimeoutSetting::After(Duration::from_secs(10)));
        assert_eq!(timeouts.kill(), Duration::from_secs(99));
    }
}
