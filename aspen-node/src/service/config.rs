use localtime::LocalDuration;

/// Tree-protocol configuration.
///
/// Defaults match this protocol's constants; tests and simulators
/// typically override them to run on a compressed timescale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// How often a root re-broadcasts its own announcement.
    pub announcement_interval: LocalDuration,
    /// How long since receipt before a stored announcement is considered
    /// stale and ignored by the parent selector.
    pub announcement_timeout: LocalDuration,
    /// Anti-flap hysteresis window after a parent regression.
    pub reparent_wait: LocalDuration,
}

impl Default for Config {
    fn default() -> Self {
        let announcement_interval = LocalDuration::from_mins(15);

        Self {
            announcement_interval,
            announcement_timeout: announcement_interval + announcement_interval,
            reparent_wait: LocalDuration::from_secs(1),
        }
    }
}

impl Config {
    /// A configuration suited to tests and simulators: the same timeout
    /// ratio as [`Default`], scaled down to milliseconds.
    pub fn fast() -> Self {
        let announcement_interval = LocalDuration::from_millis(50);

        Self {
            announcement_interval,
            announcement_timeout: announcement_interval + announcement_interval,
            reparent_wait: LocalDuration::from_millis(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_protocol_constants() {
        let config = Config::default();

        assert_eq!(config.announcement_interval, LocalDuration::from_mins(15));
        assert_eq!(config.announcement_timeout, LocalDuration::from_mins(30));
        assert_eq!(config.reparent_wait, LocalDuration::from_secs(1));
    }
}
