use tracing::{Level, level_filters::LevelFilter};

/// Logging verbosity carried by a loaded model.
///
/// A quiet model only reports warnings and errors, a verbose one also reports
/// informational messages. The value is passed down explicitly instead of
/// changing any process wide logger state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verbosity(LevelFilter);

impl Verbosity {
    /// Warnings and errors only.
    pub const QUIET: Self = Self(LevelFilter::WARN);
    /// Informational messages included.
    pub const VERBOSE: Self = Self(LevelFilter::INFO);

    /// Maps the `verbose` flag of the loader.
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose { Self::VERBOSE } else { Self::QUIET }
    }

    /// Whether a message at `level` should be emitted.
    pub fn enabled(&self, level: Level) -> bool {
        self.0 >= level
    }

    /// Max level, e.g. for configuring a subscriber.
    pub fn level_filter(&self) -> LevelFilter {
        self.0
    }
}

impl Default for Verbosity {
    fn default() -> Self {
        Self::QUIET
    }
}

/// `tracing::info!` gated by a [`Verbosity`].
macro_rules! verbose_info {
    ($verbosity:expr, $($arg:tt)+) => {
        if $verbosity.enabled(::tracing::Level::INFO) {
            ::tracing::info!($($arg)+);
        }
    };
}

pub(crate) use verbose_info;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_suppresses_info() {
        let verbosity = Verbosity::from_verbose(false);
        assert!(!verbosity.enabled(Level::INFO));
        assert!(!verbosity.enabled(Level::DEBUG));
        assert!(verbosity.enabled(Level::WARN));
        assert!(verbosity.enabled(Level::ERROR));
        assert_eq!(verbosity.level_filter(), LevelFilter::WARN);
    }

    #[test]
    fn test_verbose_keeps_info() {
        let verbosity = Verbosity::from_verbose(true);
        assert!(verbosity.enabled(Level::INFO));
        assert!(verbosity.enabled(Level::WARN));
        assert!(!verbosity.enabled(Level::DEBUG));
    }
}
