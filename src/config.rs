//! Run-time settings, loaded from a JSON file.
//!
//! Every field has a default, so a file only needs the keys it changes:
//!
//! ```json
//! { "lives": 5, "extra_life_at": 1000 }
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::EmulatorError;

pub const DEFAULT_CLOCK_HZ: u64 = 2_000_000;
/// Half of a 60 Hz frame.
pub const DEFAULT_INTERRUPT_INTERVAL_NS: u64 = 8_333_333;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub clock_hz: u64,
    pub interrupt_interval_ns: u64,
    /// Ships per game, 3 to 6.
    pub lives: u8,
    /// Score awarding the bonus ship, 1000 or 1500.
    pub extra_life_at: u16,
    /// Hide the coin info on the demo screen.
    pub coin_info: bool,
    /// Refuse undocumented encodings instead of running their aliases.
    pub strict_opcodes: bool,
    /// Largest lag behind real time the throttle will try to win back.
    pub catch_up_limit_ns: u64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        EmulatorConfig {
            clock_hz: DEFAULT_CLOCK_HZ,
            interrupt_interval_ns: DEFAULT_INTERRUPT_INTERVAL_NS,
            lives: 3,
            extra_life_at: 1500,
            coin_info: false,
            strict_opcodes: false,
            catch_up_limit_ns: DEFAULT_INTERRUPT_INTERVAL_NS,
        }
    }
}

impl EmulatorConfig {
    pub fn validate(&self) -> Result<(), EmulatorError> {
        if self.clock_hz == 0 {
            return Err(EmulatorError::Config("clock_hz must be positive".to_string()));
        }
        if self.interrupt_interval_ns == 0 {
            return Err(EmulatorError::Config(
                "interrupt_interval_ns must be positive".to_string(),
            ));
        }
        if !(3..=6).contains(&self.lives) {
            return Err(EmulatorError::Config(format!(
                "lives must be between 3 and 6, got {}",
                self.lives
            )));
        }
        if self.extra_life_at != 1000 && self.extra_life_at != 1500 {
            return Err(EmulatorError::Config(format!(
                "extra_life_at must be 1000 or 1500, got {}",
                self.extra_life_at
            )));
        }
        Ok(())
    }

    /// Parse and validate a settings file.
    pub fn load(path: &Path) -> Result<Self, EmulatorError> {
        let text = fs::read_to_string(path)?;
        let config: EmulatorConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load), but any failure is logged and the defaults
    /// are used instead. The emulator always starts.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => {
                info!("loaded settings from {}", path.display());
                config
            }
            Err(err) => {
                warn!(
                    "could not use settings from {}: {}; defaulting to 3 lives, extra at 1500",
                    path.display(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Pack the DIP switch settings into the bits of input port 2.
    pub fn dip_switches(&self) -> u8 {
        let mut bits = self.lives.saturating_sub(3) & 0x03;
        if self.extra_life_at == 1000 {
            bits |= 1 << 3;
        }
        if self.coin_info {
            bits |= 1 << 7;
        }
        bits
    }

    pub fn ns_per_cycle(&self) -> u64 {
        1_000_000_000 / self.clock_hz.max(1)
    }

    pub fn interrupt_interval(&self) -> Duration {
        Duration::from_nanos(self.interrupt_interval_ns)
    }

    pub fn catch_up_limit(&self) -> Duration {
        Duration::from_nanos(self.catch_up_limit_ns)
    }
}
