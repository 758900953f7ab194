use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use embedded_hal::digital::{self, ErrorKind, ErrorType, OutputPin, StatefulOutputPin};
use thiserror::Error;

/// udev fixes permissions on a freshly exported line asynchronously.
const EXPORT_SETTLE_ATTEMPTS: u32 = 10;
const EXPORT_SETTLE_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("gpio{line}: {source}")]
    Io { line: u32, source: io::Error },

    #[error("gpio{line}: unexpected value {value:?}")]
    BadValue { line: u32, value: String },
}

impl digital::Error for GpioError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

// ---------------------------------------------------------------------------
// SysfsPin
// ---------------------------------------------------------------------------

/// Output line driven through the legacy `/sys/class/gpio` interface.
#[derive(Debug)]
pub struct SysfsPin {
    line: u32,
    value_path: PathBuf,
}

impl SysfsPin {
    /// Export `line` (if needed) and configure it as an output starting at
    /// the given level. Writing `high`/`low` to `direction` sets direction and
    /// level in one step, so the relay never glitches on.
    ///
    /// Blocks the calling thread while the kernel finishes exporting the
    /// line; call it from `spawn_blocking` or `block_in_place` inside a runtime.
    pub fn open(root: &Path, line: u32, initial_high: bool) -> Result<Self, GpioError> {
        let dir = root.join(format!("gpio{line}"));
        let io_err = |source| GpioError::Io { line, source };

        if !dir.exists() {
            fs::write(root.join("export"), line.to_string()).map_err(io_err)?;
        }

        let direction = if initial_high { "high" } else { "low" };
        let mut attempt = 0;
        loop {
            match fs::write(dir.join("direction"), direction) {
                Ok(()) => break,
                Err(e) if attempt + 1 < EXPORT_SETTLE_ATTEMPTS => {
                    tracing::debug!(line, error = %e, "gpio not ready yet, retrying");
                    attempt += 1;
                    thread::sleep(EXPORT_SETTLE_DELAY);
                }
                Err(e) => return Err(io_err(e)),
            }
        }

        let mut pin = Self {
            line,
            value_path: dir.join("value"),
        };
        pin.write(initial_high)?;
        Ok(pin)
    }

    fn write(&mut self, high: bool) -> Result<(), GpioError> {
        fs::write(&self.value_path, if high { "1" } else { "0" })
            .map_err(|source| GpioError::Io { line: self.line, source })
    }

    fn read(&self) -> Result<bool, GpioError> {
        let raw = fs::read_to_string(&self.value_path)
            .map_err(|source| GpioError::Io { line: self.line, source })?;
        match raw.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(GpioError::BadValue {
                line: self.line,
                value: other.to_owned(),
            }),
        }
    }
}

impl ErrorType for SysfsPin {
    type Error = GpioError;
}

impl OutputPin for SysfsPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.write(false)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.write(true)
    }
}

impl StatefulOutputPin for SysfsPin {
    fn is_set_high(&mut self) -> Result<bool, Self::Error> {
        self.read()
    }

    fn is_set_low(&mut self) -> Result<bool, Self::Error> {
        self.read().map(|high| !high)
    }
}

// ---------------------------------------------------------------------------
// SimulatedPin
// ---------------------------------------------------------------------------

/// In-memory output. Clones share the same level, which lets a test hold a
/// handle to a pin that has been moved into a `RelayBank`.
#[derive(Debug, Clone)]
pub struct SimulatedPin {
    level: Arc<AtomicBool>,
}

impl SimulatedPin {
    pub fn new(initial_high: bool) -> Self {
        Self {
            level: Arc::new(AtomicBool::new(initial_high)),
        }
    }

    pub fn is_high(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }

    /// Change the level without going through the driver, as a stuck relay
    /// or a stray `raspi-gpio` call would.
    #[cfg(test)]
    pub fn force(&self, high: bool) {
        self.level.store(high, Ordering::SeqCst);
    }
}

impl ErrorType for SimulatedPin {
    type Error = GpioError;
}

impl OutputPin for SimulatedPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.level.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.level.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl StatefulOutputPin for SimulatedPin {
    fn is_set_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.is_high())
    }

    fn is_set_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.is_high())
    }
}
