use strum_macros::Display;
use tracing::debug;

/// The four output lines wired into the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Rail {
    #[strum(to_string = "power")]
    Power,
    #[strum(to_string = "button")]
    Button,
    /// Fakes the paper-presence sensor so the feeder pulls a sheet
    #[strum(to_string = "paper")]
    Paper,
    #[strum(to_string = "motor-wake")]
    MotorWake,
}

impl Rail {
    pub const ALL: [Rail; 4] = [Rail::Power, Rail::Button, Rail::Paper, Rail::MotorWake];
}

/// Output capability over the rail set. Only the state machine holds one.
pub trait Rails: Send + 'static {
    fn set(&mut self, rail: Rail, on: bool);

    fn all_off(&mut self) {
        for rail in Rail::ALL {
            self.set(rail, false);
        }
    }
}

/// Rails that only log; used when the scanner is emulated.
#[derive(Debug, Default)]
pub struct LoggingRails;

impl Rails for LoggingRails {
    fn set(&mut self, rail: Rail, on: bool) {
        debug!(%rail, on, "Rail");
    }
}

#[cfg(feature = "rpi")]
pub use self::rpi::GpioRails;

#[cfg(feature = "rpi")]
mod rpi {
    use super::{Rail, Rails};
    use crate::config::GpioConfig;
    use crate::error::ScanError;
    use rppal::gpio::{Gpio, Level, OutputPin};
    use tracing::{debug, info};

    /// Raspberry Pi GPIO rails (BCM numbering).
    pub struct GpioRails {
        power: OutputPin,
        button: OutputPin,
        paper: OutputPin,
        motor_wake: OutputPin,
    }

    impl GpioRails {
        pub fn init(pins: &GpioConfig) -> Result<Self, ScanError> {
            info!(
                power = pins.power,
                button = pins.button,
                paper = pins.paper,
                motor_wake = pins.motor_wake,
                "Initializing GPIO"
            );
            let gpio = Gpio::new()?;
            Ok(Self {
                power: gpio.get(pins.power)?.into_output_low(),
                button: gpio.get(pins.button)?.into_output_low(),
                paper: gpio.get(pins.paper)?.into_output_low(),
                motor_wake: gpio.get(pins.motor_wake)?.into_output_low(),
            })
        }

        fn pin(&mut self, rail: Rail) -> &mut OutputPin {
            match rail {
                Rail::Power => &mut self.power,
                Rail::Button => &mut self.button,
                Rail::Paper => &mut self.paper,
                Rail::MotorWake => &mut self.motor_wake,
            }
        }
    }

    impl Rails for GpioRails {
        fn set(&mut self, rail: Rail, on: bool) {
            debug!(%rail, on, "GPIO");
            self.pin(rail).write(if on { Level::High } else { Level::Low });
        }
    }
}
