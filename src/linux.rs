
use linux_embedded_hal::i2cdev::linux::LinuxI2CError;
use linux_embedded_hal::{Delay, I2cdev};

use crate::{Device, Error, Options};

impl Device<I2cdev, Delay, LinuxI2CError> {
    /// Connect to a bootloader on linux I2C bus `/dev/i2c-<bus>`
    pub fn linux(bus: u32, address: u8, options: Options) -> Result<Self, Error<LinuxI2CError>> {
        let path = format!("/dev/i2c-{}", bus);

        debug!("Opening I2C bus {}", path);

        // Open bus
        let i2c = I2cdev::new(&path).map_err(|error| Error::BusOpenFailed { bus, error })?;

        // Return instance
        Self::open(i2c, Delay {}, address, options)
    }
}
