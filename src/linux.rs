use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;

use linux_embedded_hal::serial_core::{
    BaudRate, CharSize, FlowControl, Parity, SerialDevice as _, SerialPortSettings as _,
    StopBits,
};
use linux_embedded_hal::sysfs_gpio::Direction;
use linux_embedded_hal::{Delay, Pin, Serial};

use crate::{Options, Programmer, ResetSequencer};

/// Programmer over a Linux TTY with sysfs GPIO invoke and reset lines
pub type LinuxProgrammer = Programmer<Serial, Delay, Pin, Pin, IoErrorKind>;

impl Programmer<Serial, Delay, Pin, Pin, IoErrorKind> {
    /// Create a new linux serial port programmer instance.
    ///
    /// The GPIO lines are only exported when pin based bootloader entry is
    /// in use.
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        invoke_pin: u64,
        reset_pin: u64,
        options: Options,
    ) -> anyhow::Result<Self> {
        // Open port
        let mut serial = Serial::open(port.as_ref())
            .with_context(|| format!("opening {}", port.as_ref().display()))?;

        // Apply settings, BSL UART is 8N1
        let mut settings = serial.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        serial.0.write_settings(&settings)?;

        // Reads return immediately so the poll loop owns the timing
        serial.0.set_timeout(Duration::from_millis(1))?;

        let invoke = Pin::new(invoke_pin);
        let reset = Pin::new(reset_pin);

        if !options.no_reset && !options.software_invoke {
            // Idle levels: invoke released, reset deasserted
            output(&invoke, Direction::Low)
                .with_context(|| format!("configuring invoke gpio {}", invoke_pin))?;
            output(&reset, Direction::High)
                .with_context(|| format!("configuring reset gpio {}", reset_pin))?;
        }

        // Return instance
        Ok(Self::new(
            serial,
            Delay {},
            ResetSequencer::new(invoke, reset),
            options,
        ))
    }
}

fn output(pin: &Pin, level: Direction) -> Result<(), linux_embedded_hal::sysfs_gpio::Error> {
    pin.0.export()?;
    pin.0.set_direction(level)
}
