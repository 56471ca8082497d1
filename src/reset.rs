//! Bootloader entry.
//!
//! The MSPM0 boot ROM samples the BSL invoke pin on reset, so invoke is
//! asserted, reset is pulsed and invoke stays asserted while the BSL starts.
//! Invoke is released afterwards so later resets boot the application.

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::OutputPin;

use crate::protocol::SOFTWARE_INVOKE;
use crate::transport::{send, Transport};
use crate::{Error, Options};

/// Drives the invoke and reset lines of the target
pub struct ResetSequencer<I, R> {
    invoke: I,
    reset: R,
}

impl<I, R> ResetSequencer<I, R>
where
    I: OutputPin,
    R: OutputPin,
    I::Error: Debug,
    R::Error: Debug,
{
    pub fn new(invoke: I, reset: R) -> Self {
        Self { invoke, reset }
    }

    /// Run the entry sequence once
    pub fn enter_bootloader<D, E>(&mut self, delay: &mut D, options: &Options) -> Result<(), Error<E>>
    where
        D: DelayMs<u32>,
    {
        debug!("Asserting BSL invoke");
        self.invoke.set_high().map_err(gpio_err::<_, E>)?;
        delay.delay_ms(options.invoke_hold_ms);

        debug!("Pulsing reset");
        self.reset.set_low().map_err(gpio_err::<_, E>)?;
        delay.delay_ms(options.reset_pulse_ms);
        self.reset.set_high().map_err(gpio_err::<_, E>)?;

        // Boot ROM samples invoke here, hold it until the BSL is listening
        delay.delay_ms(options.invoke_hold_ms);

        debug!("Releasing BSL invoke");
        self.invoke.set_low().map_err(gpio_err::<_, E>)?;

        Ok(())
    }

    /// Return the pins
    pub fn release(self) -> (I, R) {
        (self.invoke, self.reset)
    }
}

fn gpio_err<G: Debug, E>(e: G) -> Error<E> {
    Error::Gpio(format!("{:?}", e))
}

/// Ask a running application to reboot into the BSL over the serial link
pub fn software_invoke<P, D, E>(port: &mut P, delay: &mut D, options: &Options) -> Result<(), Error<E>>
where
    P: Transport<E>,
    D: DelayMs<u32>,
{
    debug!("Sending software invoke (0x{:02x})", SOFTWARE_INVOKE);
    send(port, &[SOFTWARE_INVOKE])?;

    debug!("Waiting {} ms for BSL entry", options.software_invoke_wait_ms);
    delay.delay_ms(options.software_invoke_wait_ms);

    Ok(())
}
