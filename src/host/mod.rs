//! Host controller transports
//!
//! A [`Host`] puts exactly one command on the bus and collects what comes
//! back. Both realizations in here sit behind the same trait, and the driver is
//! generic over it, so the controller is picked when the firmware is built.

pub mod esdhc;
pub mod pulse;

#[cfg(test)]
pub(crate) mod sim;

use core::ptr::{read_volatile, write_volatile};

use crate::command::{CmdDescriptor, CmdFlags, MmcCmd, Response};
use crate::errors::MmcError;
use crate::registers::OCR_VDD_27_36;

/// Longest a command may take to complete, in milliseconds
pub const CMD_TIMEOUT_MS: u64 = 300;

/// Longest a data block may take to arrive, in milliseconds
pub const DATA_TIMEOUT_MS: u64 = 300;

/// Identification clock rate
pub const IDENT_CLOCK_HZ: u32 = 400_000;

/// What the board can do, handed to a host once when it is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCaps {
    /// OCR voltage window bits the board can supply
    pub voltages: u32,
    /// The board routes DAT1-DAT3 and can run a 4-bit bus
    pub wide_bus: bool,
}

impl Default for HostCaps {
    fn default() -> Self {
        Self {
            voltages: OCR_VDD_27_36,
            wide_bus: false,
        }
    }
}

pub trait Host {
    /// Perform a single exchange on the bus.
    ///
    /// Picks the clock rate from [`CmdFlags::LOW_SPEED`], sends the command,
    /// waits for the response under [`CMD_TIMEOUT_MS`] and, for
    /// [`CmdFlags::DATA`] commands, fills `data` from the card. Status flags
    /// are cleared again before returning, whatever the outcome.
    fn transfer(
        &mut self,
        cmd: &CmdDescriptor,
        arg: u32,
        data: Option<&mut [u32]>,
    ) -> Result<Response, MmcError>;

    /// Switch the host side of the data bus between 1 and 4 bits
    fn set_bus_width(&mut self, wide: bool);

    fn caps(&self) -> &HostCaps;

    /// Execute `cmd`, sending APP_CMD with `rca` right before it when it is an
    /// application command.
    fn execute(
        &mut self,
        cmd: MmcCmd,
        rca: u16,
        data: Option<&mut [u32]>,
    ) -> Result<Response, MmcError> {
        let descriptor = cmd.descriptor();

        if descriptor.is_app() {
            let app_cmd = MmcCmd::AppCmd(rca);
            let mut prefix = app_cmd.descriptor();
            // APP_CMD runs at whatever speed the command it guards needs
            prefix.flags.set(
                CmdFlags::LOW_SPEED,
                descriptor.flags.contains(CmdFlags::LOW_SPEED),
            );

            self.transfer(&prefix, app_cmd.argument(), None)?;
        }

        self.transfer(&descriptor, cmd.argument(), data)
    }
}

/// Word-wide register access by byte offset
pub trait Registers {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);

    #[inline]
    fn modify<F: FnOnce(u32) -> u32>(&self, offset: usize, f: F) {
        let value = self.read(offset);
        self.write(offset, f(value));
    }
}

impl<R: Registers> Registers for &R {
    fn read(&self, offset: usize) -> u32 {
        (**self).read(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        (**self).write(offset, value)
    }
}

/// Memory-mapped register block
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// # Safety
    ///
    /// `base` must be the address of the controller's register block, and
    /// nothing else may drive that block while this value exists.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

impl Registers for Mmio {
    #[inline]
    fn read(&self, offset: usize) -> u32 {
        // SAFETY: `new` requires base to be a valid register block
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn write(&self, offset: usize, value: u32) {
        // SAFETY: `new` requires base to be a valid register block
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }
}

/// Smallest power-of-two divider of `base_hz` that lands at or under
/// `target_hz`, as a shift count
pub(crate) fn divider_shift(base_hz: u32, target_hz: u32, max_shift: u32) -> u32 {
    let mut shift = 0;

    while shift < max_shift && (base_hz >> shift) > target_hz {
        shift += 1;
    }

    shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ResponseFormat;
    use crate::host::sim::{SimCard, SimHost};

    #[test]
    fn acmd_gets_app_cmd_first() {
        let mut host = SimHost::new(SimCard::sd(), HostCaps::default());

        host.execute(MmcCmd::SdSendOpCond(0), 0x1234, None).unwrap();

        assert_eq!(host.log.len(), 2);
        assert_eq!(host.log[0].index, 55);
        assert_eq!(host.log[0].arg, 0x1234_0000);
        assert!(host.log[0].low_speed);
        assert_eq!(host.log[1].index, 41);
        assert!(host.log[1].app);
    }

    #[test]
    fn plain_command_goes_alone() {
        let mut host = SimHost::new(SimCard::sd(), HostCaps::default());

        host.execute(MmcCmd::GoIdleState, 0, None).unwrap();

        assert_eq!(host.log.len(), 1);
        assert_eq!(host.log[0].index, 0);
        assert_eq!(MmcCmd::GoIdleState.descriptor().response, ResponseFormat::None);
    }

    #[test]
    fn failed_prefix_stops_the_command() {
        let mut host = SimHost::new(SimCard::empty(), HostCaps::default());

        let err = host.execute(MmcCmd::SdSendOpCond(0), 0, None).unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(host.log.len(), 1);
        assert_eq!(host.log[0].index, 55);
    }

    #[test]
    fn divider_never_overshoots() {
        assert_eq!(divider_shift(50_000_000, IDENT_CLOCK_HZ, 8), 7);
        assert_eq!(divider_shift(50_000_000, 25_000_000, 8), 1);
        assert_eq!(divider_shift(50_000_000, 100_000_000, 8), 0);
        assert_eq!(divider_shift(u32::MAX, 1, 6), 6);
    }
}
