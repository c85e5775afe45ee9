//! Host for shift-register controllers (LH79524 style)
//!
//! Command, response and data all squeeze through 16-bit FIFOs, and the bus
//! is only clocked between an explicit start and stop. Every exchange stops
//! the clock, loads the command, starts the clock and stops it again once the
//! card is done.

use bitflags::bitflags;
use embedded_hal::blocking::delay::DelayUs;

use super::{
    CMD_TIMEOUT_MS, DATA_TIMEOUT_MS, Host, HostCaps, IDENT_CLOCK_HZ, Registers, divider_shift,
};
use crate::command::{CmdDescriptor, CmdFlags, Response, crc7};
use crate::errors::{FailureClass, MmcError};
use crate::timing::{Counter, Delay, elapsed_ms, wait_for};

const CLOCK_CONTROL: usize = 0x00;
const STATUS: usize = 0x04;
const CLOCK_RATE: usize = 0x08;
const CMD_CONTROL: usize = 0x0c;
const BLOCK_LEN: usize = 0x10;
const NOB: usize = 0x14;
const EOI: usize = 0x18;
const CMD_FIFO: usize = 0x1c;
const RES_FIFO: usize = 0x20;
const DATA_FIFO: usize = 0x24;

const CLOCK_STOP: u32 = 1 << 0;
const CLOCK_START: u32 = 1 << 1;

/// Largest divider the rate register takes, as a shift
const MAX_RATE_SHIFT: u32 = 6;

/// Time the divider needs after a rate change
const RATE_SETTLE_US: u32 = 100;

const CLOCK_STOP_TIMEOUT_MS: u64 = 10;

bitflags! {
    /// STATUS register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        const READ_TIMEOUT = 1 << 0;
        const RESPONSE_TIMEOUT = 1 << 1;
        const CRC_READ = 1 << 3;
        const FIFO_EMPTY = 1 << 6;
        const CLOCK_STOPPED = 1 << 8;
        const DATA_DONE = 1 << 11;
        /// The card released DAT0 after a busy response
        const PROGRAM_DONE = 1 << 12;
        const END_CMD = 1 << 13;
    }

    /// CMD_CONTROL register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Control: u32 {
        const R48 = 1 << 0;
        const R136 = 1 << 1;
        const DATA_EN = 1 << 2;
        const WRITE = 1 << 3;
        const BUSY = 1 << 5;
        /// Send the 80 initialization clocks first
        const INITIALIZE = 1 << 6;
        const WIDE = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseConfig {
    /// Clock feeding the rate divider
    pub base_hz: u32,
    /// Bus clock once the card is identified
    pub operating_hz: u32,
    /// Halfwords pulled out of the data FIFO per status poll
    pub burst: usize,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            base_hz: 25_000_000,
            operating_hz: 25_000_000,
            burst: 8,
        }
    }
}

pub struct PulseHost<'a, R: Registers, C: Counter> {
    regs: R,
    timer: &'a C,
    caps: HostCaps,
    config: PulseConfig,
    /// Divider currently programmed, None until the first command
    rate_shift: Option<u32>,
    wide: bool,
}

impl<'a, R: Registers, C: Counter> PulseHost<'a, R, C> {
    pub fn new(regs: R, timer: &'a C, caps: HostCaps, config: PulseConfig) -> Self {
        regs.write(EOI, u32::MAX);

        Self {
            regs,
            timer,
            caps,
            config,
            rate_shift: None,
            wide: false,
        }
    }

    #[inline]
    fn status(&self) -> Status {
        Status::from_bits_retain(self.regs.read(STATUS))
    }

    fn stop_clock(&self) -> Result<(), MmcError> {
        self.regs.write(CLOCK_CONTROL, CLOCK_STOP);

        wait_for(self.timer, CLOCK_STOP_TIMEOUT_MS, || {
            self.status().contains(Status::CLOCK_STOPPED).then_some(())
        })
        .map_err(|_| MmcError::ControllerStuck {})
    }

    /// Only valid while the clock is stopped
    fn set_rate(&mut self, low_speed: bool) {
        let target_hz = match low_speed {
            true => IDENT_CLOCK_HZ,
            false => self.config.operating_hz,
        };
        let shift = divider_shift(self.config.base_hz, target_hz, MAX_RATE_SHIFT);

        if self.rate_shift == Some(shift) {
            return;
        }

        self.regs.write(CLOCK_RATE, shift);
        self.rate_shift = Some(shift);
        Delay::new(self.timer).delay_us(RATE_SETTLE_US);
    }

    fn control(&self, cmd: &CmdDescriptor) -> Control {
        let mut control = match cmd.response.len_bits() {
            0 => Control::empty(),
            136 => Control::R136,
            _ => Control::R48,
        };

        let data = cmd.flags.contains(CmdFlags::DATA);
        control.set(Control::DATA_EN, data);
        control.set(Control::WRITE, cmd.flags.contains(CmdFlags::WRITE));
        control.set(Control::BUSY, cmd.flags.contains(CmdFlags::BUSY));
        control.set(Control::INITIALIZE, cmd.index == 0);
        control.set(Control::WIDE, data && self.wide);
        control
    }

    fn exchange(
        &mut self,
        cmd: &CmdDescriptor,
        arg: u32,
        data: Option<&mut [u32]>,
    ) -> Result<Response, MmcError> {
        self.stop_clock()?;
        self.set_rate(cmd.flags.contains(CmdFlags::LOW_SPEED));

        self.regs.write(CMD_CONTROL, self.control(cmd).bits());

        if let Some(words) = &data {
            self.regs.write(BLOCK_LEN, (words.len() * 4) as u32);
            self.regs.write(NOB, 1);
        }

        for pair in cmd.frame(arg).chunks_exact(2) {
            self.regs
                .write(CMD_FIFO, u16::from_be_bytes([pair[0], pair[1]]) as u32);
        }

        let start_time = self.timer.get_counter();
        self.regs.write(CLOCK_CONTROL, CLOCK_START);

        let status = wait_for(self.timer, CMD_TIMEOUT_MS, || {
            let status = self.status();
            status
                .intersects(Status::END_CMD | Status::RESPONSE_TIMEOUT)
                .then_some(status)
        })
        .map_err(|e| MmcError::CmdTimeout {
            cmd: cmd.index,
            time_ms: e.time_ms,
        })?;

        if status.contains(Status::RESPONSE_TIMEOUT) {
            return Err(MmcError::CmdTimeout {
                cmd: cmd.index,
                time_ms: elapsed_ms(self.timer, start_time),
            });
        }

        let response = self.read_response(cmd)?;

        match data {
            Some(words) => self.read_data(cmd.index, words)?,
            None if cmd.flags.contains(CmdFlags::BUSY) => self.wait_ready(cmd.index)?,
            None => {}
        }

        Ok(response)
    }

    /// Wait for the card to stop holding DAT0 low after an R1b response
    fn wait_ready(&self, cmd: u8) -> Result<(), MmcError> {
        wait_for(self.timer, DATA_TIMEOUT_MS, || {
            self.status().contains(Status::PROGRAM_DONE).then_some(())
        })
        .map_err(|e| MmcError::DataTimeout {
            cmd,
            time_ms: e.time_ms,
        })
    }

    fn read_response(&self, cmd: &CmdDescriptor) -> Result<Response, MmcError> {
        let len = cmd.response.len_bits() / 8;

        if len == 0 {
            return Ok(Response::none());
        }

        // 136 bits do not fill the last halfword
        let mut frame = [0u8; 18];
        for pair in frame[..len.div_ceil(2) * 2].chunks_exact_mut(2) {
            pair.copy_from_slice(&(self.regs.read(RES_FIFO) as u16).to_be_bytes());
        }

        if len > 6 {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&frame[1..17]);
            return Ok(Response::long(bytes));
        }

        if cmd.response.is_checked() {
            if crc7(&frame[..5]) != frame[5] {
                return Err(MmcError::BadRxCrc7 { cmd: cmd.index });
            }

            if frame[0] & 0x3F != cmd.index {
                return Err(MmcError::WrongCmd { cmd: cmd.index });
            }
        }

        Ok(Response::short(u32::from_be_bytes([
            frame[1], frame[2], frame[3], frame[4],
        ])))
    }

    fn read_data(&self, cmd: u8, words: &mut [u32]) -> Result<(), MmcError> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(words);
        let start_time = self.timer.get_counter();
        let mut filled = 0;

        while filled < bytes.len() {
            let status = self.status();

            if status.contains(Status::READ_TIMEOUT) {
                return Err(MmcError::DataTimeout {
                    cmd,
                    time_ms: elapsed_ms(self.timer, start_time),
                });
            }

            if status.contains(Status::CRC_READ) {
                return Err(MmcError::BadDataCrc { cmd });
            }

            match self.pop_burst(&mut bytes[filled..]) {
                Ok(count) => filled += count,
                Err(e) if e.class() == FailureClass::TransientFifo => {
                    let time_ms = elapsed_ms(self.timer, start_time);

                    if time_ms > DATA_TIMEOUT_MS {
                        return Err(MmcError::DataTimeout { cmd, time_ms });
                    }

                    core::hint::spin_loop();
                }
                Err(e) => return Err(e),
            }
        }

        wait_for(self.timer, DATA_TIMEOUT_MS, || {
            self.status().contains(Status::DATA_DONE).then_some(())
        })
        .map_err(|e| MmcError::DataTimeout {
            cmd,
            time_ms: e.time_ms,
        })
    }

    /// Move up to one burst of halfwords out of the data FIFO. Each halfword
    /// carries two bytes of the stream, the earlier one in the low byte.
    fn pop_burst(&self, bytes: &mut [u8]) -> Result<usize, MmcError> {
        let mut count = 0;

        for pair in bytes.chunks_exact_mut(2).take(self.config.burst.max(1)) {
            if self.status().contains(Status::FIFO_EMPTY) {
                break;
            }

            pair.copy_from_slice(&(self.regs.read(DATA_FIFO) as u16).to_le_bytes());
            count += 2;
        }

        match count {
            0 => Err(MmcError::FifoNotReady {}),
            count => Ok(count),
        }
    }
}

impl<R: Registers, C: Counter> Host for PulseHost<'_, R, C> {
    fn transfer(
        &mut self,
        cmd: &CmdDescriptor,
        arg: u32,
        data: Option<&mut [u32]>,
    ) -> Result<Response, MmcError> {
        let result = self.exchange(cmd, arg, data);

        // Idle bus and nothing latched for the next command
        let stopped = self.stop_clock();
        self.regs.write(EOI, u32::MAX);

        let response = result?;
        stopped?;

        Ok(response)
    }

    fn set_bus_width(&mut self, wide: bool) {
        self.wide = wide;
    }

    fn caps(&self) -> &HostCaps {
        &self.caps
    }
}
