//! Host for command-engine controllers (i.MX eSDHC style)
//!
//! The argument and a packed transfer type word are written once, completion
//! shows up in the interrupt status register, and data moves through a 32-bit
//! data port. Interrupts stay masked; status is only ever polled.

use bitflags::bitflags;
use embedded_hal::blocking::delay::DelayUs;

use super::{
    CMD_TIMEOUT_MS, DATA_TIMEOUT_MS, Host, HostCaps, IDENT_CLOCK_HZ, Registers, divider_shift,
};
use crate::command::{CmdDescriptor, CmdFlags, Response, ResponseFormat};
use crate::errors::{FailureClass, MmcError};
use crate::timing::{Counter, Delay, elapsed_ms, wait_for};

const BLKATTR: usize = 0x04;
const CMDARG: usize = 0x08;
const XFERTYP: usize = 0x0c;
const CMDRSP0: usize = 0x10;
const CMDRSP1: usize = 0x14;
const CMDRSP2: usize = 0x18;
const CMDRSP3: usize = 0x1c;
const DATPORT: usize = 0x20;
const PRSSTAT: usize = 0x24;
const PROCTL: usize = 0x28;
const SYSCTL: usize = 0x2c;
const IRQSTAT: usize = 0x30;
const IRQSTATEN: usize = 0x34;
const IRQSIGEN: usize = 0x38;
const WML: usize = 0x44;

const PRSSTAT_CIHB: u32 = 1 << 0;
const PRSSTAT_CDIHB: u32 = 1 << 1;
const PRSSTAT_SDSTB: u32 = 1 << 3;

const PROCTL_DTW_MASK: u32 = 0b11 << 1;
const PROCTL_DTW_4BIT: u32 = 0b01 << 1;

const SYSCTL_SDCLKEN: u32 = 1 << 3;
const SYSCTL_DVS_SHIFT: u32 = 4;
const SYSCTL_SDCLKFS_SHIFT: u32 = 8;
const SYSCTL_DTOCV_SHIFT: u32 = 16;
const SYSCTL_CLOCK_MASK: u32 = 0x000F_FFF0;
const SYSCTL_RSTA: u32 = 1 << 24;
const SYSCTL_RSTC: u32 = 1 << 25;
const SYSCTL_RSTD: u32 = 1 << 26;
const SYSCTL_INITA: u32 = 1 << 27;

/// Longest data timeout counter the controller offers
const DTOCV_MAX: u32 = 0xE;

const XFERTYP_CMDINX_SHIFT: u32 = 24;
const XFERTYP_DPSEL: u32 = 1 << 21;
const XFERTYP_CICEN: u32 = 1 << 20;
const XFERTYP_CCCEN: u32 = 1 << 19;
const XFERTYP_RSP_136: u32 = 0b01 << 16;
const XFERTYP_RSP_48: u32 = 0b10 << 16;
const XFERTYP_RSP_48_BUSY: u32 = 0b11 << 16;
const XFERTYP_DTDSEL: u32 = 1 << 4;

/// Time the card clock needs after it is switched back on
const CLOCK_SETTLE_US: u32 = 100;

/// Time allowed for resets, initialization clocks and divider changes
const SETTLE_TIMEOUT_MS: u64 = 100;

bitflags! {
    /// IRQSTAT register, write one to clear
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Irq: u32 {
        const CC = 1 << 0;
        const TC = 1 << 1;
        const BWR = 1 << 4;
        const BRR = 1 << 5;
        const CTOE = 1 << 16;
        const CCE = 1 << 17;
        const CEBE = 1 << 18;
        const CIE = 1 << 19;
        const DTOE = 1 << 20;
        const DCE = 1 << 21;
        const DEBE = 1 << 22;

        const CMD_ERRORS =
            Self::CTOE.bits() | Self::CCE.bits() | Self::CEBE.bits() | Self::CIE.bits();
        const DATA_ERRORS = Self::DTOE.bits() | Self::DCE.bits() | Self::DEBE.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EsdhcConfig {
    /// Clock feeding the prescaler
    pub base_hz: u32,
    /// Card clock once the card is identified
    pub operating_hz: u32,
    /// Read watermark, in words: how much the data port holds when BRR is set
    pub watermark: u32,
}

impl Default for EsdhcConfig {
    fn default() -> Self {
        Self {
            base_hz: 48_000_000,
            operating_hz: 24_000_000,
            watermark: 16,
        }
    }
}

pub struct EsdhcHost<'a, R: Registers, C: Counter> {
    regs: R,
    timer: &'a C,
    caps: HostCaps,
    config: EsdhcConfig,
    /// Whether the identification clock is running, None before the first
    /// rate is set
    low_speed: Option<bool>,
}

/// SYSCTL clock fields for the fastest card clock at or under `target_hz`
fn clock_fields(base_hz: u32, target_hz: u32) -> u32 {
    let target_hz = target_hz.max(1);
    // The divisor goes up to 16, the prescaler takes the rest in powers of two
    let shift = divider_shift(base_hz, target_hz.saturating_mul(16), 8);
    let divisor = (base_hz >> shift).div_ceil(target_hz).clamp(1, 16);
    let prescaler = (1u32 << shift) >> 1;

    (prescaler << SYSCTL_SDCLKFS_SHIFT) | ((divisor - 1) << SYSCTL_DVS_SHIFT)
}

impl<'a, R: Registers, C: Counter> EsdhcHost<'a, R, C> {
    /// Reset the controller and leave it at the identification clock, with
    /// the 80 initialization clocks sent
    pub fn new(
        regs: R,
        timer: &'a C,
        caps: HostCaps,
        config: EsdhcConfig,
    ) -> Result<Self, MmcError> {
        let mut host = Self {
            regs,
            timer,
            caps,
            config,
            low_speed: None,
        };

        host.regs.modify(SYSCTL, |v| v | SYSCTL_RSTA);
        host.settle(SYSCTL, SYSCTL_RSTA, 0)?;

        host.regs.write(IRQSTATEN, u32::MAX);
        host.regs.write(IRQSIGEN, 0);
        host.regs.write(WML, config.watermark.clamp(1, 128));
        host.regs.write(IRQSTAT, u32::MAX);

        host.set_clock(true)?;

        host.regs.modify(SYSCTL, |v| v | SYSCTL_INITA);
        host.settle(SYSCTL, SYSCTL_INITA, 0)?;

        Ok(host)
    }

    #[inline]
    fn irqstat(&self) -> Irq {
        Irq::from_bits_retain(self.regs.read(IRQSTAT))
    }

    /// Wait for the bits in `mask` of `offset` to read back as `value`
    fn settle(&self, offset: usize, mask: u32, value: u32) -> Result<(), MmcError> {
        wait_for(self.timer, SETTLE_TIMEOUT_MS, || {
            (self.regs.read(offset) & mask == value).then_some(())
        })
        .map_err(|_| MmcError::ControllerStuck {})
    }

    fn set_clock(&mut self, low_speed: bool) -> Result<(), MmcError> {
        if self.low_speed == Some(low_speed) {
            return Ok(());
        }

        let target_hz = match low_speed {
            true => IDENT_CLOCK_HZ,
            false => self.config.operating_hz,
        };
        let fields =
            clock_fields(self.config.base_hz, target_hz) | (DTOCV_MAX << SYSCTL_DTOCV_SHIFT);

        self.regs.modify(SYSCTL, |v| v & !SYSCTL_SDCLKEN);
        self.regs.modify(SYSCTL, |v| (v & !SYSCTL_CLOCK_MASK) | fields);
        self.settle(PRSSTAT, PRSSTAT_SDSTB, PRSSTAT_SDSTB)?;
        self.regs.modify(SYSCTL, |v| v | SYSCTL_SDCLKEN);

        self.low_speed = Some(low_speed);
        Delay::new(self.timer).delay_us(CLOCK_SETTLE_US);

        Ok(())
    }

    fn xfertyp(cmd: &CmdDescriptor) -> u32 {
        let mut xfertyp = (cmd.index as u32) << XFERTYP_CMDINX_SHIFT;

        xfertyp |= match cmd.response {
            ResponseFormat::None => 0,
            ResponseFormat::R2 => XFERTYP_RSP_136 | XFERTYP_CCCEN,
            _ if cmd.flags.contains(CmdFlags::BUSY) => XFERTYP_RSP_48_BUSY,
            _ => XFERTYP_RSP_48,
        };

        if cmd.response.is_checked() {
            xfertyp |= XFERTYP_CCCEN | XFERTYP_CICEN;
        }

        if cmd.flags.contains(CmdFlags::DATA) {
            xfertyp |= XFERTYP_DPSEL;

            if !cmd.flags.contains(CmdFlags::WRITE) {
                xfertyp |= XFERTYP_DTDSEL;
            }
        }

        xfertyp
    }

    fn exchange(
        &mut self,
        cmd: &CmdDescriptor,
        arg: u32,
        data: Option<&mut [u32]>,
    ) -> Result<Response, MmcError> {
        self.set_clock(cmd.flags.contains(CmdFlags::LOW_SPEED))?;

        let inhibit = match cmd.flags.intersects(CmdFlags::DATA | CmdFlags::BUSY) {
            true => PRSSTAT_CIHB | PRSSTAT_CDIHB,
            false => PRSSTAT_CIHB,
        };

        wait_for(self.timer, CMD_TIMEOUT_MS, || {
            (self.regs.read(PRSSTAT) & inhibit == 0).then_some(())
        })
        .map_err(|e| MmcError::CmdTimeout {
            cmd: cmd.index,
            time_ms: e.time_ms,
        })?;

        self.regs.write(IRQSTAT, u32::MAX);

        if let Some(words) = &data {
            self.regs.write(BLKATTR, (1 << 16) | (words.len() * 4) as u32);
        }

        let start_time = self.timer.get_counter();
        self.regs.write(CMDARG, arg);
        self.regs.write(XFERTYP, Self::xfertyp(cmd));

        let irq = wait_for(self.timer, CMD_TIMEOUT_MS, || {
            let irq = self.irqstat();
            irq.intersects(Irq::CC | Irq::CMD_ERRORS).then_some(irq)
        })
        .map_err(|e| MmcError::CmdTimeout {
            cmd: cmd.index,
            time_ms: e.time_ms,
        })?;

        if irq.contains(Irq::CTOE) {
            return Err(MmcError::CmdTimeout {
                cmd: cmd.index,
                time_ms: elapsed_ms(self.timer, start_time),
            });
        }

        if irq.intersects(Irq::CCE | Irq::CEBE) {
            return Err(MmcError::BadRxCrc7 { cmd: cmd.index });
        }

        if irq.contains(Irq::CIE) {
            return Err(MmcError::WrongCmd { cmd: cmd.index });
        }

        let response = self.read_response(cmd);

        match data {
            Some(words) => self.read_data(cmd.index, words)?,
            None if cmd.flags.contains(CmdFlags::BUSY) => self.wait_transfer(cmd.index)?,
            None => {}
        }

        Ok(response)
    }

    fn read_response(&self, cmd: &CmdDescriptor) -> Response {
        match cmd.response.len_bits() {
            0 => Response::none(),
            136 => {
                // The controller drops the CRC byte and right-aligns the rest
                let raw = (self.regs.read(CMDRSP3) as u128) << 96
                    | (self.regs.read(CMDRSP2) as u128) << 64
                    | (self.regs.read(CMDRSP1) as u128) << 32
                    | self.regs.read(CMDRSP0) as u128;

                Response::long((raw << 8).to_be_bytes())
            }
            _ => Response::short(self.regs.read(CMDRSP0)),
        }
    }

    fn read_data(&self, cmd: u8, words: &mut [u32]) -> Result<(), MmcError> {
        let start_time = self.timer.get_counter();
        let mut filled = 0;

        while filled < words.len() {
            let irq = self.irqstat();

            if irq.contains(Irq::DTOE) {
                return Err(MmcError::DataTimeout {
                    cmd,
                    time_ms: elapsed_ms(self.timer, start_time),
                });
            }

            if irq.intersects(Irq::DCE | Irq::DEBE) {
                return Err(MmcError::BadDataCrc { cmd });
            }

            match self.pop_burst(irq, &mut words[filled..]) {
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

        self.wait_transfer(cmd)
    }

    /// Move one watermark's worth of words out of the data port
    fn pop_burst(&self, irq: Irq, words: &mut [u32]) -> Result<usize, MmcError> {
        if !irq.contains(Irq::BRR) {
            return Err(MmcError::FifoNotReady {});
        }

        self.regs.write(IRQSTAT, Irq::BRR.bits());

        let burst = words.len().min(self.config.watermark.max(1) as usize);
        for word in &mut words[..burst] {
            // First byte of the stream sits in the low byte of the port
            *word = u32::from_ne_bytes(self.regs.read(DATPORT).to_le_bytes());
        }

        Ok(burst)
    }

    fn wait_transfer(&self, cmd: u8) -> Result<(), MmcError> {
        let irq = wait_for(self.timer, DATA_TIMEOUT_MS, || {
            let irq = self.irqstat();
            irq.intersects(Irq::TC | Irq::DATA_ERRORS).then_some(irq)
        })
        .map_err(|e| MmcError::DataTimeout {
            cmd,
            time_ms: e.time_ms,
        })?;

        match irq.intersects(Irq::DATA_ERRORS) {
            true if irq.contains(Irq::DTOE) => Err(MmcError::DataTimeout {
                cmd,
                time_ms: DATA_TIMEOUT_MS,
            }),
            true => Err(MmcError::BadDataCrc { cmd }),
            false => Ok(()),
        }
    }
}

impl<R: Registers, C: Counter> Host for EsdhcHost<'_, R, C> {
    fn transfer(
        &mut self,
        cmd: &CmdDescriptor,
        arg: u32,
        data: Option<&mut [u32]>,
    ) -> Result<Response, MmcError> {
        let result = self.exchange(cmd, arg, data);

        // A failed command leaves the state machines mid-transfer, and nothing
        // may be issued until the line resets have completed
        let reset = match result.is_err() {
            true => {
                self.regs.modify(SYSCTL, |v| v | SYSCTL_RSTC | SYSCTL_RSTD);
                self.settle(SYSCTL, SYSCTL_RSTC | SYSCTL_RSTD, 0)
            }
            false => Ok(()),
        };
        self.regs.write(IRQSTAT, u32::MAX);

        reset?;
        result
    }

    fn set_bus_width(&mut self, wide: bool) {
        let dtw = match wide {
            true => PROCTL_DTW_4BIT,
            false => 0,
        };

        self.regs.modify(PROCTL, |v| (v & !PROCTL_DTW_MASK) | dtw);
    }

    fn caps(&self) -> &HostCaps {
        &self.caps
    }
}
