//! Byte-range reads on top of single block reads
//!
//! Callers describe a window of the card with a [`Descriptor`] and read from
//! it at a cursor. Reads go through a one-sector cache, so small sequential
//! reads only touch the card once per sector.

use embedded_io::blocking::{Read, Seek};
use embedded_io::{Io, SeekFrom};
use log::trace;

use crate::command::MmcCmd;
use crate::errors::MmcError;
use crate::host::Host;
use crate::mmc::Mmc;
use crate::timing::Counter;

/// Size of a cached sector, independent of the card's native block length
pub const SECTOR_LEN: usize = 512;

const SECTOR_WORDS: usize = SECTOR_LEN / 4;
const SECTOR_MASK: u64 = !(SECTOR_LEN as u64 - 1);

/// The last sector read from the card
pub struct SectorCache {
    pub(crate) words: [u32; SECTOR_WORDS],
    base: Option<u64>,
}

impl SectorCache {
    pub const fn new() -> Self {
        Self {
            words: [0; SECTOR_WORDS],
            base: None,
        }
    }

    #[inline]
    pub fn invalidate(&mut self) {
        self.base = None;
    }

    /// Card address of the cached sector, if any
    pub fn base(&self) -> Option<u64> {
        self.base
    }

    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        self.base == Some(address & SECTOR_MASK)
    }

    fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }
}

impl Default for SectorCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A window onto the card, plus a read cursor relative to its start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub start: u64,
    /// Zero until opened means "to the end of the card"
    pub length: u64,
    pub index: u64,
}

impl Descriptor {
    pub fn new(start: u64, length: u64) -> Self {
        Self {
            start,
            length,
            index: 0,
        }
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.length.saturating_sub(self.index)
    }

    /// Move the cursor. Never touches the card; seeking past the end is
    /// allowed and simply makes reads return nothing.
    pub fn seek(&mut self, position: SeekFrom) -> Result<u64, MmcError> {
        let index = match position {
            SeekFrom::Start(position) => Some(position),
            SeekFrom::End(delta) => self.length.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.index.checked_add_signed(delta),
        };

        let index = index.ok_or(MmcError::BadSeek {})?;
        self.index = index;

        Ok(index)
    }
}

impl<'a, H: Host, C: Counter> Mmc<'a, H, C> {
    /// Check `desc` against the acquired card, filling in its length if it
    /// was left at zero
    pub fn open(&mut self, desc: &mut Descriptor) -> Result<(), MmcError> {
        if !self.session.acquired {
            return Err(MmcError::NotAcquired {});
        }

        let size = self.session.device_size;

        if desc.length == 0 {
            desc.length = size.saturating_sub(desc.start);
        }

        let end = desc.start.saturating_add(desc.length);

        if end > size {
            return Err(MmcError::OutOfRange { end, size });
        }

        Ok(())
    }

    /// Read from the cursor of `desc` into `buffer`, returning the number of
    /// bytes copied.
    ///
    /// The read is clipped to what is left of the descriptor. On error the
    /// cursor still accounts for every byte that was copied before it.
    pub fn read(&mut self, desc: &mut Descriptor, buffer: &mut [u8]) -> Result<usize, MmcError> {
        if !self.session.acquired {
            return Err(MmcError::NotAcquired {});
        }

        let length = (buffer.len() as u64).min(desc.remaining()) as usize;
        let mut copied = 0;

        while copied < length {
            let address = desc.start + desc.index;

            if !self.cache.contains(address) {
                self.refill(address & SECTOR_MASK)?;
            }

            let offset = (address & !SECTOR_MASK) as usize;
            let count = (SECTOR_LEN - offset).min(length - copied);

            buffer[copied..copied + count]
                .copy_from_slice(&self.cache.bytes()[offset..offset + count]);

            copied += count;
            desc.index += count as u64;
        }

        Ok(copied)
    }

    /// Open `desc` and wrap it up with the driver as an [`embedded_io`] reader
    pub fn partition(&mut self, mut desc: Descriptor) -> Result<Partition<'_, 'a, H, C>, MmcError> {
        self.open(&mut desc)?;

        Ok(Partition { mmc: self, desc })
    }

    /// Load the sector at `base` into the cache
    fn refill(&mut self, base: u64) -> Result<(), MmcError> {
        self.cache.invalidate();

        let rca = self.session.rca;
        let address = u32::try_from(base).map_err(|_| MmcError::OutOfRange {
            end: base,
            size: self.session.device_size,
        })?;

        // Cycling the selection puts some controllers back in a known state
        self.send_command(MmcCmd::SelectCard(0), rca)?;
        self.send_command(MmcCmd::SelectCard(rca), rca)?
            .status()
            .check(7)?;

        if cfg!(feature = "wide-bus") && self.session.sd && self.host.caps().wide_bus {
            self.send_command(MmcCmd::SetBusWidth(true), rca)?
                .status()
                .check(6)?;
            self.host.set_bus_width(true);
        }

        self.send_command(MmcCmd::SetBlockLen(SECTOR_LEN as u32), rca)?
            .status()
            .check(16)?;

        self.host
            .execute(MmcCmd::ReadSingleBlock(address), rca, Some(&mut self.cache.words))?
            .status()
            .check(17)?;

        self.cache.base = Some(base);
        trace!("mmc: cached sector {:#x}", base);

        Ok(())
    }
}

/// An opened [`Descriptor`] borrowed together with its driver
pub struct Partition<'m, 'a, H: Host, C: Counter> {
    mmc: &'m mut Mmc<'a, H, C>,
    desc: Descriptor,
}

impl<H: Host, C: Counter> Partition<'_, '_, H, C> {
    pub fn descriptor(&self) -> &Descriptor {
        &self.desc
    }
}

impl<H: Host, C: Counter> Io for Partition<'_, '_, H, C> {
    type Error = MmcError;
}

impl<H: Host, C: Counter> Read for Partition<'_, '_, H, C> {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, MmcError> {
        self.mmc.read(&mut self.desc, buffer)
    }
}

impl<H: Host, C: Counter> Seek for Partition<'_, '_, H, C> {
    fn seek(&mut self, position: SeekFrom) -> Result<u64, MmcError> {
        self.desc.seek(position)
    }
}
