//! What the driver knows about the card on the bus

use core::fmt;

use crate::registers::{Cid, Csd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardFamily {
    Sd,
    Mmc,
}

/// State of the one card the driver talks to.
///
/// Starts out zeroed and is only ever replaced as a whole: either every field
/// comes from a completed acquisition, or the session is cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardSession {
    pub acquired: bool,
    /// SD card when true, MMC otherwise; meaningless until `acquired`
    pub sd: bool,
    pub rca: u16,
    pub ocr: u32,
    /// The card echoed the CMD8 check pattern
    pub if_cond: bool,
    pub cid: [u8; 16],
    pub csd: [u8; 16],
    /// Native block length from the CSD
    pub block_len: u32,
    pub block_count: u32,
    /// Capacity in bytes
    pub device_size: u64,
    /// Time the card took to leave the busy state during voltage negotiation
    pub acquire_time_ms: u64,
}

impl CardSession {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn family(&self) -> Option<CardFamily> {
        match (self.acquired, self.sd) {
            (false, _) => None,
            (true, true) => Some(CardFamily::Sd),
            (true, false) => Some(CardFamily::Mmc),
        }
    }

    pub fn cid(&self) -> Option<Cid> {
        self.family().map(|family| Cid::new(self.cid, family))
    }

    pub fn csd(&self) -> Option<Csd> {
        self.acquired.then(|| Csd::new(self.csd))
    }

    /// Take the geometry out of the CSD
    pub(crate) fn set_csd(&mut self, csd: [u8; 16]) {
        let parsed = Csd::new(csd);

        self.csd = csd;
        self.block_len = parsed.block_len();
        self.block_count = parsed.block_count();
        self.device_size = parsed.capacity();
    }

    /// Write a human readable summary of the card
    pub fn report<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        let (family, cid) = match (self.family(), self.cid()) {
            (Some(family), Some(cid)) => (family, cid),
            _ => return writeln!(w, "mmc: no card"),
        };

        let kind = match (family, self.if_cond) {
            (CardFamily::Sd, true) => "SD (v2)",
            (CardFamily::Sd, false) => "SD",
            (CardFamily::Mmc, _) => "MMC",
        };

        writeln!(
            w,
            "mmc: {} card, rca {:#06x}, {} bytes ({} x {})",
            kind, self.rca, self.device_size, self.block_count, self.block_len
        )?;

        let name = core::str::from_utf8(cid.product_name()).unwrap_or("?");
        let (major, minor) = cid.revision();
        let (year, month) = cid.date();

        writeln!(
            w,
            "     mid {:#04x} oem {:#06x} '{}' rev {}.{} s/n {:08x} {}/{:02}",
            cid.manufacturer_id(),
            cid.oem_id(),
            name,
            major,
            minor,
            cid.serial(),
            year,
            month
        )?;

        writeln!(w, "     ocr {:#010x}, ready after {}ms", self.ocr, self.acquire_time_ms)
    }
}
