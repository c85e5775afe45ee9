//! Card registers and the bit-reader used to pick them apart

use crate::card::CardFamily;
use crate::errors::MmcError;

/// Read a `len` bit wide field out of a register stored MSB-first.
///
/// `start` is the bit number of the field's least significant bit, counted
/// the way the SD physical layer tables count them: bit 0 is the last bit of
/// the last byte. Bits past the end of `bits` read as zero.
pub fn field(bits: &[u8], start: usize, len: usize) -> u32 {
    debug_assert!(len <= 32);

    let mut value: u32 = 0;

    for bit in (start..start + len).rev() {
        let byte = bits
            .len()
            .checked_sub(1 + bit / 8)
            .and_then(|i| bits.get(i))
            .copied()
            .unwrap_or(0);

        value = (value << 1) | ((byte >> (bit % 8)) & 1) as u32;
    }

    value
}

/// OCR window covering 2.7-3.6v
pub const OCR_VDD_27_36: u32 = 0x00FF_8000;

/// OCR window covering 3.2-3.4v
pub const OCR_VDD_32_34: u32 = 0x0030_0000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ocr {
    pub ocr: u32,
}

impl Ocr {
    /// Returns the voltage window
    pub fn voltage_window(&self) -> u32 {
        self.ocr & 0xFF_FFFF
    }
    /// Returns true while the card is still powering up
    pub fn is_busy(&self) -> bool {
        (self.ocr & (1 << 31)) == 0
    }
    /// Returns true if the CCS bit is set
    pub fn ccs(&self) -> bool {
        (self.ocr & (1 << 30)) > 0
    }
}

/// Card identification register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cid {
    raw: [u8; 16],
    family: CardFamily,
}

impl Cid {
    pub fn new(raw: [u8; 16], family: CardFamily) -> Self {
        Self { raw, family }
    }

    pub fn manufacturer_id(&self) -> u8 {
        field(&self.raw, 120, 8) as u8
    }

    /// OEM/application id; two ASCII characters on SD, one byte on MMC
    pub fn oem_id(&self) -> u16 {
        match self.family {
            CardFamily::Sd => field(&self.raw, 104, 16) as u16,
            CardFamily::Mmc => field(&self.raw, 104, 8) as u16,
        }
    }

    /// Raw product name bytes, 5 on SD and 6 on MMC
    pub fn product_name(&self) -> &[u8] {
        match self.family {
            CardFamily::Sd => &self.raw[3..8],
            CardFamily::Mmc => &self.raw[3..9],
        }
    }

    /// Product revision as (major, minor)
    pub fn revision(&self) -> (u8, u8) {
        let prv = match self.family {
            CardFamily::Sd => field(&self.raw, 56, 8),
            CardFamily::Mmc => field(&self.raw, 48, 8),
        };

        ((prv >> 4) as u8, (prv & 0xF) as u8)
    }

    pub fn serial(&self) -> u32 {
        match self.family {
            CardFamily::Sd => field(&self.raw, 24, 32),
            CardFamily::Mmc => field(&self.raw, 16, 32),
        }
    }

    /// Manufacturing date as (year, month)
    pub fn date(&self) -> (u16, u8) {
        match self.family {
            CardFamily::Sd => (
                2000 + field(&self.raw, 12, 8) as u16,
                field(&self.raw, 8, 4) as u8,
            ),
            CardFamily::Mmc => (
                1997 + field(&self.raw, 8, 4) as u16,
                field(&self.raw, 12, 4) as u8,
            ),
        }
    }
}

/// Card specific data register (structure version 1.0 layout)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Csd {
    raw: [u8; 16],
}

impl Csd {
    pub fn new(raw: [u8; 16]) -> Self {
        Self { raw }
    }

    pub fn structure(&self) -> u8 {
        field(&self.raw, 126, 2) as u8
    }

    pub fn tran_speed(&self) -> u8 {
        field(&self.raw, 96, 8) as u8
    }

    pub fn read_bl_len(&self) -> u8 {
        field(&self.raw, 80, 4) as u8
    }

    pub fn c_size(&self) -> u32 {
        field(&self.raw, 62, 12)
    }

    pub fn c_size_mult(&self) -> u8 {
        field(&self.raw, 47, 3) as u8
    }

    /// Native block length in bytes
    pub fn block_len(&self) -> u32 {
        1 << self.read_bl_len()
    }

    /// Number of native blocks on the card
    pub fn block_count(&self) -> u32 {
        (self.c_size() + 1) << (self.c_size_mult() + 2)
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> u64 {
        u64::from(self.block_count()) << self.read_bl_len()
    }
}

/// Card status carried by R1 responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardStatus {
    pub card_status: u32,
}

const STATUS_ERROR_MASK: u32 = 0b1111_1101_1111_1001__1000_0000_0000_1000;

impl CardStatus {
    /// Gets the current state of the card
    pub fn current_state(&self) -> CardState {
        CardState::from_int(((self.card_status >> 9) & 0xF) as u8)
    }

    /// Turn any error bit into an error for `cmd`
    pub fn check(&self, cmd: u8) -> Result<(), MmcError> {
        if (self.card_status & STATUS_ERROR_MASK) == 0 {
            return Ok(());
        }

        Err(MmcError::CardStatus {
            cmd,
            status: self.card_status,
        })
    }

    #[inline]
    /// Returns true if the OUT_OF_RANGE bit is set
    pub fn out_of_range(&self) -> bool {
        (self.card_status & (1 << 31)) > 0
    }
    #[inline]
    /// Returns true if the ADDRESS_ERROR bit is set
    pub fn address_error(&self) -> bool {
        (self.card_status & (1 << 30)) > 0
    }
    #[inline]
    /// Returns true if the BLOCK_LEN_ERROR bit is set
    pub fn block_len_error(&self) -> bool {
        (self.card_status & (1 << 29)) > 0
    }
    #[inline]
    /// Returns true if the ILLEGAL_COMMAND bit is set
    pub fn illegal_command(&self) -> bool {
        (self.card_status & (1 << 22)) > 0
    }
    #[inline]
    /// Returns true if the READY_FOR_DATA bit is set
    pub fn ready_for_data(&self) -> bool {
        (self.card_status & (1 << 8)) > 0
    }
    #[inline]
    /// Returns true if the APP_CMD bit is set
    pub fn app_cmd(&self) -> bool {
        (self.card_status & (1 << 5)) > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Idle,
    Ready,
    Ident,
    Stby,
    Tran,
    Data,
    Rcv,
    Prg,
    Dis,
    Reserved,
}

impl CardState {
    /// Grabs the card state from a nibble
    pub fn from_int(nibble: u8) -> Self {
        match nibble {
            0 => Self::Idle,
            1 => Self::Ready,
            2 => Self::Ident,
            3 => Self::Stby,
            4 => Self::Tran,
            5 => Self::Data,
            6 => Self::Rcv,
            7 => Self::Prg,
            8 => Self::Dis,
            _ => Self::Reserved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // A 1GiB card: c_size 4095, c_size_mult 7, read_bl_len 9
    const CSD_1G: [u8; 16] = hex!("00 26 00 32 5F 59 83 FF ED DB CF FF D2 40 40 A5");

    // An actual CSD read from a 1GB SD card
    const CSD_REAL: [u8; 16] = hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5");

    #[test]
    fn field_straddles_bytes() {
        assert_eq!(field(&CSD_1G, 62, 12), 4095);
        assert_eq!(field(&CSD_1G, 47, 3), 7);
        assert_eq!(field(&CSD_1G, 80, 4), 9);
        // Whole first byte and a full 32-bit window
        assert_eq!(field(&CSD_1G, 120, 8), 0x00);
        assert_eq!(field(&CSD_1G, 96, 32), 0x0026_0032);
    }

    #[test]
    fn field_past_the_end_reads_zero() {
        assert_eq!(field(&[0xFF], 8, 4), 0);
        assert_eq!(field(&[0xFF], 4, 8), 0x0F);
    }

    #[test]
    fn csd_capacity() {
        let csd = Csd::new(CSD_1G);

        assert_eq!(csd.c_size(), 4095);
        assert_eq!(csd.c_size_mult(), 7);
        assert_eq!(csd.read_bl_len(), 9);
        assert_eq!(csd.block_len(), 512);
        assert_eq!(csd.capacity(), 4096 * 512 * 512);
    }

    #[test]
    fn csd_real_card() {
        let csd = Csd::new(CSD_REAL);

        assert_eq!(csd.structure(), 0);
        assert_eq!(csd.tran_speed(), 0x32);
        assert_eq!(csd.c_size(), 3874);
        assert_eq!(csd.block_count(), 3875 * 512);
        assert_eq!(csd.capacity(), 1_015_808_000);
    }

    #[test]
    fn sd_cid_fields() {
        // MID 0x03, OID "SD", PNM "SU01G", PRV 8.0, PSN 0x1234_5678, MDT 2009/10
        let cid = Cid::new(
            hex!("03 53 44 53 55 30 31 47 80 12 34 56 78 00 9A 01"),
            CardFamily::Sd,
        );

        assert_eq!(cid.manufacturer_id(), 0x03);
        assert_eq!(cid.oem_id(), u16::from_be_bytes(*b"SD"));
        assert_eq!(cid.product_name(), b"SU01G");
        assert_eq!(cid.revision(), (8, 0));
        assert_eq!(cid.serial(), 0x1234_5678);
        assert_eq!(cid.date(), (2009, 10));
    }

    #[test]
    fn mmc_cid_fields() {
        // MID 0x15, OID 0x01, PNM "MMC02G", PRV 1.2, PSN 0xCAFEBABE, MDT 4/2006
        let cid = Cid::new(
            hex!("15 00 01 4D 4D 43 30 32 47 12 CA FE BA BE 49 01"),
            CardFamily::Mmc,
        );

        assert_eq!(cid.manufacturer_id(), 0x15);
        assert_eq!(cid.oem_id(), 0x01);
        assert_eq!(cid.product_name(), b"MMC02G");
        assert_eq!(cid.revision(), (1, 2));
        assert_eq!(cid.serial(), 0xCAFE_BABE);
        assert_eq!(cid.date(), (2006, 4));
    }

    #[test]
    fn ocr_busy_bit() {
        assert!(Ocr { ocr: 0x00FF_8000 }.is_busy());
        assert!(!Ocr { ocr: 0x80FF_8000 }.is_busy());
        assert!(Ocr { ocr: 0xC0FF_8000 }.ccs());
        assert_eq!(Ocr { ocr: 0x80FF_8000 }.voltage_window(), OCR_VDD_27_36);
    }

    #[test]
    fn status_errors() {
        let tran = CardStatus { card_status: 0x0000_0900 };
        assert_eq!(tran.current_state(), CardState::Tran);
        assert!(tran.ready_for_data());
        assert!(tran.check(17).is_ok());

        let bad = CardStatus { card_status: 0x2000_0900 };
        assert!(bad.block_len_error());
        assert_eq!(
            bad.check(16),
            Err(MmcError::CardStatus {
                cmd: 16,
                status: 0x2000_0900
            })
        );
    }
}
