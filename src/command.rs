//! Commands, their wire format, and the responses they produce

use bitflags::bitflags;

use crate::registers::{CardStatus, Ocr};

/// Perform the 7-bit CRC used on the command line. The result is already
/// shifted into place with the end bit set.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut d in data.iter().cloned() {
        for _bit in 0..8 {
            crc <<= 1;
            if ((d & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}

/// Possible response formats for SD/MMC commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    /// No response
    None,
    /// Normal response
    R1,
    /// Normal response followed by busy signalling on DAT0
    R1b,
    /// CID/CSD register
    R2,
    /// OCR register, no CRC
    R3,
    /// Published RCA
    R6,
    /// Card interface condition
    R7,
}

impl ResponseFormat {
    /// Length of the response on the wire, in bits
    pub fn len_bits(&self) -> usize {
        match self {
            Self::None => 0,
            Self::R1 | Self::R1b | Self::R3 | Self::R6 | Self::R7 => 48,
            Self::R2 => 136,
        }
    }

    /// True for responses that echo the command index and carry a CRC7
    pub fn is_checked(&self) -> bool {
        matches!(self, Self::R1 | Self::R1b | Self::R6 | Self::R7)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmdFlags: u8 {
        /// Issue at the identification clock rate
        const LOW_SPEED = 1 << 0;
        /// Application command, APP_CMD goes out first
        const APP = 1 << 1;
        /// A data block follows the response
        const DATA = 1 << 2;
        /// The data block goes from host to card
        const WRITE = 1 << 3;
        /// The card holds DAT0 low until it is done
        const BUSY = 1 << 4;
    }
}

/// Everything a host needs to know to put a command on the bus, apart from
/// its argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdDescriptor {
    pub index: u8,
    pub response: ResponseFormat,
    pub flags: CmdFlags,
}

impl CmdDescriptor {
    /// Build the 48-bit command frame: start and direction bits, index,
    /// argument, CRC7 and end bit
    pub fn frame(&self, arg: u32) -> [u8; 6] {
        let arg = arg.to_be_bytes();
        let mut frame = [0x40 | (self.index & 0x3F), arg[0], arg[1], arg[2], arg[3], 0];
        frame[5] = crc7(&frame[..5]);
        frame
    }

    #[inline]
    pub fn is_app(&self) -> bool {
        self.flags.contains(CmdFlags::APP)
    }
}

/// Commands the driver knows how to issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmcCmd {
    /// CMD0: GO_IDLE_STATE, no response
    GoIdleState,
    /// CMD1: SEND_OP_COND (MMC), supply the voltage window. R3
    SendOpCond(u32),
    /// CMD2: ALL_SEND_CID. R2
    AllSendCid,
    /// CMD3: SET_RELATIVE_ADDR (MMC), supply the address to assign. R1
    SetRelativeAddr(u16),
    /// CMD3: SEND_RELATIVE_ADDR (SD), the card picks its own address. R6
    SendRelativeAddr,
    /// CMD7: SELECT/DESELECT_CARD. R1b, or no response at all for an RCA of
    /// 0, which deselects every card
    SelectCard(u16),
    /// CMD8: SEND_IF_COND, supply the check pattern. R7
    SendIfCond(u8),
    /// CMD9: SEND_CSD, supply the RCA. R2
    SendCsd(u16),
    /// CMD12: STOP_TRANSMISSION. R1b
    StopTransmission,
    /// CMD16: SET_BLOCKLEN, supply the block length in bytes. R1
    SetBlockLen(u32),
    /// CMD17: READ_SINGLE_BLOCK, supply the byte address. R1 + data
    ReadSingleBlock(u32),
    /// CMD55: APP_CMD, supply the RCA. R1. Hosts send this on their own
    /// ahead of every application command.
    AppCmd(u16),
    /// ACMD6: SET_BUS_WIDTH, true for 4 bits. R1
    SetBusWidth(bool),
    /// ACMD41: SD_SEND_OP_COND, supply the voltage window. R3
    SdSendOpCond(u32),
}

impl MmcCmd {
    /// Look up the command's descriptor
    pub fn descriptor(&self) -> CmdDescriptor {
        use CmdFlags as F;
        use ResponseFormat as R;

        let (index, response, flags) = match self {
            Self::GoIdleState => (0, R::None, F::LOW_SPEED),
            Self::SendOpCond(_) => (1, R::R3, F::LOW_SPEED),
            Self::AllSendCid => (2, R::R2, F::LOW_SPEED),
            Self::SetRelativeAddr(_) => (3, R::R1, F::LOW_SPEED),
            Self::SendRelativeAddr => (3, R::R6, F::LOW_SPEED),
            // No card answers a deselect
            Self::SelectCard(0) => (7, R::None, F::empty()),
            Self::SelectCard(_) => (7, R::R1b, F::BUSY),
            Self::SendIfCond(_) => (8, R::R7, F::LOW_SPEED),
            Self::SendCsd(_) => (9, R::R2, F::LOW_SPEED),
            Self::StopTransmission => (12, R::R1b, F::BUSY),
            Self::SetBlockLen(_) => (16, R::R1, F::empty()),
            Self::ReadSingleBlock(_) => (17, R::R1, F::DATA),
            Self::AppCmd(_) => (55, R::R1, F::empty()),
            Self::SetBusWidth(_) => (6, R::R1, F::APP),
            Self::SdSendOpCond(_) => (41, R::R3, F::APP.union(F::LOW_SPEED)),
        };

        CmdDescriptor {
            index,
            response,
            flags,
        }
    }

    /// The 32-bit argument that goes on the wire
    pub fn argument(&self) -> u32 {
        match *self {
            Self::GoIdleState
            | Self::AllSendCid
            | Self::SendRelativeAddr
            | Self::StopTransmission => 0,
            Self::SendOpCond(window) | Self::SdSendOpCond(window) => window,
            // Bits 31-16 are the RCA, 15-0 are stuff bits
            Self::SetRelativeAddr(rca)
            | Self::SelectCard(rca)
            | Self::SendCsd(rca)
            | Self::AppCmd(rca) => (rca as u32) << 16,
            // Bits 11-8 select 2.7-3.6v, 7-0 are the check pattern
            Self::SendIfCond(check) => (0b0001 << 8) | check as u32,
            Self::SetBlockLen(value) | Self::ReadSingleBlock(value) => value,
            Self::SetBusWidth(fourbit) => match fourbit {
                true => 0b10,
                false => 0,
            },
        }
    }
}

/// Raw response bytes, MSB first.
///
/// 48-bit responses keep their 32 payload bits in bytes 0-3, duplicated in
/// bytes 8-11, so every short format can be decoded from the same offsets.
/// 136-bit responses hold the register from bit 127 down to bit 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Response {
    bytes: [u8; 16],
}

impl Response {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn short(payload: u32) -> Self {
        let mut bytes = [0; 16];
        bytes[0..4].copy_from_slice(&payload.to_be_bytes());
        bytes[8..12].copy_from_slice(&payload.to_be_bytes());
        Self { bytes }
    }

    pub fn long(bytes: [u8; 16]) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8; 16] {
        &self.bytes
    }

    /// The 32 payload bits of a 48-bit response
    pub fn payload(&self) -> u32 {
        u32::from_be_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }

    /// OCR out of an R3 response
    pub fn ocr(&self) -> Ocr {
        Ocr {
            ocr: self.payload(),
        }
    }

    /// Published address out of an R6 response
    pub fn rca(&self) -> u16 {
        u16::from_be_bytes([self.bytes[0], self.bytes[1]])
    }

    /// Card status out of an R1/R1b response
    pub fn status(&self) -> CardStatus {
        CardStatus {
            card_status: self.payload(),
        }
    }

    /// Echoed check pattern out of an R7 response
    pub fn if_cond_check(&self) -> u8 {
        self.bytes[3]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_crc7() {
        const DATA: [u8; 15] = hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40");
        assert_eq!(crc7(&DATA), 0xA5);
    }

    #[test]
    fn frames_match_the_wire() {
        let go_idle = MmcCmd::GoIdleState;
        assert_eq!(
            go_idle.descriptor().frame(go_idle.argument()),
            hex!("40 00 00 00 00 95")
        );

        let if_cond = MmcCmd::SendIfCond(0xAA);
        assert_eq!(
            if_cond.descriptor().frame(if_cond.argument()),
            hex!("48 00 00 01 AA 87")
        );
    }

    #[test]
    fn app_commands_are_flagged() {
        assert!(MmcCmd::SdSendOpCond(0).descriptor().is_app());
        assert!(MmcCmd::SetBusWidth(true).descriptor().is_app());
        assert!(!MmcCmd::SendOpCond(0).descriptor().is_app());
        assert!(!MmcCmd::AppCmd(0).descriptor().is_app());
    }

    #[test]
    fn rca_goes_in_the_top_half() {
        assert_eq!(MmcCmd::SendCsd(0x1234).argument(), 0x1234_0000);
        assert_eq!(MmcCmd::AppCmd(0x1234).argument(), 0x1234_0000);
        assert_eq!(MmcCmd::SelectCard(0).argument(), 0);
        assert_eq!(MmcCmd::SetBusWidth(true).argument(), 2);
    }

    #[test]
    fn deselect_expects_no_answer() {
        let deselect = MmcCmd::SelectCard(0).descriptor();
        let select = MmcCmd::SelectCard(0x1234).descriptor();

        assert_eq!(deselect.index, 7);
        assert_eq!(deselect.response, ResponseFormat::None);
        assert!(!deselect.flags.contains(CmdFlags::BUSY));
        assert_eq!(select.response, ResponseFormat::R1b);
        assert!(select.flags.contains(CmdFlags::BUSY));
    }

    #[test]
    fn both_cmd3_flavours_share_an_index() {
        let sd = MmcCmd::SendRelativeAddr.descriptor();
        let mmc = MmcCmd::SetRelativeAddr(1).descriptor();

        assert_eq!(sd.index, 3);
        assert_eq!(mmc.index, 3);
        assert_eq!(sd.response, ResponseFormat::R6);
        assert_eq!(mmc.response, ResponseFormat::R1);
    }

    #[test]
    fn short_response_decodes() {
        let r6 = Response::short(0x1234_0500);
        assert_eq!(r6.rca(), 0x1234);
        assert_eq!(r6.bytes()[8..12], r6.bytes()[0..4]);

        let r7 = Response::short(0x0000_01AA);
        assert_eq!(r7.if_cond_check(), 0xAA);

        assert!(!Response::short(0x80FF_8000).ocr().is_busy());
    }
}
