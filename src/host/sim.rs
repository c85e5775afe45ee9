//! Simulated card behind a [`Host`], for exercising everything above the
//! transport without hardware

use hex_literal::hex;

use crate::card::CardFamily;
use crate::command::{CmdDescriptor, CmdFlags, Response};
use crate::errors::MmcError;
use crate::host::{Host, HostCaps};

/// c_size 4095, c_size_mult 7, read_bl_len 9: 1GiB
pub const CSD_1G: [u8; 16] = hex!("00 26 00 32 5F 59 83 FF ED DB CF FF D2 40 40 A5");

/// c_size 1, c_size_mult 0, read_bl_len 9: eight 512 byte blocks
pub const CSD_4K: [u8; 16] = hex!("00 26 00 32 5F 59 80 00 40 00 00 FF D2 40 40 A5");

pub const SD_CID: [u8; 16] = hex!("03 53 44 53 55 30 31 47 80 12 34 56 78 00 9A 01");

pub const MMC_CID: [u8; 16] = hex!("15 00 01 4D 4D 43 30 32 47 12 CA FE BA BE 49 01");

const STATUS_STBY: u32 = 0x0000_0700;
const STATUS_TRAN: u32 = 0x0000_0900;
const STATUS_APP: u32 = 0x0000_0120;

/// How the simulated card behaves
#[derive(Debug, Clone)]
pub struct SimCard {
    /// None for an empty slot
    pub family: Option<CardFamily>,
    pub ocr: u32,
    /// Number of argument-0 op-cond inquiries answered busy
    pub busy_inquiries: u32,
    /// Number of op-cond polls with a voltage window answered busy
    pub busy_polls: u32,
    /// Answer CMD8 (physical layer v2)
    pub if_cond: bool,
    pub cid: [u8; 16],
    pub csd: [u8; 16],
    /// Address an SD card publishes
    pub rca: u16,
    pub image: Vec<u8>,
}

impl SimCard {
    pub fn sd() -> Self {
        Self {
            family: Some(CardFamily::Sd),
            ocr: 0x80FF_8000,
            busy_inquiries: 0,
            busy_polls: 0,
            if_cond: true,
            cid: SD_CID,
            csd: CSD_1G,
            rca: 0x1234,
            image: Vec::new(),
        }
    }

    pub fn mmc() -> Self {
        Self {
            family: Some(CardFamily::Mmc),
            if_cond: false,
            cid: MMC_CID,
            ..Self::sd()
        }
    }

    pub fn empty() -> Self {
        Self {
            family: None,
            ..Self::sd()
        }
    }

    /// Small card whose byte `n` holds `n * 7 + n / 512`, so every block differs
    pub fn with_pattern(mut self) -> Self {
        self.csd = CSD_4K;
        self.image = (0..4096u32).map(|n| (n * 7 + n / 512) as u8).collect();
        self
    }
}

/// One command as the card saw it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Issued {
    pub index: u8,
    pub arg: u32,
    pub app: bool,
    pub low_speed: bool,
}

pub struct SimHost {
    pub card: SimCard,
    pub log: Vec<Issued>,
    pub wide: bool,
    /// Make the next command with this index fail with this error
    pub fail: Option<(u8, MmcError)>,
    caps: HostCaps,
    inquiries: u32,
    polls: u32,
    rca: u16,
    selected: bool,
    block_len: u32,
}

impl SimHost {
    pub fn new(card: SimCard, caps: HostCaps) -> Self {
        Self {
            card,
            log: Vec::new(),
            wide: false,
            fail: None,
            caps,
            inquiries: 0,
            polls: 0,
            rca: 0,
            selected: false,
            block_len: 512,
        }
    }

    pub fn indices(&self) -> Vec<u8> {
        self.log.iter().map(|issued| issued.index).collect()
    }

    fn timeout(cmd: u8) -> MmcError {
        MmcError::CmdTimeout {
            cmd,
            time_ms: super::CMD_TIMEOUT_MS + 1,
        }
    }

    fn op_cond(&mut self, arg: u32) -> Response {
        let busy = if arg == 0 {
            self.inquiries += 1;
            self.inquiries <= self.card.busy_inquiries
        } else {
            self.polls += 1;
            self.polls <= self.card.busy_polls
        };

        match busy {
            true => Response::short(self.card.ocr & !(1 << 31)),
            false => Response::short(self.card.ocr),
        }
    }

    fn read_block(&mut self, arg: u32, data: Option<&mut [u32]>) -> Result<Response, MmcError> {
        if !self.selected {
            return Err(Self::timeout(17));
        }

        let words = data.ok_or(MmcError::ControllerStuck {})?;
        let start = arg as usize;
        let block = self
            .card
            .image
            .get(start..start + self.block_len as usize)
            .map(|block| block.to_vec())
            .unwrap_or_else(|| vec![0; self.block_len as usize]);

        for (word, bytes) in words.iter_mut().zip(block.chunks(4)) {
            *word = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }

        Ok(Response::short(STATUS_TRAN))
    }
}

impl Host for SimHost {
    fn transfer(
        &mut self,
        cmd: &CmdDescriptor,
        arg: u32,
        data: Option<&mut [u32]>,
    ) -> Result<Response, MmcError> {
        self.log.push(Issued {
            index: cmd.index,
            arg,
            app: cmd.flags.contains(CmdFlags::APP),
            low_speed: cmd.flags.contains(CmdFlags::LOW_SPEED),
        });

        if let Some((index, _)) = &self.fail {
            if *index == cmd.index {
                let (_, err) = self.fail.take().unwrap();
                return Err(err);
            }
        }

        let family = match self.card.family {
            Some(family) => family,
            None => {
                return match cmd.index {
                    0 => Ok(Response::none()),
                    index => Err(Self::timeout(index)),
                };
            }
        };
        let sd = family == CardFamily::Sd;

        match cmd.index {
            0 => {
                self.inquiries = 0;
                self.polls = 0;
                self.rca = 0;
                self.selected = false;
                Ok(Response::none())
            }
            8 if sd && self.card.if_cond => Ok(Response::short(arg & 0xFFF)),
            55 if sd => Ok(Response::short(STATUS_APP)),
            41 if sd => Ok(self.op_cond(arg)),
            1 if !sd => Ok(self.op_cond(arg)),
            2 => Ok(Response::long(self.card.cid)),
            3 if sd => {
                self.rca = self.card.rca;
                Ok(Response::short(((self.rca as u32) << 16) | 0x0500))
            }
            3 => {
                self.rca = (arg >> 16) as u16;
                Ok(Response::short(0x0500))
            }
            9 if self.rca != 0 && arg >> 16 == self.rca as u32 => Ok(Response::long(self.card.csd)),
            7 if arg == 0 => {
                self.selected = false;
                Ok(Response::none())
            }
            7 if arg >> 16 == self.rca as u32 => {
                self.selected = true;
                Ok(Response::short(STATUS_STBY))
            }
            6 if sd && self.selected => Ok(Response::short(STATUS_TRAN)),
            16 if self.selected => {
                self.block_len = arg;
                Ok(Response::short(STATUS_TRAN))
            }
            17 => self.read_block(arg, data),
            12 => Ok(Response::short(STATUS_TRAN)),
            index => Err(Self::timeout(index)),
        }
    }

    fn set_bus_width(&mut self, wide: bool) {
        self.wide = wide;
    }

    fn caps(&self) -> &HostCaps {
        &self.caps
    }
}
