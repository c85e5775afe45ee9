//! Acquisition: walking an unknown card from power-on to ready
//!
//! SD is tried first. Only if the card ignores ACMD41 altogether is it
//! treated as MMC; any other failure along the way ends acquisition. The
//! session being built is kept to the side and only handed to the driver once
//! the CSD is in, so a failed attempt never leaves a half-filled session behind.

use embedded_hal::blocking::delay::DelayMs;
use log::{debug, info, trace, warn};

use crate::card::{CardFamily, CardSession};
use crate::command::MmcCmd;
use crate::errors::{FailureClass, MmcError};
use crate::host::Host;
use crate::mmc::Mmc;
use crate::registers::Ocr;
use crate::timing::{Counter, elapsed_ms};

/// Check pattern sent with CMD8
pub const IF_COND_CHECK: u8 = 0xAA;

/// Inquiries allowed for a card still powering up
pub const OCR_POLL_TRIES: u32 = 10;

/// Spacing between op-cond polls, in milliseconds
pub const OCR_POLL_SPACING_MS: u32 = 10;

/// Op-cond polls allowed while negotiating the voltage window
pub const NEGOTIATE_TRIES: u32 = 100;

/// Wall-clock ceiling on voltage negotiation, in milliseconds
pub const NEGOTIATE_TIMEOUT_MS: u64 = 1_000;

/// Address given to MMC cards
pub const MMC_RCA: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Reset,
    TryOpCond(CardFamily),
    CheckOcr(CardFamily, Ocr),
    PollOcr(CardFamily),
    NegotiateOcr(CardFamily, u32),
    GetCid(CardFamily),
    GetRca(CardFamily),
    GetCsd(CardFamily),
    Done(CardFamily),
    Failed(MmcError),
}

fn op_cond(family: CardFamily, window: u32) -> MmcCmd {
    match family {
        CardFamily::Sd => MmcCmd::SdSendOpCond(window),
        CardFamily::Mmc => MmcCmd::SendOpCond(window),
    }
}

/// The card has answered at least once, so any later failure means it is there
/// but could not be brought up
fn unidentified(cmd: MmcCmd, class: FailureClass) -> State {
    State::Failed(MmcError::Unidentified {
        cmd: cmd.descriptor().index,
        class,
    })
}

impl<'a, H: Host, C: Counter> Mmc<'a, H, C> {
    /// Identify the card on the bus and bring it to the stand-by state.
    ///
    /// Any previous session is dropped first. On success the session holds
    /// the card's CID, RCA and CSD; on failure it is left empty and the error
    /// tells an empty slot ([`MmcError::NoCard`]) from a card that would not
    /// come up ([`MmcError::Unidentified`]).
    pub fn acquire(&mut self) -> Result<CardFamily, MmcError> {
        self.reset();

        let mut card = CardSession::default();
        let mut state = State::Reset;

        loop {
            trace!("mmc: {:?}", state);

            state = match state {
                State::Reset => self.reset_card(&mut card),
                State::TryOpCond(family) => self.try_op_cond(&mut card, family),
                State::CheckOcr(family, ocr) => match ocr.is_busy() {
                    true => State::PollOcr(family),
                    false => State::NegotiateOcr(family, self.voltage_window(ocr)),
                },
                State::PollOcr(family) => self.poll_ocr(family),
                State::NegotiateOcr(family, window) => {
                    self.negotiate_ocr(&mut card, family, window)
                }
                State::GetCid(family) => self.get_cid(&mut card, family),
                State::GetRca(family) => self.get_rca(&mut card, family),
                State::GetCsd(family) => self.get_csd(&mut card, family),
                State::Done(family) => {
                    card.acquired = true;
                    card.sd = family == CardFamily::Sd;

                    info!(
                        "mmc: {:?} card acquired, rca {:#06x}, {} bytes, ready after {}ms",
                        family, card.rca, card.device_size, card.acquire_time_ms
                    );

                    self.session = card;
                    return Ok(family);
                }
                State::Failed(err) => {
                    warn!("mmc: acquisition failed: {}", err);

                    self.reset();
                    return Err(err);
                }
            };
        }
    }

    fn voltage_window(&self, ocr: Ocr) -> u32 {
        ocr.voltage_window() & self.host.caps().voltages
    }

    fn reset_card(&mut self, card: &mut CardSession) -> State {
        if let Err(err) = self.send_command(MmcCmd::GoIdleState, 0) {
            return State::Failed(err);
        }

        // Legacy cards do not know CMD8
        match self.send_command(MmcCmd::SendIfCond(IF_COND_CHECK), 0) {
            Ok(rsp) if rsp.if_cond_check() == IF_COND_CHECK => card.if_cond = true,
            Ok(rsp) => debug!(
                "mmc: {}",
                MmcError::BadCheck {
                    good_check: IF_COND_CHECK,
                    bad_check: rsp.if_cond_check(),
                }
            ),
            Err(err) => debug!("mmc: no answer to CMD8 ({})", err),
        }

        State::TryOpCond(CardFamily::Sd)
    }

    fn try_op_cond(&mut self, card: &mut CardSession, family: CardFamily) -> State {
        let cmd = op_cond(family, 0);

        match self.send_command(cmd, card.rca) {
            Ok(rsp) => State::CheckOcr(family, rsp.ocr()),
            Err(err) if err.is_timeout() => match family {
                CardFamily::Sd => {
                    debug!("mmc: no answer to ACMD41, trying MMC");
                    card.clear();
                    State::TryOpCond(CardFamily::Mmc)
                }
                CardFamily::Mmc => State::Failed(MmcError::NoCard {}),
            },
            Err(err) => unidentified(cmd, err.class()),
        }
    }

    fn poll_ocr(&mut self, family: CardFamily) -> State {
        let cmd = op_cond(family, 0);

        for _ in 0..OCR_POLL_TRIES {
            self.delay().delay_ms(OCR_POLL_SPACING_MS);

            match self.send_command(cmd, 0) {
                Ok(rsp) if !rsp.ocr().is_busy() => {
                    return State::NegotiateOcr(family, self.voltage_window(rsp.ocr()));
                }
                Ok(_) => {}
                Err(err) => return unidentified(cmd, err.class()),
            }
        }

        unidentified(cmd, FailureClass::Timeout)
    }

    fn negotiate_ocr(&mut self, card: &mut CardSession, family: CardFamily, window: u32) -> State {
        let cmd = op_cond(family, window);

        if window == 0 {
            warn!("mmc: card shares no voltage window with the host");
            return unidentified(cmd, FailureClass::CommandError);
        }

        let start_time = self.timer.get_counter();

        for _ in 0..NEGOTIATE_TRIES {
            match self.send_command(cmd, card.rca) {
                Ok(rsp) if !rsp.ocr().is_busy() => {
                    let ocr = rsp.ocr();

                    if ocr.ccs() {
                        warn!("mmc: block addressed card, reads will use byte addresses");
                    }

                    card.ocr = ocr.ocr;
                    card.acquire_time_ms = elapsed_ms(self.timer, start_time);
                    return State::GetCid(family);
                }
                Ok(_) => {}
                Err(err) => return unidentified(cmd, err.class()),
            }

            if elapsed_ms(self.timer, start_time) > NEGOTIATE_TIMEOUT_MS {
                break;
            }

            self.delay().delay_ms(OCR_POLL_SPACING_MS);
        }

        unidentified(cmd, FailureClass::Timeout)
    }

    fn get_cid(&mut self, card: &mut CardSession, family: CardFamily) -> State {
        // Only one card per bus, so the first CID back is the card's
        match self.send_command(MmcCmd::AllSendCid, card.rca) {
            Ok(rsp) => {
                card.cid = *rsp.bytes();
                State::GetRca(family)
            }
            Err(err) => unidentified(MmcCmd::AllSendCid, err.class()),
        }
    }

    fn get_rca(&mut self, card: &mut CardSession, family: CardFamily) -> State {
        let cmd = match family {
            CardFamily::Sd => MmcCmd::SendRelativeAddr,
            CardFamily::Mmc => MmcCmd::SetRelativeAddr(MMC_RCA),
        };

        match self.send_command(cmd, card.rca) {
            Ok(rsp) => {
                card.rca = match family {
                    CardFamily::Sd => rsp.rca(),
                    CardFamily::Mmc => MMC_RCA,
                };
                State::GetCsd(family)
            }
            Err(err) => unidentified(cmd, err.class()),
        }
    }

    fn get_csd(&mut self, card: &mut CardSession, family: CardFamily) -> State {
        let cmd = MmcCmd::SendCsd(card.rca);

        match self.send_command(cmd, card.rca) {
            Ok(rsp) => {
                card.set_csd(*rsp.bytes());
                State::Done(family)
            }
            Err(err) => unidentified(cmd, err.class()),
        }
    }
}
