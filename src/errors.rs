//! Errors raised while talking to an SD/MMC card

use embedded_io::{blocking::ReadExactError, Error, ErrorKind};
use snafu::prelude::*;

/// Coarse classification of a failure.
///
/// The acquisition state machine only ever branches on this, never on the
/// individual variant, so both host realizations can report as much detail as
/// their hardware gives them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    GenericFailure,
    CommandError,
    Timeout,
    TransientFifo,
    CrcError,
}

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum MmcError {
    #[snafu(display("(MMC) Timeout on CMD{cmd} after {time_ms}ms!"))]
    CmdTimeout { cmd: u8, time_ms: u64 },
    #[snafu(display("(MMC) Data timeout on CMD{cmd} after {time_ms}ms!"))]
    DataTimeout { cmd: u8, time_ms: u64 },
    #[snafu(display("(MMC) Bad response CRC7 on CMD{cmd}!"))]
    BadRxCrc7 { cmd: u8 },
    #[snafu(display("(MMC) Bad data CRC16 on CMD{cmd}!"))]
    BadDataCrc { cmd: u8 },
    #[snafu(display("(MMC) Response is to the wrong command (sent CMD{cmd})!"))]
    WrongCmd { cmd: u8 },
    #[snafu(display("(MMC) CMD{cmd} reported card status {status:#010x}!"))]
    CardStatus { cmd: u8, status: u32 },
    #[snafu(display("(MMC) FIFO not ready yet"))]
    FifoNotReady {},
    #[snafu(display("(MMC) Bad CMD8 check pattern!"))]
    BadCheck { good_check: u8, bad_check: u8 },
    #[snafu(display("(MMC) Controller did not settle!"))]
    ControllerStuck {},
    #[snafu(display("(MMC) No card present"))]
    NoCard {},
    #[snafu(display("(MMC) Card present but not identified (CMD{cmd}, {class:?})"))]
    Unidentified { cmd: u8, class: FailureClass },
    #[snafu(display("(MMC) No card acquired"))]
    NotAcquired {},
    #[snafu(display("(MMC) Range ends at {end}, card holds {size} bytes"))]
    OutOfRange { end: u64, size: u64 },
    #[snafu(display("(MMC) Seek before start of descriptor"))]
    BadSeek {},
    #[snafu(display("(IO) Unexpected EOF!"))]
    UnexpectedEof {},
}

impl MmcError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::CmdTimeout { .. } | Self::DataTimeout { .. } => FailureClass::Timeout,
            Self::BadRxCrc7 { .. } | Self::BadDataCrc { .. } => FailureClass::CrcError,
            Self::WrongCmd { .. } | Self::CardStatus { .. } | Self::BadCheck { .. } => {
                FailureClass::CommandError
            }
            Self::FifoNotReady {} => FailureClass::TransientFifo,
            Self::Unidentified { class, .. } => *class,
            _ => FailureClass::GenericFailure,
        }
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        self.class() == FailureClass::Timeout
    }
}

impl Error for MmcError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

impl From<MmcError> for ReadExactError<MmcError> {
    fn from(e: MmcError) -> ReadExactError<MmcError> {
        Self::Other(e)
    }
}

impl From<ReadExactError<MmcError>> for MmcError {
    fn from(e: ReadExactError<MmcError>) -> MmcError {
        match e {
            ReadExactError::UnexpectedEof => Self::UnexpectedEof {},
            ReadExactError::Other(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_classify_together() {
        let cmd = MmcError::CmdTimeout { cmd: 9, time_ms: 300 };
        let data = MmcError::DataTimeout { cmd: 17, time_ms: 300 };

        assert!(cmd.is_timeout());
        assert!(data.is_timeout());
        assert_eq!(MmcError::BadDataCrc { cmd: 17 }.class(), FailureClass::CrcError);
        assert_eq!(MmcError::FifoNotReady {}.class(), FailureClass::TransientFifo);
    }

    #[test]
    fn unidentified_keeps_the_cause() {
        let e = MmcError::Unidentified {
            cmd: 9,
            class: FailureClass::Timeout,
        };

        assert!(e.is_timeout());
        assert_ne!(e, MmcError::NoCard {});
    }

    #[test]
    fn read_exact_eof_maps_to_error() {
        let e: MmcError = ReadExactError::<MmcError>::UnexpectedEof.into();
        assert_eq!(e, MmcError::UnexpectedEof {});
    }
}
