//! The card driver: one host, one card session, one sector cache

use crate::blockdev::SectorCache;
use crate::card::CardSession;
use crate::command::{MmcCmd, Response};
use crate::errors::MmcError;
use crate::host::{Host, HostCaps};
use crate::timing::{Counter, Delay};

/// SD/MMC card driver
pub struct Mmc<'a, H: Host, C: Counter> {
    /// The controller the card sits on
    pub(crate) host: H,
    /// Reference to the monotonic counter
    pub(crate) timer: &'a C,
    /// Everything learnt about the card during acquisition
    pub(crate) session: CardSession,
    /// The block most recently read from the card
    pub(crate) cache: SectorCache,
}

impl<'a, H: Host, C: Counter> Mmc<'a, H, C> {
    /// Create a driver with no card acquired
    pub fn new(host: H, timer: &'a C) -> Self {
        Self {
            host,
            timer,
            session: CardSession::default(),
            cache: SectorCache::new(),
        }
    }

    pub fn session(&self) -> &CardSession {
        &self.session
    }

    #[inline]
    pub fn is_acquired(&self) -> bool {
        self.session.acquired
    }

    pub fn caps(&self) -> &HostCaps {
        self.host.caps()
    }

    /// Give the host controller back
    pub fn release(self) -> H {
        self.host
    }

    /// Forget the card and everything cached from it
    pub fn reset(&mut self) {
        self.session.clear();
        self.cache.invalidate();
        self.host.set_bus_width(false);
    }

    pub(crate) fn delay(&self) -> Delay<'a, C> {
        Delay::new(self.timer)
    }

    /// Send a command without a data phase, addressing application commands
    /// with `rca`
    pub(crate) fn send_command(&mut self, cmd: MmcCmd, rca: u16) -> Result<Response, MmcError> {
        self.host.execute(cmd, rca, None)
    }
}
