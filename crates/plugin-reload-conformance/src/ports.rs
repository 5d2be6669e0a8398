use crate::error::{HarnessError, Result};
use std::net::{Ipv4Addr, TcpListener};
use tracing::debug;

/// Hands out listener ports for successive scenario runs.
///
/// Ports increase monotonically from `base`; a port that is already bound on
/// loopback is skipped so that a stale broker from an earlier run can never
/// answer for a new one.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    base: u16,
    next: u32,
}

impl PortAllocator {
    #[must_use]
    pub fn new(base: u16) -> Self {
        let base = base.max(1);
        Self {
            base,
            next: u32::from(base),
        }
    }

    pub fn allocate(&mut self) -> Result<u16> {
        while let Ok(port) = u16::try_from(self.next) {
            self.next += 1;
            if is_free(port) {
                return Ok(port);
            }
            debug!(port, "port in use, skipping");
        }
        Err(HarnessError::PortsExhausted { base: self.base })
    }
}

fn is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
