//! Ephemeral control-port allocation shared by concurrent runners
//!
//! The OS picks a free port; the allocator additionally remembers every port it
//! has handed out until the lease is dropped, so two runners never receive the
//! same port while both are alive.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex, OnceLock};

const MAX_ATTEMPTS: usize = 32;

#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    leased: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide allocator used by runners unless one is injected.
    pub fn global() -> &'static PortAllocator {
        static GLOBAL: OnceLock<PortAllocator> = OnceLock::new();
        GLOBAL.get_or_init(PortAllocator::new)
    }

    pub fn allocate(&self) -> std::io::Result<PortLease> {
        for _ in 0..MAX_ATTEMPTS {
            let port = {
                let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
                listener.local_addr()?.port()
            };
            let mut leased = self.lock();
            if leased.insert(port) {
                return Ok(PortLease {
                    port,
                    leased: Some(self.leased.clone()),
                });
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "no free port available",
        ))
    }

    /// A caller-chosen port. It is not tracked, since the caller owns it.
    pub fn fixed(port: u16) -> PortLease {
        PortLease { port, leased: None }
    }

    pub fn leased_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<u16>> {
        self.leased.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Port held for the lifetime of one execution; released on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    leased: Option<Arc<Mutex<HashSet<u16>>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if let Some(leased) = self.leased.take() {
            let mut leased = leased.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            leased.remove(&self.port);
        }
    }
}
