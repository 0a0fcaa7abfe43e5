//! Multicast address allocation
//!
//! A candidate group is free if nothing arrives on it within the listen
//! window. Busy candidates are skipped by bumping the address. Scanning is
//! serialized and successful picks are remembered until released, so two
//! publishers on this node never end up on the same group. Publishers on
//! different nodes scanning at the same moment can still collide.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::network::udp;

/// Finds unused multicast addresses for publishers
pub trait AddressAllocator: Send + Sync {
    /// Blocking; may take up to one listen window per candidate
    fn find_free_address(&self, start: Ipv4Addr) -> Result<Ipv4Addr, NetworkError>;

    /// Give an address back once its publisher is gone
    fn release(&self, address: Ipv4Addr);
}

/// Next candidate after `address`, staying inside the multicast range
pub fn next_candidate(address: Ipv4Addr) -> Option<Ipv4Addr> {
    let next = u32::from(address).checked_add(1).map(Ipv4Addr::from)?;
    next.is_multicast().then_some(next)
}

type BusyCheck = Box<dyn Fn(Ipv4Addr) -> Result<bool, NetworkError> + Send + Sync>;

/// Allocator that listens on each candidate group before claiming it
pub struct MulticastScanner {
    check: BusyCheck,
    max_attempts: u32,
    claimed: Mutex<HashSet<Ipv4Addr>>,
}

impl MulticastScanner {
    pub fn new(config: &NetworkConfig) -> Self {
        let port = config.stream_port;
        let window = Duration::from_millis(config.listen_window_ms);
        Self::with_check(config.max_scan_attempts, move |candidate| {
            listen_for_traffic(candidate, port, window)
        })
    }

    /// Allocator with a custom busy check, returning true when the
    /// candidate carries traffic
    pub fn with_check<F>(max_attempts: u32, check: F) -> Self
    where
        F: Fn(Ipv4Addr) -> Result<bool, NetworkError> + Send + Sync + 'static,
    {
        Self {
            check: Box::new(check),
            max_attempts,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    pub fn claimed(&self) -> Vec<Ipv4Addr> {
        self.claimed.lock().iter().copied().collect()
    }
}

impl AddressAllocator for MulticastScanner {
    fn find_free_address(&self, start: Ipv4Addr) -> Result<Ipv4Addr, NetworkError> {
        // Held across the scan so local publishers take turns
        let mut claimed = self.claimed.lock();
        let mut candidate = Some(start);

        for _ in 0..self.max_attempts {
            let address = match candidate {
                Some(address) => address,
                None => break,
            };

            if !claimed.contains(&address) {
                if (self.check)(address)? {
                    tracing::trace!("Multicast address {} is in use", address);
                } else {
                    tracing::debug!("Found open multicast address {}", address);
                    claimed.insert(address);
                    return Ok(address);
                }
            }
            candidate = next_candidate(address);
        }

        Err(NetworkError::NoFreeAddress {
            start,
            attempts: self.max_attempts,
        })
    }

    fn release(&self, address: Ipv4Addr) {
        if self.claimed.lock().remove(&address) {
            tracing::trace!("Released multicast address {}", address);
        }
    }
}

/// Join `group` on `port` and report whether anything arrives in `window`
fn listen_for_traffic(group: Ipv4Addr, port: u16, window: Duration) -> Result<bool, NetworkError> {
    let socket = udp::create_multicast_socket(group, port)?;
    udp::set_read_timeout(&socket, window)?;

    let mut buf = [0u8; 1500];
    match socket.recv_from(&mut buf) {
        Ok(_) => Ok(true),
        Err(e) if udp::is_timeout(&e) => Ok(false),
        Err(e) => Err(NetworkError::ReceiveFailed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: Ipv4Addr = Ipv4Addr::new(226, 0, 0, 0);

    #[test]
    fn test_skips_busy_addresses() {
        let busy = [Ipv4Addr::new(226, 0, 0, 0), Ipv4Addr::new(226, 0, 0, 1)];
        let allocator = MulticastScanner::with_check(8, move |a| Ok(busy.contains(&a)));

        assert_eq!(allocator.find_free_address(START).unwrap(), Ipv4Addr::new(226, 0, 0, 2));
    }

    #[test]
    fn test_local_claims_do_not_collide() {
        let allocator = MulticastScanner::with_check(8, |_| Ok(false));

        let first = allocator.find_free_address(START).unwrap();
        let second = allocator.find_free_address(START).unwrap();
        assert_ne!(first, second);

        allocator.release(first);
        assert_eq!(allocator.find_free_address(START).unwrap(), first);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let allocator = MulticastScanner::with_check(4, |_| Ok(true));
        match allocator.find_free_address(START) {
            Err(NetworkError::NoFreeAddress { start, attempts }) => {
                assert_eq!(start, START);
                assert_eq!(attempts, 4);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn test_next_candidate_carries_into_next_octet() {
        assert_eq!(next_candidate(Ipv4Addr::new(226, 0, 0, 255)), Some(Ipv4Addr::new(226, 0, 1, 0)));
        assert_eq!(next_candidate(Ipv4Addr::new(239, 255, 255, 255)), None);
    }
}
