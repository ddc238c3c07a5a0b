use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::PortRange;

/// Source of ports for the replay harness's browser client.
pub trait PortAllocator: Send + Sync {
    fn next_port(&self) -> u16;
}

/// Independent uniform draw per trial, so back-to-back or concurrent replays
/// rarely land on the same port.
#[derive(Debug)]
pub struct RandomPorts {
    range: PortRange,
    rng: Mutex<StdRng>,
}

impl RandomPorts {
    pub fn new(range: PortRange, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            range,
            rng: Mutex::new(rng),
        }
    }
}

impl PortAllocator for RandomPorts {
    fn next_port(&self) -> u16 {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rng.random_range(self.range.start..=self.range.end)
    }
}

/// Walks the range in order, wrapping at the end.
#[derive(Debug)]
pub struct SequentialPorts {
    range: PortRange,
    cursor: AtomicU32,
}

impl SequentialPorts {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            cursor: AtomicU32::new(0),
        }
    }
}

impl PortAllocator for SequentialPorts {
    fn next_port(&self) -> u16 {
        let span = u32::from(self.range.end - self.range.start) + 1;
        let offset = self.cursor.fetch_add(1, Ordering::Relaxed) % span;
        // offset < span <= u16::MAX + 1, so the sum stays within the range
        self.range.start + offset as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ports_stay_in_range() {
        let range = PortRange {
            start: 9000,
            end: 9010,
        };
        let ports = RandomPorts::new(range, None);
        for _ in 0..200 {
            let port = ports.next_port();
            assert!((9000..=9010).contains(&port), "port {} out of range", port);
        }
    }

    #[test]
    fn seeded_ports_are_reproducible() {
        let a = RandomPorts::new(PortRange::default(), Some(7));
        let b = RandomPorts::new(PortRange::default(), Some(7));
        let first: Vec<u16> = (0..16).map(|_| a.next_port()).collect();
        let second: Vec<u16> = (0..16).map(|_| b.next_port()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn sequential_ports_wrap() {
        let ports = SequentialPorts::new(PortRange {
            start: 9000,
            end: 9002,
        });
        let drawn: Vec<u16> = (0..5).map(|_| ports.next_port()).collect();
        assert_eq!(drawn, vec![9000, 9001, 9002, 9000, 9001]);
    }

    #[test]
    fn single_port_range_is_allowed() {
        let range = PortRange {
            start: 9100,
            end: 9100,
        };
        assert_eq!(RandomPorts::new(range, Some(1)).next_port(), 9100);
        assert_eq!(SequentialPorts::new(range).next_port(), 9100);
    }
}
