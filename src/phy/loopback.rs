use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use super::{Device, DeviceCapabilities};

/// A captured outbound frame: destination, link priority, bytes.
pub type QueuedFrame = (Ipv4Addr, u8, Vec<u8>);

/// A device that stores every transmitted frame in a queue instead of
/// putting it on a wire.
///
/// Tests and demos pump frames out of one stack's `Loopback` and feed
/// them to another stack's receive path, optionally dropping or
/// reordering along the way.
pub struct Loopback {
    caps: DeviceCapabilities,
    queue: Mutex<VecDeque<QueuedFrame>>,
}

impl Loopback {
    /// Create a loopback device with the given capabilities.
    pub fn new(caps: DeviceCapabilities) -> Loopback {
        Loopback {
            caps,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Remove and return the oldest captured frame, if any.
    pub fn dequeue(&self) -> Option<QueuedFrame> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Number of captured frames waiting.
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl Default for Loopback {
    fn default() -> Self {
        Loopback::new(DeviceCapabilities::default())
    }
}

impl Device for Loopback {
    fn capabilities(&self) -> DeviceCapabilities {
        self.caps
    }

    fn transmit(&self, dst: Ipv4Addr, priority: u8, frame: &[u8]) -> io::Result<()> {
        self.queue
            .lock()
            .unwrap()
            .push_back((dst, priority, frame.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_come_back_in_order() {
        let device = Loopback::default();
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        device.transmit(dst, 7, &[1, 2, 3]).unwrap();
        device.transmit(dst, 0, &[4]).unwrap();
        assert_eq!(device.pending(), 2);
        assert_eq!(device.dequeue(), Some((dst, 7, vec![1, 2, 3])));
        assert_eq!(device.dequeue(), Some((dst, 0, vec![4])));
        assert_eq!(device.dequeue(), None);
    }
}
