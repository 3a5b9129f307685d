//! USB digitizer driver (spec §4.2 "For USB-bus digitizers").
//!
//! Grounded on `examples/original_source/include/worker_caenusb.hh`:
//! `EventAvailable` performs a block readout into a driver-owned buffer and
//! asks the driver how many events it holds; `GetEvent` decodes event zero
//! and stamps `system_clock`/`event_index`. The vendor block-transfer call
//! itself is out of scope (spec §1); `UsbBackend` is the seam a real CAEN
//! digitizer binding plugs into.

use std::time::Instant;

use crate::events::DeviceEvent;
use crate::worker::DeviceDriver;

/// Abstraction over the vendor digitizer library: block readout plus a
/// per-channel sample decode for event zero in the buffer.
pub trait UsbBackend: Send {
    /// Reads the next block into the backend's own buffer, returning the
    /// number of complete events it contains.
    fn read_block(&mut self) -> u32;

    /// Decodes event zero out of the most recent block into per-channel
    /// sample traces.
    fn decode_event(&mut self) -> Vec<Vec<u16>>;
}

pub struct UsbDigitizerDriver<T: DeviceEvent> {
    backend: Box<dyn UsbBackend>,
    event_index: u64,
    decode: Box<dyn Fn(u64, u64, Vec<Vec<u16>>) -> T + Send>,
}

impl<T: DeviceEvent> UsbDigitizerDriver<T> {
    pub fn new(
        backend: Box<dyn UsbBackend>,
        decode: impl Fn(u64, u64, Vec<Vec<u16>>) -> T + Send + 'static,
    ) -> Self {
        Self {
            backend,
            event_index: 0,
            decode: Box::new(decode),
        }
    }
}

impl<T: DeviceEvent> DeviceDriver<T> for UsbDigitizerDriver<T> {
    fn event_available(&mut self) -> bool {
        self.backend.read_block() > 0
    }

    fn get_event(&mut self, t0: Instant) -> T {
        let trace = self.backend.decode_event();
        let system_clock = t0.elapsed().as_millis() as u64;
        let idx = self.event_index;
        self.event_index += 1;
        (self.decode)(idx, system_clock, trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Caen5720Event;
    use std::time::Instant;

    struct MockBackend {
        blocks_remaining: u32,
    }

    impl UsbBackend for MockBackend {
        fn read_block(&mut self) -> u32 {
            if self.blocks_remaining > 0 {
                self.blocks_remaining -= 1;
                1
            } else {
                0
            }
        }

        fn decode_event(&mut self) -> Vec<Vec<u16>> {
            vec![vec![7u16; crate::events::CAEN_5720_LN]; crate::events::CAEN_5720_CH]
        }
    }

    #[test]
    fn stamps_incrementing_event_index() {
        let backend = MockBackend { blocks_remaining: 2 };
        let mut driver: UsbDigitizerDriver<Caen5720Event> =
            UsbDigitizerDriver::new(Box::new(backend), |idx, clock, trace| Caen5720Event {
                event_index: idx,
                system_clock: clock,
                trace,
            });

        let t0 = Instant::now();
        assert!(driver.event_available());
        let e0 = driver.get_event(t0);
        assert_eq!(e0.event_index, 0);

        assert!(driver.event_available());
        let e1 = driver.get_event(t0);
        assert_eq!(e1.event_index, 1);

        assert!(!driver.event_available());
    }

    #[test]
    fn ignores_error_logging_and_keeps_producing() {
        struct AlwaysOneBackend;
        impl UsbBackend for AlwaysOneBackend {
            fn read_block(&mut self) -> u32 {
                1
            }
            fn decode_event(&mut self) -> Vec<Vec<u16>> {
                vec![vec![0u16; 4]; 2]
            }
        }

        let mut driver: UsbDigitizerDriver<Caen5720Event> =
            UsbDigitizerDriver::new(Box::new(AlwaysOneBackend), |idx, clock, trace| Caen5720Event {
                event_index: idx,
                system_clock: clock,
                trace,
            });
        let t0 = Instant::now();
        for i in 0..5 {
            assert!(driver.event_available());
            assert_eq!(driver.get_event(t0).event_index, i);
        }
    }
}
