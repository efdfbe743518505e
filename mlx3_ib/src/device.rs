//! This module consists of functions that work close to the hardware of the hca.

use super::hal::Hal;

const RESET_BASE: usize = 0xf0000;
const RESET_OFFSET: usize = 0x10;
const SEMAPHORE_OFFSET: usize = 0x3fc;
const OWNERSHIP_BASE: usize = 0x8069c;

pub(super) const PAGE_SHIFT: u8 = 12;
pub(super) const DEFAULT_UAR_PAGE_SHIFT: u8 = 12;

/// Convert a driver-side UAR index into the one the hardware expects.
///
/// With the default 4 KiB UAR pages both sides agree.
pub(super) fn uar_index_to_hw(index: usize) -> usize {
    let _ = DEFAULT_UAR_PAGE_SHIFT;
    index
}

pub(super) struct ResetRegisters;

impl ResetRegisters {
    /// Perform a software reset of the card.
    pub(super) fn reset<H: Hal>(hal: &H) -> Result<(), &'static str> {
        trace!("initiating card reset...");

        // grab the HW semaphore to lock out flash updates
        let mut sem = 1;
        for _ in 0..1000 {
            sem = hal.read_config(RESET_BASE + SEMAPHORE_OFFSET);
            if sem == 0 {
                break;
            }
            trace!("waiting for semaphore...");
            hal.delay_us(1000);
        }
        if sem != 0 {
            return Err("failed to acquire HW semaphore");
        }

        // actually hit reset
        hal.write_config(RESET_BASE + RESET_OFFSET, 1);
        // docs say to wait one second before accessing the device
        hal.delay_us(1_000_000);

        for _ in 0..100 {
            // wait for it to respond to PCI cycles
            if hal.read_vendor_id() != 0xffff {
                return Ok(());
            }
            trace!("waiting for card...");
            hal.delay_us(1000);
        }
        Err("card failed to reset")
    }
}

pub(super) struct Ownership;

impl Ownership {
    /// Take ownership of the card away from the firmware.
    pub(super) fn get<H: Hal>(hal: &H) -> Result<(), &'static str> {
        for _ in 0..100 {
            if hal.read_config(OWNERSHIP_BASE) == 0 {
                trace!("got ownership of the card");
                return Ok(());
            }
            hal.delay_us(1000);
        }
        Err("failed to get ownership of the card")
    }
}

#[cfg(test)]
mod tests {
    use super::super::sim::SimDevice;
    use super::*;

    #[test]
    fn reset_completes_when_the_card_comes_back() {
        let hal = SimDevice::new();
        ResetRegisters::reset(&hal).unwrap();
        Ownership::get(&hal).unwrap();
    }
}
