//! The access boundary between the driver and the platform.
//!
//! The driver itself never dereferences device memory. Everything it needs
//! from the platform is behind the [`Hal`] trait: word access to the
//! configuration space (BAR 0), doorbell and BlueFlame writes into the
//! User Access Region (BAR 2), the PCI vendor id and a delay primitive.
//!
//! All values cross this boundary in host order; implementations perform
//! the swap to the big-endian device registers. Offsets are byte offsets
//! from the start of the respective BAR.

pub trait Hal {
    /// Read a 32-bit word from the configuration space (BAR 0).
    fn read_config(&self, offset: usize) -> u32;

    /// Write a 32-bit word into the configuration space (BAR 0).
    fn write_config(&self, offset: usize, value: u32);

    /// Write a 32-bit word into the User Access Region (BAR 2).
    fn write_doorbell(&self, offset: usize, value: u32);

    /// Burst-copy a descriptor into a BlueFlame register (BAR 2).
    ///
    /// The copy must happen in whole 8-byte beats.
    fn write_blueflame(&self, offset: usize, data: &[u8]);

    /// Read the vendor id from the PCI configuration space.
    ///
    /// This reads `0xffff` while the device is absent from the bus,
    /// which happens during reset.
    fn read_vendor_id(&self) -> u16;

    /// Busy-wait for the given number of microseconds.
    fn delay_us(&self, us: u32);
}

impl<H: Hal + ?Sized> Hal for &H {
    fn read_config(&self, offset: usize) -> u32 {
        (**self).read_config(offset)
    }

    fn write_config(&self, offset: usize, value: u32) {
        (**self).write_config(offset, value)
    }

    fn write_doorbell(&self, offset: usize, value: u32) {
        (**self).write_doorbell(offset, value)
    }

    fn write_blueflame(&self, offset: usize, data: &[u8]) {
        (**self).write_blueflame(offset, data)
    }

    fn read_vendor_id(&self) -> u16 {
        (**self).read_vendor_id()
    }

    fn delay_us(&self, us: u32) {
        (**self).delay_us(us)
    }
}
