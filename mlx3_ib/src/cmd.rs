//! The command interface of the card.
//!
//! Commands are posted through the Host Command Register (HCR) in the
//! configuration space: the input and output parameters (either immediate
//! values or physical mailbox addresses), the input modifier and the token
//! are written first, then a single control word carrying the opcode, the
//! opcode modifier, the toggle bit and the go bit. The card clears the go
//! bit and puts a status byte into the control word when it is done.
//!
//! Only one command may be in flight at a time. The toggle state lives
//! behind a mutex and constructing a [`CommandInterface`] takes the guard,
//! so holding one *is* the permission to talk to the card.

use core::sync::atomic::{compiler_fence, Ordering};

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};
use strum_macros::{FromRepr, IntoStaticStr};

use super::dma::{create_contiguous_mapping, DmaPages, PAGE_SIZE};
use super::hal::Hal;

const HCR_BASE: usize = 0x80680;
const HCR_IN_PARAM_OFFSET: usize = 0x00;
const HCR_IN_MOD_OFFSET: usize = 0x08;
const HCR_OUT_PARAM_OFFSET: usize = 0x0c;
const HCR_TOKEN_OFFSET: usize = 0x14;
const HCR_STATUS_OFFSET: usize = 0x18;

const HCR_OPMOD_SHIFT: u32 = 12;
const HCR_T_BIT: u32 = 21;
const HCR_E_BIT: u32 = 22;
const HCR_GO_BIT: u32 = 23;
pub(super) const POLL_TOKEN: u16 = 0xffff;

/// How often to check for command completion before giving up.
const POLL_RETRIES: usize = 10_000;
/// Delay between two completion checks.
const POLL_DELAY_US: u32 = 100;

// this is actually just u16
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(dead_code)]
pub(super) enum Opcode {
    // initialization and general commands
    QueryDevCap = 0x03,
    QueryFw = 0x04,
    QueryAdapter = 0x06,
    InitHca = 0x07,
    CloseHca = 0x08,
    InitPort = 0x09,
    ClosePort = 0x0a,
    QueryHca = 0x0b,
    SetPort = 0x0c,
    QueryPort = 0x43,
    RunFw = 0xff6,
    UnmapIcm = 0xff9,
    MapIcm = 0xffa,
    UnmapIcmAux = 0xffb,
    MapIcmAux = 0xffc,
    SetIcmSize = 0xffd,
    UnmapFa = 0xffe,
    MapFa = 0xfff,

    // TPT commands
    Sw2HwMpt = 0x0d,
    QueryMpt = 0x0e,
    Hw2SwMpt = 0x0f,
    ReadMtt = 0x10,
    WriteMtt = 0x11,

    // EQ commands
    MapEq = 0x12,
    Sw2HwEq = 0x13,
    Hw2SwEq = 0x14,
    QueryEq = 0x15,
    GenEqe = 0x58,

    // CQ commands
    Sw2HwCq = 0x16,
    Hw2SwCq = 0x17,
    QueryCq = 0x18,
    ModifyCq = 0x2c,

    // QP/EE commands
    Rst2InitQp = 0x19,
    Init2RtrQp = 0x1a,
    Rtr2RtsQp = 0x1b,
    Rts2RtsQp = 0x1c,
    Sqerr2RtsQp = 0x1d,
    Any2ErrQp = 0x1e,
    Rts2SqdQp = 0x1f,
    Sqd2RtsQp = 0x20,
    Any2RstQp = 0x21,
    QueryQp = 0x22,
    Init2InitQp = 0x2d,
    Sqd2SqdQp = 0x38,

    // special QP and management commands
    ConfSpecialQp = 0x23,
    MadIfc = 0x24,
    MadDemux = 0x203,
}

/// Why a command failed.
///
/// Most variants correspond to a status byte returned by the firmware;
/// the last three are generated by the driver itself.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr, IntoStaticStr)]
pub(super) enum CmdError {
    InternalError = 0x01,
    BadOperation = 0x02,
    BadParameter = 0x03,
    BadSystemState = 0x04,
    BadResource = 0x05,
    ResourceBusy = 0x06,
    OutOfLimit = 0x08,
    BadSize = 0x09,
    BadIndex = 0x0a,
    BadNonvolatileMemory = 0x0b,
    IcmError = 0x0c,
    BadQueuePairState = 0x10,
    BadSegmentParameter = 0x20,
    RegionBound = 0x21,
    NotPreparedYet = 0x22,
    BadPacket = 0x30,
    BadResourceState = 0x40,
    MultiFunctionRequestDenied = 0x50,
    /// The firmware returned a status this driver doesn't know.
    Io = 0xfd,
    /// A completion poll exhausted its retry ceiling.
    Timeout = 0xfe,
    /// A mailbox could not be allocated.
    OutOfMemory = 0xff,
}

impl CmdError {
    fn from_status(status: u8) -> Self {
        match Self::from_repr(status) {
            // the driver-generated variants never come from the card
            Some(Self::Io) | Some(Self::Timeout) | Some(Self::OutOfMemory) | None => Self::Io,
            Some(err) => err,
        }
    }
}

/// The mutable part of the command interface, shared across all users
/// of the card.
#[derive(Default)]
pub(super) struct CommandState {
    toggle: u32,
}

pub(super) struct CommandInterface<'a, H: Hal> {
    hal: &'a H,
    state: MutexGuard<'a, CommandState>,
}

impl<'a, H: Hal> CommandInterface<'a, H> {
    /// Acquire the command interface. Blocks while another holder exists.
    pub(super) fn new(hal: &'a H, state: &'a Mutex<CommandState>) -> Self {
        Self { hal, state: state.lock() }
    }

    /// Post a command without waiting for its completion.
    ///
    /// Any addresses passed here are *physical* ones,
    /// because the card has to work with them.
    pub(super) fn post(
        &mut self, in_param: u64, out_param: u64, input_modifier: u32,
        op_modifier: u8, opcode: Opcode, token: u16, want_event: bool,
    ) -> Result<(), CmdError> {
        if self.is_pending() {
            return Err(CmdError::ResourceBusy);
        }
        trace!("executing command: {opcode:?}");
        self.hal.write_config(
            HCR_BASE + HCR_IN_PARAM_OFFSET, (in_param >> 32) as u32,
        );
        self.hal.write_config(
            HCR_BASE + HCR_IN_PARAM_OFFSET + 4, in_param as u32,
        );
        self.hal.write_config(HCR_BASE + HCR_IN_MOD_OFFSET, input_modifier);
        self.hal.write_config(
            HCR_BASE + HCR_OUT_PARAM_OFFSET, (out_param >> 32) as u32,
        );
        self.hal.write_config(
            HCR_BASE + HCR_OUT_PARAM_OFFSET + 4, out_param as u32,
        );
        self.hal.write_config(
            HCR_BASE + HCR_TOKEN_OFFSET, u32::from(token) << 16,
        );
        // all parameters must be visible before the go bit
        compiler_fence(Ordering::SeqCst);
        self.state.toggle ^= 1;
        self.hal.write_config(
            HCR_BASE + HCR_STATUS_OFFSET,
            (1 << HCR_GO_BIT)
            | (u32::from(want_event) << HCR_E_BIT)
            | (self.state.toggle << HCR_T_BIT)
            | (u32::from(op_modifier) << HCR_OPMOD_SHIFT)
            | opcode as u32,
        );
        Ok(())
    }

    /// Busy-wait until the posted command completes and return its status.
    fn wait_for_completion(&mut self) -> Result<u8, CmdError> {
        for _ in 0..POLL_RETRIES {
            let status = self.hal.read_config(HCR_BASE + HCR_STATUS_OFFSET);
            if status & (1 << HCR_GO_BIT) == 0
                && (status >> HCR_T_BIT) & 1 == self.state.toggle
            {
                return Ok((status >> 24) as u8);
            }
            self.hal.delay_us(POLL_DELAY_US);
        }
        error!("command timed out");
        Err(CmdError::Timeout)
    }

    fn is_pending(&self) -> bool {
        let status = self.hal.read_config(HCR_BASE + HCR_STATUS_OFFSET);
        status & (1 << HCR_GO_BIT) != 0
            || (status >> HCR_T_BIT) & 1 != self.state.toggle
    }

    /// Post a command and wait for its completion.
    pub(super) fn execute_command<M, I, O>(
        &mut self, opcode: Opcode, op_modifier: M, input: I, input_modifier: u32,
    ) -> Result<O, CmdError>
    where
        M: OpcodeModifier,
        I: InputParameter,
        O: OutputParameter,
    {
        // the mailboxes must stay alive until the command completes
        let (in_param, _input_mailbox) = input.prepare()?;
        let (out_param, output_mailbox) = O::prepare()?;
        self.post(
            in_param, out_param, input_modifier, op_modifier.get(), opcode,
            POLL_TOKEN, false,
        )?;
        let status = self.wait_for_completion()?;
        if status != 0 {
            let err = CmdError::from_status(status);
            error!("command {opcode:?} failed: {err:?} ({status:#x})");
            return Err(err);
        }
        O::finish(self.hal, output_mailbox)
    }
}

pub(super) trait OpcodeModifier {
    fn get(&self) -> u8;
}

impl OpcodeModifier for () {
    fn get(&self) -> u8 {
        0
    }
}

bitflags! {
    pub(super) struct MadIfcOpcodeModifier: u8 {
        const DISABLE_MKEY_VALIDATION = 1 << 0;
        const DISABLE_BKEY_VALIDATION = 1 << 1;
    }
}

impl OpcodeModifier for MadIfcOpcodeModifier {
    fn get(&self) -> u8 {
        self.bits()
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug)]
#[allow(dead_code)]
pub(super) enum MadDemuxOpcodeModifier {
    Configure = 0,
    QueryState = 1,
    QueryRestrictions = 2,
}

impl OpcodeModifier for MadDemuxOpcodeModifier {
    fn get(&self) -> u8 {
        *self as _
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug)]
#[allow(dead_code)]
pub(super) enum SetPortOpcodeModifier {
    Ib = 0,
    Eth = 1,
    Beacon = 4,
}

impl OpcodeModifier for SetPortOpcodeModifier {
    fn get(&self) -> u8 {
        *self as _
    }
}

pub(super) trait InputParameter {
    /// Get the immediate input parameter, allocating a mailbox if needed.
    fn prepare(&self) -> Result<(u64, Option<DmaPages>), CmdError>;
}

impl InputParameter for () {
    fn prepare(&self) -> Result<(u64, Option<DmaPages>), CmdError> {
        Ok((0, None))
    }
}

impl InputParameter for u64 {
    fn prepare(&self) -> Result<(u64, Option<DmaPages>), CmdError> {
        Ok((*self, None))
    }
}

impl InputParameter for &[u8] {
    fn prepare(&self) -> Result<(u64, Option<DmaPages>), CmdError> {
        let (mut pages, physical) = create_contiguous_mapping(self.len())
            .map_err(|_| CmdError::OutOfMemory)?;
        pages
            .as_slice_mut(0, self.len())
            .map_err(|_| CmdError::OutOfMemory)?
            .copy_from_slice(self);
        Ok((physical.value() as u64, Some(pages)))
    }
}

pub(super) trait OutputParameter: Sized {
    /// Get the immediate output parameter, allocating a mailbox if needed.
    fn prepare() -> Result<(u64, Option<DmaPages>), CmdError>;
    /// Read the command output after successful completion.
    fn finish<H: Hal>(hal: &H, mailbox: Option<DmaPages>) -> Result<Self, CmdError>;
}

impl OutputParameter for () {
    fn prepare() -> Result<(u64, Option<DmaPages>), CmdError> {
        Ok((0, None))
    }

    fn finish<H: Hal>(_hal: &H, _mailbox: Option<DmaPages>) -> Result<Self, CmdError> {
        Ok(())
    }
}

impl OutputParameter for u64 {
    fn prepare() -> Result<(u64, Option<DmaPages>), CmdError> {
        Ok((0, None))
    }

    fn finish<H: Hal>(hal: &H, _mailbox: Option<DmaPages>) -> Result<Self, CmdError> {
        let hi = hal.read_config(HCR_BASE + HCR_OUT_PARAM_OFFSET);
        let lo = hal.read_config(HCR_BASE + HCR_OUT_PARAM_OFFSET + 4);
        Ok(u64::from(hi) << 32 | u64::from(lo))
    }
}

impl OutputParameter for DmaPages {
    fn prepare() -> Result<(u64, Option<DmaPages>), CmdError> {
        let (pages, physical) = create_contiguous_mapping(PAGE_SIZE)
            .map_err(|_| CmdError::OutOfMemory)?;
        Ok((physical.value() as u64, Some(pages)))
    }

    fn finish<H: Hal>(_hal: &H, mailbox: Option<DmaPages>) -> Result<Self, CmdError> {
        mailbox.ok_or(CmdError::InternalError)
    }
}

#[cfg(test)]
mod tests {
    use super::super::sim::SimDevice;
    use super::*;

    #[test]
    fn status_bytes_decode() {
        assert_eq!(CmdError::from_status(0x09), CmdError::BadSize);
        assert_eq!(CmdError::from_status(0x10), CmdError::BadQueuePairState);
        assert_eq!(CmdError::from_status(0x77), CmdError::Io);
    }

    #[test]
    fn successful_status_returns_output() {
        let hal = SimDevice::new();
        let state = Mutex::new(CommandState::default());
        let mut cmd = CommandInterface::new(&hal, &state);
        let res: Result<(), _> = cmd.execute_command(Opcode::RunFw, (), (), 0);
        assert!(res.is_ok());
    }

    #[test]
    fn error_status_decodes() {
        let hal = SimDevice::new();
        hal.force_status(0x09);
        let state = Mutex::new(CommandState::default());
        let mut cmd = CommandInterface::new(&hal, &state);
        let res: Result<(), _> = cmd.execute_command(Opcode::RunFw, (), (), 0);
        assert_eq!(res.unwrap_err(), CmdError::BadSize);
    }

    #[test]
    fn toggle_alternates_with_every_post() {
        let hal = SimDevice::new();
        let state = Mutex::new(CommandState::default());
        let mut cmd = CommandInterface::new(&hal, &state);
        for k in 1..=5u32 {
            let _: () = cmd.execute_command(Opcode::RunFw, (), (), 0).unwrap();
            assert_eq!(*hal.toggle_bits().last().unwrap(), k % 2);
        }
        assert_eq!(hal.toggle_bits(), [1, 0, 1, 0, 1]);
    }

    #[test]
    fn exhausted_poll_is_a_timeout() {
        let hal = SimDevice::new();
        hal.hang();
        let state = Mutex::new(CommandState::default());
        let mut cmd = CommandInterface::new(&hal, &state);
        let res: Result<(), _> = cmd.execute_command(Opcode::RunFw, (), (), 0);
        assert_eq!(res.unwrap_err(), CmdError::Timeout);
    }
}
