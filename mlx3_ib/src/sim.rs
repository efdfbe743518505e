//! A simulated card for the tests.
//!
//! The simulator keeps the Host Command Register file and completes every
//! command synchronously on the go-bit write: it clears the go bit, keeps
//! the toggle bit, fills in a status byte and serves canned responses for
//! the query commands. Mailboxes are reached through their physical
//! addresses, which equal the virtual ones here just like on the targeted
//! platforms.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;
use zerocopy::{AsBytes, FromBytes};

use super::cmd::Opcode;
use super::fw::Capabilities;
use super::hal::Hal;
use super::port::{MadPacket, MadPacketData, PortCapabilities};

const HCR_BASE: usize = 0x80680;
const HCR_SIZE: usize = 7 * 4;
const HCR_GO_BIT: u32 = 23;
const HCR_T_BIT: u32 = 21;

/// Register indices within the HCR file.
const IN_MOD: usize = 2;
const OUT_PARAM_HI: usize = 3;
const OUT_PARAM_LO: usize = 4;
const STATUS: usize = 6;

#[derive(Default)]
struct SimState {
    hcr: [u32; 7],
    forced_status: Option<u8>,
    hung: bool,
    /// the toggle bit of every go-bit write, in order
    toggles: Vec<u32>,
    /// every executed command as (opcode, input modifier)
    executed: Vec<(u16, u32)>,
    /// queue pair states, as the transition commands left them
    qp_states: BTreeMap<u32, u8>,
}

pub(super) struct SimDevice {
    state: Mutex<SimState>,
}

impl SimDevice {
    pub(super) fn new() -> Self {
        Self { state: Mutex::new(SimState::default()) }
    }

    /// Let every following command fail with this status byte.
    pub(super) fn force_status(&self, status: u8) {
        self.state.lock().forced_status = Some(status);
    }

    /// Never complete a command again.
    pub(super) fn hang(&self) {
        self.state.lock().hung = true;
    }

    /// The toggle bit of every posted command, in order.
    pub(super) fn toggle_bits(&self) -> Vec<u32> {
        self.state.lock().toggles.clone()
    }

    /// Every executed command as (opcode, input modifier), in order.
    pub(super) fn executed(&self) -> Vec<(u16, u32)> {
        self.state.lock().executed.clone()
    }

    fn execute(&self, state: &mut SimState, control: u32) {
        state.toggles.push((control >> HCR_T_BIT) & 1);
        if state.hung {
            state.hcr[STATUS] = control;
            return;
        }
        let opcode = (control & 0xfff) as u16;
        let input_modifier = state.hcr[IN_MOD];
        state.executed.push((opcode, input_modifier));
        let out_param = u64::from(state.hcr[OUT_PARAM_HI]) << 32
            | u64::from(state.hcr[OUT_PARAM_LO]);
        self.respond(state, opcode, input_modifier, out_param);
        let status = state.forced_status.unwrap_or(0);
        // clear the go bit, keep the toggle, report the status
        state.hcr[STATUS] = (control & !(1 << HCR_GO_BIT) & 0x00ff_ffff)
            | u32::from(status) << 24;
    }

    fn respond(
        &self, state: &mut SimState, opcode: u16, input_modifier: u32,
        out_param: u64,
    ) {
        match opcode {
            op if op == Opcode::QueryFw as u16 => {
                let mut fw = [0u8; 64];
                fw[0..2].copy_from_slice(&8u16.to_be_bytes()); // pages
                fw[2..4].copy_from_slice(&2u16.to_be_bytes()); // major
                fw[4..6].copy_from_slice(&0u16.to_be_bytes()); // sub-minor
                fw[6..8].copy_from_slice(&42u16.to_be_bytes()); // minor
                fw[10..12].copy_from_slice(&1u16.to_be_bytes()); // ix_rev
                fw[34..42].copy_from_slice(&0x2000u64.to_be_bytes());
                fw[42] = 0; // clear-interrupt register in BAR 0
                write_mailbox(out_param, &fw);
            },
            op if op == Opcode::QueryDevCap as u16 => {
                write_mailbox(out_param, &sim_capabilities().into_bytes());
            },
            op if op == Opcode::SetIcmSize as u16 => {
                // the auxiliary area wants 16 pages
                state.hcr[OUT_PARAM_HI] = 0;
                state.hcr[OUT_PARAM_LO] = 16;
            },
            op if op == Opcode::QueryAdapter as u16 => {
                let mut adapter = [0u8; 0x18];
                adapter[0x10] = 0; // INTA pin
                write_mailbox(out_param, &adapter);
            },
            op if op == Opcode::QueryPort as u16 => {
                let mut caps = PortCapabilities::new();
                caps.set_link_up(true);
                caps.set_ib(true);
                caps.set_ib_mtu(5);
                caps.set_ib_port_width(1);
                caps.set_log_max_gids(4);
                caps.set_log_max_pkeys(7);
                caps.set_max_vl_ib(4);
                write_mailbox(out_param, &caps.into_bytes());
            },
            op if op == Opcode::MadIfc as u16 => {
                let mut info = MadPacketData::new();
                info.set_lid(1);
                info.set_sm_lid(1);
                info.set_state(4); // active
                info.set_phys_state(5); // link up
                info.set_max_mtu(5);
                info.set_active_mtu(4);
                info.set_max_vl_num(4);
                info.set_active_width(1);
                info.set_active_speed(1);
                let mut packet = MadPacket::new_zeroed();
                packet.data = info.into_bytes();
                write_mailbox(out_param, packet.as_bytes());
            },
            op if op == Opcode::QueryQp as u16 => {
                let qpn = input_modifier & 0xffffff;
                let qp_state = state.qp_states.get(&qpn).copied().unwrap_or(0);
                // the context follows the mask and a reserved word
                write_mailbox(out_param + 8, &[qp_state << 4]);
            },
            op => {
                if let Some(qp_state) = transition_target(op) {
                    let qpn = input_modifier & 0xffffff;
                    state.qp_states.insert(qpn, qp_state);
                }
                // everything else succeeds without an answer
            },
        }
    }
}

/// The state a transition command leaves a queue pair in.
fn transition_target(opcode: u16) -> Option<u8> {
    Some(match opcode {
        op if op == Opcode::Rst2InitQp as u16 => 1,
        op if op == Opcode::Init2InitQp as u16 => 1,
        op if op == Opcode::Init2RtrQp as u16 => 2,
        op if op == Opcode::Rtr2RtsQp as u16 => 3,
        op if op == Opcode::Rts2RtsQp as u16 => 3,
        op if op == Opcode::Sqd2RtsQp as u16 => 3,
        op if op == Opcode::Sqerr2RtsQp as u16 => 3,
        op if op == Opcode::Rts2SqdQp as u16 => 5,
        op if op == Opcode::Sqd2SqdQp as u16 => 5,
        op if op == Opcode::Any2ErrQp as u16 => 6,
        op if op == Opcode::Any2RstQp as u16 => 0,
        _ => return None,
    })
}

/// A plausible capability page for a single-port card.
fn sim_capabilities() -> Capabilities {
    let mut caps = Capabilities::new();
    caps.set_log_max_qp_sz(16);
    caps.set_log_max_qp(17);
    caps.set_log2_rsvd_qps(2);
    caps.set_log2_rsvd_srqs(4);
    caps.set_num_rsvd_eqs(4);
    caps.set_log_max_cq_sz(16);
    caps.set_log2_rsvd_cqs(4);
    caps.set_log_max_cq(16);
    caps.set_log2_rsvd_eqs(2);
    caps.set_log_max_eq(5);
    caps.set_log2_rsvd_mtts(4);
    caps.set_log2_rsvd_mrws(4);
    caps.set_ack_delay(15);
    caps.set_num_ports(1);
    caps.set_log_max_msg(30);
    caps.set_max_gid(16);
    caps.set_max_sg_sq(32);
    caps.set_max_desc_sz_sq(1008);
    caps.set_max_sg_rq(32);
    caps.set_max_desc_sz_rq(512);
    caps.set_rdmarc_entry_sz(128);
    caps.set_qpc_entry_sz(256);
    caps.set_aux_entry_sz(128);
    caps.set_altc_entry_sz(64);
    caps.set_eqc_entry_sz(64);
    caps.set_cqc_entry_sz(128);
    caps.set_srq_entry_sz(128);
    caps.set_c_mpt_entry_sz(64);
    caps.set_mtt_entry_sz(8);
    caps.set_d_mpt_entry_sz(64);
    caps.set_rsvd_lkey(0x100);
    caps.set_max_icm_sz(1 << 44);
    caps.set_mad_demux(1);
    caps
}

/// Write an answer into a mailbox through its physical address.
fn write_mailbox(out_param: u64, bytes: &[u8]) {
    if out_param == 0 {
        return;
    }
    // mailboxes are identity-mapped DMA pages owned by the caller
    unsafe {
        core::ptr::copy_nonoverlapping(
            bytes.as_ptr(), out_param as *mut u8, bytes.len(),
        );
    }
}

impl Hal for SimDevice {
    fn read_config(&self, offset: usize) -> u32 {
        if (HCR_BASE..HCR_BASE + HCR_SIZE).contains(&offset) {
            return self.state.lock().hcr[(offset - HCR_BASE) / 4];
        }
        // the reset semaphore and the ownership register both read as free
        0
    }

    fn write_config(&self, offset: usize, value: u32) {
        if !(HCR_BASE..HCR_BASE + HCR_SIZE).contains(&offset) {
            return;
        }
        let index = (offset - HCR_BASE) / 4;
        let mut state = self.state.lock();
        state.hcr[index] = value;
        if index == STATUS && value & (1 << HCR_GO_BIT) != 0 {
            self.execute(&mut state, value);
        }
    }

    fn write_doorbell(&self, _offset: usize, _value: u32) {}

    fn write_blueflame(&self, _offset: usize, _data: &[u8]) {}

    fn read_vendor_id(&self) -> u16 {
        super::MLX_VEND
    }

    fn delay_us(&self, _us: u32) {}
}
