//! Structs and constants for working with InfiniBand hardware.
//!
//! The definitions follow the libibverbs vocabulary so that code written
//! against them reads like userspace verbs code, but they carry no
//! hardware knowledge of their own.

#![no_std]
#![allow(non_camel_case_types)]

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;
use strum_macros::FromRepr;

pub mod ibv_qp_type {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Type {
        IBV_QPT_RC, IBV_QPT_UC, IBV_QPT_UD,
    }
    pub use Type::IBV_QPT_RC;
    pub use Type::IBV_QPT_UC;
    pub use Type::IBV_QPT_UD;
}

pub type __be64 = u64;

#[derive(Clone, Copy, Debug, Default)]
pub struct ibv_qp_cap {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

bitflags! {
    #[derive(Default, Clone, Copy, Debug)]
    pub struct ibv_access_flags: i32 {
        const IBV_ACCESS_LOCAL_WRITE = 1;
        const IBV_ACCESS_REMOTE_WRITE = 2;
        const IBV_ACCESS_REMOTE_READ = 4;
        const IBV_ACCESS_REMOTE_ATOMIC = 8;
        const IBV_ACCESS_MW_BIND = 16;
        const IBV_ACCESS_ZERO_BASED = 32;
        const IBV_ACCESS_ON_DEMAND = 64;
        const IBV_ACCESS_HUGETLB = 128;
        const IBV_ACCESS_RELAXED_ORDERING = 1048576;
    }
}

/// Device-wide attributes, as reported by `ibv_query_device`.
#[derive(Clone, Debug, Default)]
pub struct ibv_device_attr {
    pub fw_ver: String,
    pub node_guid: __be64,
    pub sys_image_guid: __be64,
    pub max_mr_size: u64,
    pub page_size_cap: u64,
    pub vendor_id: u32,
    pub vendor_part_id: u32,
    pub hw_ver: u32,
    pub max_qp: i32,
    pub max_qp_wr: i32,
    pub max_sge: i32,
    pub max_cq: i32,
    pub max_cqe: i32,
    pub max_mr: i32,
    pub max_pd: i32,
    pub local_ca_ack_delay: u8,
    pub phys_port_cnt: u8,
}

#[repr(u8)]
#[derive(Clone, Copy, Default, Debug, FromRepr, PartialEq, Eq)]
pub enum ibv_mtu {
    Mtu256 = 1,
    Mtu512 = 2,
    Mtu1024 = 3,
    Mtu2048 = 4,
    #[default]
    Mtu4096 = 5,
}

#[repr(i32)]
#[derive(Clone, Copy, Default, Debug, FromRepr, PartialEq, Eq)]
pub enum ibv_port_state {
    #[default]
    IBV_PORT_NOP = 0,
    IBV_PORT_DOWN = 1,
    IBV_PORT_INIT = 2,
    IBV_PORT_ARMED = 3,
    IBV_PORT_ACTIVE = 4,
    IBV_PORT_ACTIVE_DEFER = 5,
}

/// The state of the physical link, from PortInfo.
#[repr(u8)]
#[derive(Clone, Copy, Default, Debug, FromRepr, PartialEq, Eq)]
pub enum PhysicalPortState {
    #[default]
    Nop = 0,
    Sleep = 1,
    Polling = 2,
    Disabled = 3,
    PortConfigurationTraining = 4,
    LinkUp = 5,
    LinkErrorRecovery = 6,
    PhyTest = 7,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ibv_gid {
    pub raw: [u8; 16],
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ibv_global_route {
    pub dgid: ibv_gid,
    pub flow_label: u32,
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ibv_ah_attr {
    pub grh: ibv_global_route,
    pub dlid: u16,
    pub sl: u8,
    pub src_path_bits: u8,
    pub static_rate: u8,
    pub is_global: u8,
    pub port_num: u8,
}

/// Queue pair attributes, passed to `modify_qp`.
///
/// Only the fields selected by the accompanying [`ibv_qp_attr_mask`]
/// are taken into account.
#[derive(Clone, Debug, Default)]
pub struct ibv_qp_attr {
    pub qp_state: ibv_qp_state,
    pub cur_qp_state: ibv_qp_state,
    pub path_mtu: ibv_mtu,
    pub qkey: u32,
    pub rq_psn: u32,
    pub sq_psn: u32,
    pub dest_qp_num: u32,
    pub qp_access_flags: ibv_access_flags,
    pub cap: ibv_qp_cap,
    pub ah_attr: ibv_ah_attr,
    pub alt_ah_attr: ibv_ah_attr,
    pub pkey_index: u16,
    pub alt_pkey_index: u16,
    pub en_sqd_async_notify: u8,
    pub max_rd_atomic: u8,
    pub max_dest_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub port_num: u8,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub alt_port_num: u8,
    pub alt_timeout: u8,
}

bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct ibv_qp_attr_mask: u32 {
        const IBV_QP_STATE = 1;
        const IBV_QP_ACCESS_FLAGS = 8;
        const IBV_QP_PKEY_INDEX = 16;
        const IBV_QP_PORT = 32;
        const IBV_QP_QKEY = 64;
        const IBV_QP_AV = 128;
        const IBV_QP_PATH_MTU = 256;
        const IBV_QP_TIMEOUT = 512;
        const IBV_QP_RETRY_CNT = 1024;
        const IBV_QP_RNR_RETRY = 2048;
        const IBV_QP_RQ_PSN = 4096;
        const IBV_QP_MAX_QP_RD_ATOMIC = 8192;
        const IBV_QP_ALT_PATH = 16384;
        const IBV_QP_MIN_RNR_TIMER = 32768;
        const IBV_QP_SQ_PSN = 65536;
        const IBV_QP_MAX_DEST_RD_ATOMIC = 131072;
        const IBV_QP_CAP = 524288;
        const IBV_QP_DEST_QPN = 1048576;
    }
}

#[derive(Clone, Debug, Default)]
pub struct ibv_port_attr {
    pub state: ibv_port_state,
    pub max_mtu: ibv_mtu,
    pub active_mtu: ibv_mtu,
    pub gid_tbl_len: i32,
    pub port_cap_flags: u32,
    pub max_msg_sz: u32,
    pub bad_pkey_cntr: u32,
    pub qkey_viol_cntr: u32,
    pub pkey_tbl_len: u16,
    pub lid: u16,
    pub sm_lid: u16,
    pub lmc: u8,
    pub max_vl_num: u8,
    pub sm_sl: u8,
    pub subnet_timeout: u8,
    pub init_type_reply: u8,
    pub active_width: u8,
    pub active_speed: u8,
    pub phys_state: u8,
    pub link_layer: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ibv_qp_state {
    #[default]
    IBV_QPS_RESET,
    IBV_QPS_INIT,
    IBV_QPS_RTR,
    IBV_QPS_RTS,
    IBV_QPS_SQD,
    IBV_QPS_ERR,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ibv_wr_opcode {
    IBV_WR_RDMA_WRITE,
    IBV_WR_RDMA_WRITE_WITH_IMM,
    IBV_WR_SEND,
    IBV_WR_SEND_WITH_IMM,
    IBV_WR_RDMA_READ,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default)]
    pub struct ibv_send_flags: u32 {
        const IBV_SEND_FENCE = 1;
        const IBV_SEND_SIGNALED = 2;
        const IBV_SEND_SOLICITED = 4;
        const IBV_SEND_INLINE = 8;
        const IBV_SEND_IP_CSUM = 16;
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ibv_sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// The destination of a datagram send.
#[derive(Clone, Copy, Debug, Default)]
pub struct ibv_send_wr_wr_ah {
    pub port: u8,
    pub dlid: u16,
    pub slid: u16,
}

/// The transport-specific part of a send work request.
#[derive(Clone, Copy, Debug)]
pub enum ibv_send_wr_wr {
    rdma {
        remote_addr: u64,
        rkey: u32,
    },
    atomic {
        remote_addr: u64,
        compare_add: u64,
        swap: u64,
        rkey: u32,
    },
    ud {
        ah: ibv_send_wr_wr_ah,
        remote_qpn: u32,
        remote_qkey: u32,
    },
}

impl Default for ibv_send_wr_wr {
    fn default() -> Self {
        Self::rdma { remote_addr: 0, rkey: 0 }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ibv_send_wr {
    pub wr_id: u64,
    pub sg_list: Vec<ibv_sge>,
    pub opcode: Option<ibv_wr_opcode>,
    pub send_flags: ibv_send_flags,
    pub imm_data: u32,
    pub wr: ibv_send_wr_wr,
}

#[derive(Clone, Debug, Default)]
pub struct ibv_recv_wr {
    pub wr_id: u64,
    pub sg_list: Vec<ibv_sge>,
}

pub mod ibv_wc_status {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Type {
        IBV_WC_SUCCESS,
        IBV_WC_LOC_LEN_ERR,
        IBV_WC_LOC_QP_OP_ERR,
        IBV_WC_LOC_PROT_ERR,
        IBV_WC_WR_FLUSH_ERR,
        IBV_WC_MW_BIND_ERR,
        IBV_WC_BAD_RESP_ERR,
        IBV_WC_LOC_ACCESS_ERR,
        IBV_WC_REM_INV_REQ_ERR,
        IBV_WC_REM_ACCESS_ERR,
        IBV_WC_REM_OP_ERR,
        IBV_WC_RETRY_EXC_ERR,
        IBV_WC_RNR_RETRY_EXC_ERR,
        IBV_WC_REM_ABORT_ERR,
        IBV_WC_GENERAL_ERR,
    }
    pub use Type::*;
}

pub mod ibv_wc_opcode {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Type {
        IBV_WC_SEND,
        IBV_WC_RDMA_WRITE,
        IBV_WC_RDMA_READ,
        IBV_WC_COMP_SWAP,
        IBV_WC_FETCH_ADD,
        IBV_WC_BIND_MW,
        IBV_WC_LOCAL_INV,
        IBV_WC_RECV,
        IBV_WC_RECV_RDMA_WITH_IMM,
    }
    pub use Type::*;
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default)]
    pub struct ibv_wc_flags: u32 {
        const IBV_WC_GRH = 1;
        const IBV_WC_WITH_IMM = 2;
    }
}

/// A work completion.
#[derive(Clone, Copy, Debug)]
pub struct ibv_wc {
    pub wr_id: u64,
    pub status: ibv_wc_status::Type,
    pub opcode: ibv_wc_opcode::Type,
    pub vendor_err: u32,
    pub byte_len: u32,
    pub imm_data: u32,
    pub qp_num: u32,
    pub src_qp: u32,
    pub wc_flags: ibv_wc_flags,
    pub pkey_index: u16,
    pub slid: u16,
    pub sl: u8,
    pub dlid_path_bits: u8,
}

impl ibv_wc {
    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    pub fn len(&self) -> usize {
        self.byte_len as _
    }

    pub fn is_valid(&self) -> bool {
        self.status == ibv_wc_status::IBV_WC_SUCCESS
    }

    /// Get the error, if this completion failed.
    pub fn error(&self) -> Option<(ibv_wc_status::Type, u32)> {
        match self.status {
            ibv_wc_status::IBV_WC_SUCCESS => None,
            status => Some((status, self.vendor_err)),
        }
    }

    pub fn opcode(&self) -> ibv_wc_opcode::Type {
        self.opcode
    }

    pub fn imm_data(&self) -> Option<u32> {
        if self.is_valid() && self.wc_flags.contains(ibv_wc_flags::IBV_WC_WITH_IMM) {
            Some(self.imm_data)
        } else {
            None
        }
    }
}

impl Default for ibv_wc {
    fn default() -> Self {
        Self {
            wr_id: 0,
            status: ibv_wc_status::IBV_WC_GENERAL_ERR,
            opcode: ibv_wc_opcode::IBV_WC_SEND,
            vendor_err: 0,
            byte_len: 0,
            imm_data: 0,
            qp_num: 0,
            src_qp: 0,
            wc_flags: ibv_wc_flags::empty(),
            pkey_index: 0,
            slid: 0,
            sl: 0,
            dlid_path_bits: 0,
        }
    }
}
