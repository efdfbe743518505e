//! A driver for the Mellanox ConnectX-3 InfiniBand host channel adapter.
//!
//! The platform hands the card to [`ConnectX3Nic::new`] behind the [`Hal`]
//! trait and gets back the verbs: completion queues, queue pairs, memory
//! regions and the post/poll calls operating on them. On top of those sits
//! a small datagram convenience layer that manages its own queues.
//!
//! The command interface is polled; no interrupt handler is registered.

#![cfg_attr(not(test), no_std)]
extern crate alloc;

#[macro_use] extern crate log;

mod cmd;
mod completion_queue;
mod device;
mod dma;
mod event_queue;
mod fw;
mod hal;
mod icm;
mod mcg;
mod port;
mod profile;
mod queue_pair;
#[cfg(test)]
mod sim;
mod wqe;

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use mlx_infiniband::{
    ibv_device_attr, ibv_port_attr, ibv_qp_attr, ibv_qp_attr_mask,
    ibv_qp_cap, ibv_qp_state, ibv_qp_type, ibv_recv_wr, ibv_send_flags,
    ibv_send_wr, ibv_send_wr_wr, ibv_send_wr_wr_ah, ibv_sge, ibv_wc,
    ibv_wc_opcode, ibv_wc_status, ibv_wr_opcode,
};
use spin::Mutex;

use cmd::{CommandInterface, CommandState};
use completion_queue::CompletionQueue;
use device::{Ownership, ResetRegisters};
use dma::{create_contiguous_mapping, DmaPages, PhysicalAddress, PAGE_SIZE};
use event_queue::{init_eqs, Event, EventQueue};
use fw::{BlueFlame, Capabilities, Firmware, Hca, MappedFirmwareArea};
use icm::{MappedIcmTables, MemoryRegion};
use port::Port;
use profile::Profile;
use queue_pair::{DoorbellStrategy, QueuePair};
use wqe::UdHeader;

pub use hal::Hal;

pub(crate) use event_queue::Offsets;

/// Vendor ID for Mellanox
pub const MLX_VEND: u16 = 0x15b3;
/// Device ID for the ConnectX-3 NIC
pub const CONNECTX3_DEV: u16 = 0x1003;

/// Size of the bounce region backing the datagram convenience layer.
const BOUNCE_REGION_SIZE: usize = 512 * 1024;
/// Largest payload the convenience layer sends or receives.
const DATAGRAM_SLOT_SIZE: usize = 2048;
/// Receive descriptors kept posted per datagram flow.
const DATAGRAM_RING_ENTRIES: usize = 64;
/// Bytes of the bounce region one flow occupies: a send slot in front
/// of the receive ring.
const FLOW_STRIP_SIZE: usize = DATAGRAM_SLOT_SIZE * (1 + DATAGRAM_RING_ENTRIES);

/// A memory region as handed out to users of the driver.
///
/// The keys go into scatter-gather entries; `addr` is the start of the
/// backing buffer in the address space the card sees.
#[derive(Clone, Copy, Debug)]
pub struct RegionHandle {
    pub lkey: u32,
    pub rkey: u32,
    pub addr: u64,
    pub length: u64,
}

/// The destination of the datagram convenience layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TransmitContext {
    pub port: u8,
    pub destination_lid: u16,
    pub destination_qpn: u32,
    pub queue_key: u32,
}

/// The queues serving one datagram destination.
#[derive(Clone, Copy, Debug)]
struct UdFlow {
    qpn: u32,
    cqn: u32,
    /// byte offset of this flow's strip within the bounce region
    base: usize,
}

/// The queue pair carrying raw sends with software-built headers.
#[derive(Clone, Copy, Debug)]
struct SpecialFlow {
    qpn: u32,
    psn: u32,
}

/// Struct representing a ConnectX-3 card
pub struct ConnectX3Nic<H: Hal> {
    hal: H,
    command_state: Mutex<CommandState>,
    firmware: Firmware,
    firmware_area: Option<MappedFirmwareArea>,
    capabilities: Capabilities,
    inta_pin: u8,
    offsets: Offsets,
    icm_tables: Option<MappedIcmTables>,
    hca: Option<Hca>,
    blueflame: BlueFlame,
    eqs: Vec<EventQueue>,
    ports: Vec<Port>,
    completion_queues: Vec<CompletionQueue>,
    queue_pairs: Vec<QueuePair>,
    regions: Vec<(MemoryRegion, DmaPages, usize)>,
    bounce_region: Option<(MemoryRegion, DmaPages, PhysicalAddress)>,
    bounce_cursor: usize,
    flows: BTreeMap<(u16, u32), UdFlow>,
    special: Option<SpecialFlow>,
}

impl<H: Hal> ConnectX3Nic<H> {
    /// Bring the card up: reset it, run the firmware, lay out the ICM,
    /// initialize the HCA and open all ports.
    pub fn new(hal: H) -> Result<Self, &'static str> {
        let command_state = Mutex::new(CommandState::default());
        ResetRegisters::reset(&hal)?;
        Ownership::get(&hal)?;
        let mut cmd = CommandInterface::new(&hal, &command_state);
        let firmware = Firmware::query(&mut cmd)?;
        let mut firmware_area = firmware.clone().map_area(&mut cmd)?;
        firmware_area.run(&mut cmd)?;
        let capabilities = firmware_area.query_capabilities(&mut cmd)?;
        let mut offsets = Offsets::init(&capabilities);
        let profile = Profile::new(&capabilities)?;
        let aux_pages = firmware_area.set_icm(&mut cmd, profile.total_size)?;
        let icm_aux_area = firmware_area.map_icm_aux(&mut cmd, aux_pages)?;
        let mut icm_tables = icm_aux_area.map_icm_tables(
            &mut cmd, &profile.init_hca, &capabilities,
        )?;
        let hca = profile.init_hca.init_hca(&mut cmd, &capabilities)?;
        let adapter = hca.query_adapter(&mut cmd)?;
        hca.config_mad_demux(&mut cmd, &capabilities)?;
        let (_num_uars, blueflame) = capabilities.get_doorbells_and_blueflame();
        let eqs = init_eqs(
            &mut cmd, &capabilities, &mut offsets, icm_tables.memory_regions(),
        )?;

        // one region backs all convenience-layer buffers
        let (pages, physical) = create_contiguous_mapping(BOUNCE_REGION_SIZE)?;
        let region = icm_tables.memory_regions().create_region(
            &mut cmd, &capabilities, offsets.alloc_dmpt(), 0,
            physical.value() as u64, BOUNCE_REGION_SIZE as u64,
            BOUNCE_REGION_SIZE / PAGE_SIZE, physical,
        )?;

        let ports = hca.init_ports(&mut cmd, &capabilities)?;
        drop(cmd);

        let nic = Self {
            hal,
            command_state,
            firmware,
            firmware_area: Some(firmware_area),
            capabilities,
            inta_pin: adapter.inta_pin(),
            offsets,
            icm_tables: Some(icm_tables),
            hca: Some(hca),
            blueflame,
            eqs,
            ports,
            completion_queues: Vec::new(),
            queue_pairs: Vec::new(),
            regions: Vec::new(),
            bounce_region: Some((region, pages, physical)),
            bounce_cursor: 0,
            flows: BTreeMap::new(),
            special: None,
        };
        debug!("mlx3 card is up");
        Ok(nic)
    }

    /// Get the general attributes of the card.
    ///
    /// This is used by ibv_query_device.
    pub fn query_device(&self) -> Result<ibv_device_attr, &'static str> {
        let (major, minor, sub_minor) = self.firmware.version();
        let caps = &self.capabilities;
        Ok(ibv_device_attr {
            fw_ver: alloc::format!("{major}.{minor}.{sub_minor}"),
            vendor_id: MLX_VEND.into(),
            vendor_part_id: CONNECTX3_DEV.into(),
            max_qp: 1 << caps.log_max_qp(),
            max_qp_wr: 1 << caps.log_max_qp_sz(),
            max_sge: caps.max_sg_sq().into(),
            max_cq: 1 << caps.log_max_cq(),
            max_cqe: 1 << caps.log_max_cq_sz(),
            local_ca_ack_delay: caps.ack_delay() & 0x1f,
            phys_port_cnt: caps.num_ports(),
            ..Default::default()
        })
    }

    /// Get the attributes of one port.
    ///
    /// This is used by ibv_query_port.
    pub fn query_port(&mut self, number: u8) -> Result<ibv_port_attr, &'static str> {
        let mut cmd = CommandInterface::new(&self.hal, &self.command_state);
        let port = self.ports
            .iter_mut()
            .find(|port| port.number() == number)
            .ok_or("no such port")?;
        port.query(&mut cmd)
    }

    /// Log the device and per-port attributes.
    pub fn characteristics(&mut self) -> Result<(), &'static str> {
        let device = self.query_device()?;
        info!("device: {device:?}");
        let numbers: Vec<u8> = self.ports.iter().map(|p| p.number()).collect();
        for number in numbers {
            let attr = self.query_port(number)?;
            info!("port {number}: {attr:?}");
        }
        Ok(())
    }

    /// Create a completion queue with room for `num_entries` completions
    /// and arm it. Returns its number.
    pub fn create_cq(&mut self, num_entries: usize) -> Result<u32, &'static str> {
        let mut cmd = CommandInterface::new(&self.hal, &self.command_state);
        let icm_tables = self.icm_tables.as_mut().ok_or("device is closed")?;
        let mut cq = CompletionQueue::new(
            &mut cmd, &self.capabilities, &mut self.offsets,
            icm_tables.memory_regions(), self.eqs.first(), num_entries,
        )?;
        cq.arm(&self.hal)?;
        let number = cq.number().try_into().unwrap();
        self.completion_queues.push(cq);
        Ok(number)
    }

    /// Drain up to `max` completions from a completion queue.
    ///
    /// This is used by ibv_poll_cq.
    pub fn poll_cq(&mut self, cqn: u32, max: usize) -> Result<Vec<ibv_wc>, &'static str> {
        self.service_event_queues()?;
        let cq = self.completion_queues
            .iter_mut()
            .find(|cq| cq.number() == cqn as usize)
            .ok_or("no such completion queue")?;
        let completions = cq.poll(max)?;
        // retire the requests so the rings make room again
        for wc in &completions {
            let Some(qp) = self.queue_pairs
                .iter_mut()
                .find(|qp| qp.number() == wc.qp_num & 0xffffff)
            else {
                continue;
            };
            match wc.opcode {
                ibv_wc_opcode::IBV_WC_RECV
                | ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => {
                    qp.note_receive_completion()
                },
                _ => qp.note_send_completion(),
            }
        }
        Ok(completions)
    }

    /// Destroy a completion queue.
    pub fn destroy_cq(&mut self, cqn: u32) -> Result<(), &'static str> {
        let position = self.completion_queues
            .iter()
            .position(|cq| cq.number() == cqn as usize)
            .ok_or("no such completion queue")?;
        let mut cmd = CommandInterface::new(&self.hal, &self.command_state);
        self.completion_queues.swap_remove(position).destroy(&mut cmd)
    }

    /// Create a queue pair attached to the given completion queues.
    /// Returns its number.
    ///
    /// `cap` is updated to the geometry the rings actually got.
    pub fn create_qp(
        &mut self, qp_type: ibv_qp_type::Type, send_cqn: u32, recv_cqn: u32,
        cap: &mut ibv_qp_cap,
    ) -> Result<u32, &'static str> {
        let mut cmd = CommandInterface::new(&self.hal, &self.command_state);
        let send_cq = self.completion_queues
            .iter()
            .find(|cq| cq.number() == send_cqn as usize)
            .ok_or("no such send completion queue")?;
        let receive_cq = self.completion_queues
            .iter()
            .find(|cq| cq.number() == recv_cqn as usize)
            .ok_or("no such receive completion queue")?;
        let icm_tables = self.icm_tables.as_mut().ok_or("device is closed")?;
        let strategy = DoorbellStrategy::new(
            &self.blueflame, self.queue_pairs.len(),
        );
        let qp = QueuePair::new(
            &mut cmd, &self.capabilities, &mut self.offsets,
            icm_tables.memory_regions(), qp_type, send_cq, receive_cq, cap,
            strategy,
        )?;
        let number = qp.number();
        self.queue_pairs.push(qp);
        Ok(number)
    }

    /// Transition a queue pair, applying the masked attributes.
    ///
    /// This is used by ibv_modify_qp.
    pub fn modify_qp(
        &mut self, qpn: u32, attr: &ibv_qp_attr, attr_mask: ibv_qp_attr_mask,
    ) -> Result<(), &'static str> {
        let mut cmd = CommandInterface::new(&self.hal, &self.command_state);
        let qp = self.queue_pairs
            .iter_mut()
            .find(|qp| qp.number() == qpn)
            .ok_or("no such queue pair")?;
        qp.modify(&mut cmd, attr, attr_mask)
    }

    /// Ask the card about the current attributes of a queue pair.
    ///
    /// This is used by ibv_query_qp.
    pub fn query_qp(&mut self, qpn: u32) -> Result<ibv_qp_attr, &'static str> {
        let mut cmd = CommandInterface::new(&self.hal, &self.command_state);
        let qp = self.queue_pairs
            .iter_mut()
            .find(|qp| qp.number() == qpn)
            .ok_or("no such queue pair")?;
        qp.query(&mut cmd)
    }

    /// Destroy a queue pair, resetting it first if needed.
    pub fn destroy_qp(&mut self, qpn: u32) -> Result<(), &'static str> {
        let position = self.queue_pairs
            .iter()
            .position(|qp| qp.number() == qpn)
            .ok_or("no such queue pair")?;
        let mut cmd = CommandInterface::new(&self.hal, &self.command_state);
        self.queue_pairs.swap_remove(position).destroy(&mut cmd)
    }

    /// Allocate a buffer of at least `size` bytes and register it with
    /// the card.
    ///
    /// This is used by ibv_reg_mr, except that the driver owns the buffer.
    pub fn create_mr(&mut self, size: usize) -> Result<RegionHandle, &'static str> {
        let size = size.next_multiple_of(PAGE_SIZE);
        let (pages, physical) = create_contiguous_mapping(size)?;
        let mut cmd = CommandInterface::new(&self.hal, &self.command_state);
        let icm_tables = self.icm_tables.as_mut().ok_or("device is closed")?;
        let region = icm_tables.memory_regions().create_region(
            &mut cmd, &self.capabilities, self.offsets.alloc_dmpt(), 0,
            physical.value() as u64, size as u64, size / PAGE_SIZE, physical,
        )?;
        let handle = RegionHandle {
            lkey: region.lkey,
            rkey: region.rkey,
            addr: physical.value() as u64,
            length: size as u64,
        };
        self.regions.push((region, pages, size));
        Ok(handle)
    }

    /// Access the buffer behind a region created with [`Self::create_mr`].
    pub fn region_buffer(&mut self, lkey: u32) -> Result<&mut [u8], &'static str> {
        let (_, pages, size) = self.regions
            .iter_mut()
            .find(|(region, _, _)| region.lkey == lkey)
            .ok_or("no such memory region")?;
        pages.as_slice_mut(0, *size)
    }

    /// Unregister a memory region and free its buffer.
    pub fn destroy_mr(&mut self, lkey: u32) -> Result<(), &'static str> {
        let position = self.regions
            .iter()
            .position(|(region, _, _)| region.lkey == lkey)
            .ok_or("no such memory region")?;
        let (region, pages, _) = self.regions.swap_remove(position);
        let mut cmd = CommandInterface::new(&self.hal, &self.command_state);
        self.icm_tables
            .as_mut()
            .ok_or("device is closed")?
            .memory_regions()
            .destroy_region(&mut cmd, region)?;
        drop(pages);
        Ok(())
    }

    /// Post a send work request to a queue pair.
    ///
    /// Returns the descriptor index the completion will carry.
    pub fn post_send(
        &mut self, qpn: u32, wr: &ibv_send_wr,
    ) -> Result<u32, &'static str> {
        let qp = self.queue_pairs
            .iter_mut()
            .find(|qp| qp.number() == qpn)
            .ok_or("no such queue pair")?;
        qp.post_send(&self.hal, wr)
    }

    /// Post a receive work request to a queue pair.
    pub fn post_receive(
        &mut self, qpn: u32, wr: &ibv_recv_wr,
    ) -> Result<u32, &'static str> {
        let qp = self.queue_pairs
            .iter_mut()
            .find(|qp| qp.number() == qpn)
            .ok_or("no such queue pair")?;
        qp.post_receive(wr)
    }

    /// Send a datagram, letting the driver manage the queues and buffers.
    ///
    /// The first send to a destination creates its queues; later sends
    /// reuse them.
    pub fn send(
        &mut self, ctx: &TransmitContext, payload: &[u8],
    ) -> Result<(), &'static str> {
        if payload.len() > DATAGRAM_SLOT_SIZE {
            return Err("payload exceeds the datagram slot");
        }
        let flow = self.get_or_create_flow(ctx)?;
        let (region, pages, physical) = self.bounce_region
            .as_mut()
            .ok_or("device is closed")?;
        let lkey = region.lkey;
        let addr = physical.value() as u64 + flow.base as u64;
        pages
            .as_slice_mut(flow.base, payload.len())?
            .copy_from_slice(payload);
        let wr = ibv_send_wr {
            wr_id: 0,
            sg_list: vec![ibv_sge {
                addr,
                length: payload.len() as u32,
                lkey,
            }],
            opcode: Some(ibv_wr_opcode::IBV_WR_SEND),
            send_flags: ibv_send_flags::IBV_SEND_SIGNALED,
            imm_data: 0,
            wr: ibv_send_wr_wr::ud {
                ah: ibv_send_wr_wr_ah {
                    port: ctx.port,
                    dlid: ctx.destination_lid,
                    slid: 0,
                },
                remote_qpn: ctx.destination_qpn,
                remote_qkey: ctx.queue_key,
            },
        };
        self.post_send(flow.qpn, &wr)?;
        Ok(())
    }

    /// Take the next datagram received from this destination, if any.
    ///
    /// The consumed receive descriptor is reposted right away.
    pub fn receive(
        &mut self, ctx: &TransmitContext,
    ) -> Result<Option<Vec<u8>>, &'static str> {
        let flow = self.get_or_create_flow(ctx)?;
        let completions = self.poll_cq(flow.cqn, DATAGRAM_RING_ENTRIES)?;
        let mut payload = None;
        for wc in completions {
            if wc.opcode != ibv_wc_opcode::IBV_WC_RECV {
                continue;
            }
            let offset = flow.base
                + DATAGRAM_SLOT_SIZE * (1 + wc.wr_id as usize);
            let (region, pages, physical) = self.bounce_region
                .as_ref()
                .ok_or("device is closed")?;
            let lkey = region.lkey;
            let addr = physical.value() as u64 + offset as u64;
            if payload.is_none()
                && wc.status == ibv_wc_status::IBV_WC_SUCCESS {
                payload = Some(
                    pages.as_slice(offset, wc.byte_len as usize)?.to_vec()
                );
            }
            self.post_receive(flow.qpn, &ibv_recv_wr {
                wr_id: wc.wr_id,
                sg_list: vec![ibv_sge {
                    addr,
                    length: DATAGRAM_SLOT_SIZE as u32,
                    lkey,
                }],
            })?;
        }
        Ok(payload)
    }

    /// Send a datagram with the wire headers built in software, through
    /// the special queue pair.
    pub fn send_raw(
        &mut self, ctx: &TransmitContext, payload: &[u8],
    ) -> Result<(), &'static str> {
        // the well-known GSI queue key
        const SPECIAL_QKEY: u32 = 0x8001_0000;

        if self.special.is_none() {
            let cqn = self.create_cq(DATAGRAM_RING_ENTRIES)?;
            let mut cap = ibv_qp_cap {
                max_send_wr: DATAGRAM_RING_ENTRIES as u32,
                max_recv_wr: 1,
                max_send_sge: 1,
                max_recv_sge: 1,
                max_inline_data: 0,
            };
            let qpn = self.create_qp(
                ibv_qp_type::IBV_QPT_UD, cqn, cqn, &mut cap,
            )?;
            {
                let mut cmd = CommandInterface::new(
                    &self.hal, &self.command_state,
                );
                let qp = self.queue_pairs
                    .iter_mut()
                    .find(|qp| qp.number() == qpn)
                    .ok_or("no such queue pair")?;
                qp.make_special(&mut cmd)?;
            }
            self.modify_qp(qpn, &ibv_qp_attr {
                qp_state: ibv_qp_state::IBV_QPS_INIT,
                qkey: SPECIAL_QKEY,
                pkey_index: 0,
                ..Default::default()
            }, ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_QKEY
                | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX)?;
            self.modify_qp(qpn, &ibv_qp_attr {
                qp_state: ibv_qp_state::IBV_QPS_RTR,
                ..Default::default()
            }, ibv_qp_attr_mask::IBV_QP_STATE)?;
            self.modify_qp(qpn, &ibv_qp_attr {
                qp_state: ibv_qp_state::IBV_QPS_RTS,
                sq_psn: 0,
                ..Default::default()
            }, ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_SQ_PSN)?;
            self.special = Some(SpecialFlow { qpn, psn: 0 });
        }

        let source_lid = self.query_port(ctx.port)?.lid;
        let special = self.special.as_mut().unwrap();
        let psn = special.psn;
        special.psn = special.psn.wrapping_add(1) & 0xffffff;
        let header = UdHeader::new(
            source_lid, ctx.destination_lid, 0, 0xffff, ctx.destination_qpn,
            special.qpn, ctx.queue_key, psn, payload.len(),
        );
        let qpn = special.qpn;
        let qp = self.queue_pairs
            .iter_mut()
            .find(|qp| qp.number() == qpn)
            .ok_or("no such queue pair")?;
        qp.post_send_special(&self.hal, &header, payload)?;
        Ok(())
    }

    /// Shut the card down, releasing every resource in reverse order.
    pub fn close(mut self) -> Result<(), &'static str> {
        self.teardown()
    }

    /// Lazily set up the queues for a datagram destination.
    fn get_or_create_flow(
        &mut self, ctx: &TransmitContext,
    ) -> Result<UdFlow, &'static str> {
        let key = (ctx.destination_lid, ctx.destination_qpn);
        if let Some(flow) = self.flows.get(&key) {
            return Ok(*flow);
        }
        if self.bounce_cursor + FLOW_STRIP_SIZE > BOUNCE_REGION_SIZE {
            return Err("too many datagram destinations");
        }
        let base = self.bounce_cursor;
        let cqn = self.create_cq(2 * DATAGRAM_RING_ENTRIES)?;
        let mut cap = ibv_qp_cap {
            max_send_wr: DATAGRAM_RING_ENTRIES as u32,
            max_recv_wr: DATAGRAM_RING_ENTRIES as u32,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        };
        let qpn = self.create_qp(ibv_qp_type::IBV_QPT_UD, cqn, cqn, &mut cap)?;
        self.modify_qp(qpn, &ibv_qp_attr {
            qp_state: ibv_qp_state::IBV_QPS_INIT,
            qkey: ctx.queue_key,
            pkey_index: 0,
            ..Default::default()
        }, ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_QKEY
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX)?;

        // keep the receive ring full before any traffic can arrive
        let (region, _, physical) = self.bounce_region
            .as_ref()
            .ok_or("device is closed")?;
        let lkey = region.lkey;
        let addr = physical.value() as u64;
        for i in 0..DATAGRAM_RING_ENTRIES {
            let offset = base + DATAGRAM_SLOT_SIZE * (1 + i);
            self.post_receive(qpn, &ibv_recv_wr {
                wr_id: i as u64,
                sg_list: vec![ibv_sge {
                    addr: addr + offset as u64,
                    length: DATAGRAM_SLOT_SIZE as u32,
                    lkey,
                }],
            })?;
        }

        self.modify_qp(qpn, &ibv_qp_attr {
            qp_state: ibv_qp_state::IBV_QPS_RTR,
            ..Default::default()
        }, ibv_qp_attr_mask::IBV_QP_STATE)?;
        self.modify_qp(qpn, &ibv_qp_attr {
            qp_state: ibv_qp_state::IBV_QPS_RTS,
            sq_psn: 0,
            ..Default::default()
        }, ibv_qp_attr_mask::IBV_QP_STATE | ibv_qp_attr_mask::IBV_QP_SQ_PSN)?;

        self.bounce_cursor += FLOW_STRIP_SIZE;
        let flow = UdFlow { qpn, cqn, base };
        self.flows.insert(key, flow);
        trace!("created datagram flow {flow:?} for {ctx:?}");
        Ok(flow)
    }

    /// Acknowledge the interrupt, drain all event queues and dispatch
    /// their events.
    fn service_event_queues(&mut self) -> Result<(), &'static str> {
        for eq in self.eqs.iter_mut() {
            eq.service(&self.hal, &self.firmware, self.inta_pin)?;
            while let Some(event) = eq.pop_event() {
                match event {
                    Event::Completion { cqn } => {
                        // re-arm so the next completion raises an event
                        if let Some(cq) = self.completion_queues
                            .iter_mut()
                            .find(|cq| cq.number() == cqn as usize) {
                            cq.arm(&self.hal)?;
                        }
                    },
                    Event::PortChange { port, active } => {
                        info!("port {port} changed: active = {active}");
                    },
                    // commands are polled, their events need no handling
                    Event::CommandComplete { .. } => {},
                    other => warn!("unhandled event: {other:?}"),
                }
            }
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), &'static str> {
        let mut cmd = CommandInterface::new(&self.hal, &self.command_state);
        while let Some(qp) = self.queue_pairs.pop() {
            qp.destroy(&mut cmd)?;
        }
        while let Some(cq) = self.completion_queues.pop() {
            cq.destroy(&mut cmd)?;
        }
        while let Some((region, pages, _)) = self.regions.pop() {
            self.icm_tables
                .as_mut()
                .unwrap()
                .memory_regions()
                .destroy_region(&mut cmd, region)?;
            drop(pages);
        }
        if let Some((region, pages, _)) = self.bounce_region.take() {
            self.icm_tables
                .as_mut()
                .unwrap()
                .memory_regions()
                .destroy_region(&mut cmd, region)?;
            drop(pages);
        }
        while let Some(port) = self.ports.pop() {
            port.close(&mut cmd)?;
        }
        while let Some(eq) = self.eqs.pop() {
            eq.destroy(&mut cmd)?;
        }
        if let Some(hca) = self.hca.take() {
            hca.close(&mut cmd)?;
        }
        if let Some(icm_tables) = self.icm_tables.take() {
            icm_tables.unmap(&mut cmd)?;
        }
        if let Some(firmware_area) = self.firmware_area.take() {
            firmware_area.unmap(&mut cmd)?;
        }
        debug!("mlx3 card is down");
        Ok(())
    }
}

impl<H: Hal> Drop for ConnectX3Nic<H> {
    fn drop(&mut self) {
        if self.firmware_area.is_some() {
            panic!("please close instead of dropping")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmd::Opcode;
    use mlx_infiniband::ibv_mtu;
    use sim::SimDevice;

    fn opcodes(sim: &SimDevice) -> Vec<u16> {
        sim.executed().iter().map(|(opcode, _)| *opcode).collect()
    }

    #[test]
    fn bring_up_and_teardown_run_in_order() {
        let sim = SimDevice::new();
        let nic = ConnectX3Nic::new(&sim).unwrap();
        let ops = opcodes(&sim);
        let position = |op: Opcode| {
            ops.iter().position(|&o| o == op as u16).unwrap()
        };
        assert!(position(Opcode::QueryFw) < position(Opcode::RunFw));
        assert!(position(Opcode::RunFw) < position(Opcode::QueryDevCap));
        assert!(position(Opcode::QueryDevCap) < position(Opcode::InitHca));
        assert!(position(Opcode::InitHca) < position(Opcode::InitPort));

        nic.close().unwrap();
        let ops = opcodes(&sim);
        let position = |op: Opcode| {
            ops.iter().position(|&o| o == op as u16).unwrap()
        };
        assert!(position(Opcode::ClosePort) < position(Opcode::CloseHca));
        assert!(position(Opcode::CloseHca) < position(Opcode::UnmapIcmAux));
        assert_eq!(*ops.last().unwrap(), Opcode::UnmapFa as u16);
    }

    #[test]
    fn device_attributes_follow_the_firmware() {
        let sim = SimDevice::new();
        let nic = ConnectX3Nic::new(&sim).unwrap();
        let attr = nic.query_device().unwrap();
        assert_eq!(attr.fw_ver, "2.42.0");
        assert_eq!(attr.vendor_id, u32::from(MLX_VEND));
        assert_eq!(attr.phys_port_cnt, 1);
        nic.close().unwrap();
    }

    #[test]
    fn port_reports_an_active_link() {
        let sim = SimDevice::new();
        let mut nic = ConnectX3Nic::new(&sim).unwrap();
        let attr = nic.query_port(1).unwrap();
        assert_eq!(attr.lid, 1);
        assert_eq!(attr.active_mtu, ibv_mtu::Mtu2048);
        nic.characteristics().unwrap();
        nic.close().unwrap();
    }

    #[test]
    fn modify_walks_the_state_ladder() {
        let sim = SimDevice::new();
        let mut nic = ConnectX3Nic::new(&sim).unwrap();
        let cqn = nic.create_cq(32).unwrap();
        let mut cap = ibv_qp_cap {
            max_send_wr: 16,
            max_recv_wr: 16,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        };
        let qpn = nic.create_qp(
            ibv_qp_type::IBV_QPT_UD, cqn, cqn, &mut cap,
        ).unwrap();

        nic.modify_qp(qpn, &ibv_qp_attr {
            qp_state: ibv_qp_state::IBV_QPS_INIT,
            qkey: 7,
            ..Default::default()
        }, ibv_qp_attr_mask::IBV_QP_STATE | ibv_qp_attr_mask::IBV_QP_QKEY)
            .unwrap();
        nic.modify_qp(qpn, &ibv_qp_attr {
            qp_state: ibv_qp_state::IBV_QPS_RTR,
            ..Default::default()
        }, ibv_qp_attr_mask::IBV_QP_STATE).unwrap();
        nic.modify_qp(qpn, &ibv_qp_attr {
            qp_state: ibv_qp_state::IBV_QPS_RTS,
            ..Default::default()
        }, ibv_qp_attr_mask::IBV_QP_STATE).unwrap();

        let ops = opcodes(&sim);
        assert_eq!(&ops[ops.len() - 3..], &[
            Opcode::Rst2InitQp as u16,
            Opcode::Init2RtrQp as u16,
            Opcode::Rtr2RtsQp as u16,
        ]);
        // the card agrees about the state
        let attr = nic.query_qp(qpn).unwrap();
        assert_eq!(attr.qp_state, ibv_qp_state::IBV_QPS_RTS);
        nic.close().unwrap();
    }

    #[test]
    fn skipping_a_state_issues_no_command() {
        let sim = SimDevice::new();
        let mut nic = ConnectX3Nic::new(&sim).unwrap();
        let cqn = nic.create_cq(32).unwrap();
        let mut cap = ibv_qp_cap {
            max_send_wr: 16,
            max_recv_wr: 16,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        };
        let qpn = nic.create_qp(
            ibv_qp_type::IBV_QPT_UD, cqn, cqn, &mut cap,
        ).unwrap();
        let before = sim.executed().len();
        assert!(nic.modify_qp(qpn, &ibv_qp_attr {
            qp_state: ibv_qp_state::IBV_QPS_RTS,
            ..Default::default()
        }, ibv_qp_attr_mask::IBV_QP_STATE).is_err());
        assert_eq!(sim.executed().len(), before);
        nic.close().unwrap();
    }

    #[test]
    fn send_needs_a_ready_queue_pair() {
        let sim = SimDevice::new();
        let mut nic = ConnectX3Nic::new(&sim).unwrap();
        let cqn = nic.create_cq(32).unwrap();
        let mut cap = ibv_qp_cap {
            max_send_wr: 16,
            max_recv_wr: 16,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        };
        let qpn = nic.create_qp(
            ibv_qp_type::IBV_QPT_UD, cqn, cqn, &mut cap,
        ).unwrap();
        let mr = nic.create_mr(64).unwrap();
        nic.region_buffer(mr.lkey).unwrap()[..5].copy_from_slice(b"hello");
        let wr = ibv_send_wr {
            wr_id: 1,
            sg_list: vec![ibv_sge { addr: mr.addr, length: 5, lkey: mr.lkey }],
            opcode: Some(ibv_wr_opcode::IBV_WR_SEND),
            send_flags: ibv_send_flags::IBV_SEND_SIGNALED,
            imm_data: 0,
            wr: ibv_send_wr_wr::ud {
                ah: ibv_send_wr_wr_ah { port: 1, dlid: 3, slid: 0 },
                remote_qpn: 0x48,
                remote_qkey: 0x1111,
            },
        };
        assert!(nic.post_send(qpn, &wr).is_err());

        nic.modify_qp(qpn, &ibv_qp_attr {
            qp_state: ibv_qp_state::IBV_QPS_INIT,
            qkey: 0x1111,
            ..Default::default()
        }, ibv_qp_attr_mask::IBV_QP_STATE | ibv_qp_attr_mask::IBV_QP_QKEY)
            .unwrap();
        nic.modify_qp(qpn, &ibv_qp_attr {
            qp_state: ibv_qp_state::IBV_QPS_RTR,
            ..Default::default()
        }, ibv_qp_attr_mask::IBV_QP_STATE).unwrap();
        nic.modify_qp(qpn, &ibv_qp_attr {
            qp_state: ibv_qp_state::IBV_QPS_RTS,
            ..Default::default()
        }, ibv_qp_attr_mask::IBV_QP_STATE).unwrap();
        assert_eq!(nic.post_send(qpn, &wr).unwrap(), 0);
        nic.close().unwrap();
    }

    #[test]
    fn datagram_layer_reuses_its_queues() {
        let sim = SimDevice::new();
        let mut nic = ConnectX3Nic::new(&sim).unwrap();
        let ctx = TransmitContext {
            port: 1,
            destination_lid: 2,
            destination_qpn: 0x48,
            queue_key: 0x1111_1111,
        };
        nic.send(&ctx, b"hello").unwrap();
        nic.send(&ctx, b"again").unwrap();
        assert_eq!(nic.queue_pairs.len(), 1);
        assert_eq!(nic.flows.len(), 1);
        // nothing arrived, so there is nothing to receive
        assert_eq!(nic.receive(&ctx).unwrap(), None);
        nic.close().unwrap();
    }

    #[test]
    fn raw_send_configures_the_special_queue_pair() {
        let sim = SimDevice::new();
        let mut nic = ConnectX3Nic::new(&sim).unwrap();
        let ctx = TransmitContext {
            port: 1,
            destination_lid: 2,
            destination_qpn: 0,
            queue_key: 0x8001_0000,
        };
        nic.send_raw(&ctx, &[0; 64]).unwrap();
        let ops = opcodes(&sim);
        assert!(ops.contains(&(Opcode::ConfSpecialQp as u16)));
        // the queue pair is set up only once
        let before = ops.iter()
            .filter(|&&op| op == Opcode::ConfSpecialQp as u16)
            .count();
        nic.send_raw(&ctx, &[1; 64]).unwrap();
        let after = opcodes(&sim).iter()
            .filter(|&&op| op == Opcode::ConfSpecialQp as u16)
            .count();
        assert_eq!(before, after);
        nic.close().unwrap();
    }
}
