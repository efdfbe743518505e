//! Queue pairs: the send and receive work queues and their state machine.
//!
//! A queue pair moves through Reset, Init, Ready-to-Receive and
//! Ready-to-Send; each legal transition has its own firmware command and
//! anything else is refused here, before talking to the card. Resetting
//! is the exception: it is allowed from every state.

use core::mem::size_of;

use bitflags::bitflags;
use byteorder::BigEndian;
use mlx_infiniband::{
    ibv_access_flags, ibv_qp_attr, ibv_qp_attr_mask, ibv_qp_cap, ibv_qp_state,
    ibv_qp_type, ibv_recv_wr, ibv_send_wr, ibv_send_wr_wr, ibv_wr_opcode,
};
use modular_bitfield_msb::{
    bitfield,
    prelude::{
        B12, B16, B17, B19, B2, B20, B24, B3, B4, B40, B48, B5, B56, B6, B7,
        B72, BitfieldSpecifier,
    },
};
use zerocopy::{AsBytes, FromBytes, U16, U32, U64};

use super::{
    cmd::{CommandInterface, Opcode},
    completion_queue::CompletionQueue,
    device::{uar_index_to_hw, PAGE_SHIFT},
    dma::{create_contiguous_mapping, DmaPages, PhysicalAddress, PAGE_SIZE},
    fw::{doorbell_offset, BlueFlame, Capabilities, DOORBELL_SEND_QUEUE_NUMBER},
    hal::Hal,
    icm::{MrTable, ICM_PAGE_SHIFT},
    wqe::UdHeader,
    Offsets,
};

const IB_SQ_MIN_WQE_SHIFT: u32 = 6;
const IB_MAX_HEADROOM: u32 = 2048;
const IB_SQ_MAX_SPARE: u32 = ib_sq_headroom(IB_SQ_MIN_WQE_SHIFT);

/// Referring to this lkey bypasses address translation entirely.
const INVALID_LKEY: u32 = 0x100;

const fn ib_sq_headroom(shift: u32) -> u32 {
    (IB_MAX_HEADROOM >> shift) + 1
}

/// How a send is announced to the card.
#[derive(Debug)]
pub(super) enum DoorbellStrategy {
    /// Write the queue number to the send doorbell.
    Doorbell,
    /// Copy the whole work request into a BlueFlame register,
    /// alternating between the two halves.
    BlueFlame {
        register_offset: usize,
        register_size: usize,
        second_half: bool,
    },
}

impl DoorbellStrategy {
    /// Pick BlueFlame when registers are available.
    pub(super) fn new(blueflame: &BlueFlame, index: usize) -> Self {
        if blueflame.available() {
            Self::BlueFlame {
                register_offset: blueflame.register_offset(index),
                register_size: blueflame.reg_size(),
                second_half: false,
            }
        } else {
            Self::Doorbell
        }
    }
}

#[derive(Debug)]
pub(super) struct QueuePair {
    number: u32,
    state: ibv_qp_state,
    qp_type: ibv_qp_type::Type,
    sq: WorkQueue,
    rq: WorkQueue,
    send_cq_number: u32,
    receive_cq_number: u32,
    memory: Option<(DmaPages, PhysicalAddress)>,
    uar_idx: usize,
    doorbell_page: DmaPages,
    doorbell_address: PhysicalAddress,
    mtt: u64,
    doorbell_strategy: DoorbellStrategy,
}

impl QueuePair {
    /// Create a new queue pair.
    ///
    /// This includes allocating the area for the buffer itself and
    /// allocating an MTT entry for the buffer.
    ///
    /// This is similar to creating a completion queue or an event queue.
    pub(super) fn new<H: Hal>(
        cmd: &mut CommandInterface<H>, caps: &Capabilities,
        offsets: &mut Offsets, memory_regions: &mut MrTable,
        qp_type: ibv_qp_type::Type, send_cq: &CompletionQueue,
        receive_cq: &CompletionQueue, ib_caps: &mut ibv_qp_cap,
        doorbell_strategy: DoorbellStrategy,
    ) -> Result<Self, &'static str> {
        let number = offsets.alloc_qpn().try_into().unwrap();
        let uar_idx = offsets.alloc_scq_db();
        let state = ibv_qp_state::IBV_QPS_RESET;
        let send_cq_number = send_cq.number().try_into().unwrap();
        let receive_cq_number = receive_cq.number().try_into().unwrap();
        let mut rq = WorkQueue::new_receive_queue(caps, ib_caps)?;
        let mut sq = WorkQueue::new_send_queue(caps, ib_caps, qp_type)?;
        if rq.wqe_shift > sq.wqe_shift {
            rq.offset = 0;
            sq.offset = rq.size();
        } else {
            rq.offset = sq.size();
            sq.offset = 0;
        }
        let buf_size = (rq.size() + sq.size()) as usize;
        let memory = create_contiguous_mapping(buf_size)?;
        let mtt = memory_regions.alloc_mtt(
            cmd, caps, buf_size.next_multiple_of(PAGE_SIZE) / PAGE_SIZE,
            memory.1,
        )?;
        let (mut doorbell_page, doorbell_address) = create_contiguous_mapping(
            size_of::<QueuePairDoorbell>(),
        )?;
        let doorbell: &mut QueuePairDoorbell = doorbell_page
            .as_type_mut(0)?;
        doorbell.receive_wqe_index.set(0);
        let qp = Self {
            number, state, qp_type, sq, rq, send_cq_number,
            receive_cq_number, memory: Some(memory), uar_idx,
            doorbell_page, doorbell_address, mtt, doorbell_strategy,
        };
        trace!("created new QP: {qp:?}");
        Ok(qp)
    }

    /// Modify this queue pair.
    ///
    /// This is used by ibv_modify_qp.
    pub(super) fn modify<H: Hal>(
        &mut self, cmd: &mut CommandInterface<H>,
        attr: &ibv_qp_attr, attr_mask: ibv_qp_attr_mask,
    ) -> Result<(), &'static str> {
        const _PATH_MIGRATION_STATE_ARMED: u8 = 0x0;
        const _PATH_MIGRATION_STATE_REARM: u8 = 0x1;
        const PATH_MIGRATION_STATE_MIGRATED: u8 = 0x3;

        let target = if attr_mask.contains(ibv_qp_attr_mask::IBV_QP_STATE) {
            attr.qp_state
        } else {
            self.state
        };
        // refuse illegal transitions before issuing any command
        let opcode = transition_opcode(self.state, target)
            .ok_or("invalid state transition")?;

        if opcode == Opcode::Any2RstQp {
            // resetting needs no context at all
            cmd.execute_command::<_, _, ()>(opcode, (), (), self.number)?;
            self.state = ibv_qp_state::IBV_QPS_RESET;
            self.sq.head = 0;
            self.sq.tail = 0;
            self.rq.head = 0;
            self.rq.tail = 0;
            trace!("QP {} is now in {:?}", self.number, self.state);
            return Ok(());
        }

        let mut context = QueuePairContext::new();
        let mut param_mask = OptionalParameterMask::empty();
        let mut input_modifier = self.number;
        match opcode {
            Opcode::Rst2InitQp => {
                context.set_service_type(match self.qp_type {
                    ibv_qp_type::IBV_QPT_RC => 0x0,
                    ibv_qp_type::IBV_QPT_UC => 0x1,
                    ibv_qp_type::IBV_QPT_UD => 0x3,
                });
                context.set_path_migration_state(PATH_MIGRATION_STATE_MIGRATED);
                context.set_usr_page(
                    uar_index_to_hw(self.uar_idx).try_into().unwrap()
                );
                context.set_cqn_send(self.send_cq_number);
                context.set_cqn_receive(self.receive_cq_number);
                if attr_mask.contains(ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS) {
                    self.set_access_flags(&mut context, attr.qp_access_flags);
                }
                if self.qp_type == ibv_qp_type::IBV_QPT_UD {
                    if !attr_mask.contains(ibv_qp_attr_mask::IBV_QP_QKEY) {
                        return Err("datagram queue pairs need a qkey");
                    }
                    context.set_qkey(attr.qkey);
                }
                if attr_mask.contains(ibv_qp_attr_mask::IBV_QP_PKEY_INDEX) {
                    let mut primary_path = context.primary_path_one();
                    primary_path.set_pkey_index(
                        attr.pkey_index.try_into().unwrap()
                    );
                    context.set_primary_path_one(primary_path);
                }
                assert_ne!(self.sq.wqe_cnt, 0);
                context.set_log_sq_size(
                    self.sq.wqe_cnt.ilog2().try_into().unwrap()
                );
                assert_ne!(self.rq.wqe_cnt, 0);
                context.set_log_rq_size(
                    self.rq.wqe_cnt.ilog2().try_into().unwrap()
                );
                context.set_log_sq_stride(
                    (self.sq.wqe_shift - 4).try_into().unwrap()
                );
                context.set_log_rq_stride(
                    (self.rq.wqe_shift - 4).try_into().unwrap()
                );
                // since we can't allocate protection domains,
                // allow using the reserved lkey to refer directly to
                // physical addresses
                context.set_reserved_lkey(true);
                context.set_sq_no_prefetch(false);
                context.set_log_page_size(PAGE_SHIFT - ICM_PAGE_SHIFT);
                context.set_mtt_base_addr(self.mtt);
                context.set_db_record_addr(
                    self.doorbell_address.value().try_into().unwrap()
                );

                // Before passing the QP to the HW, make sure that the
                // ownership bits of the send queue are set and the SQ
                // headroom is stamped so that the hardware doesn't start
                // processing stale work requests.
                let memory = self.memory.as_mut().unwrap();
                for i in 0..self.sq.wqe_cnt {
                    let ctrl = self.sq.get_control_segment(memory, i)?;
                    ctrl.owner_opcode.set(1 << 31);
                    ctrl.vlan_cv_f_ds.set(1 << (self.sq.wqe_shift - 4));
                    self.sq.stamp_wqe(memory, i)?;
                }
            },
            Opcode::Init2InitQp => {
                if self.qp_type == ibv_qp_type::IBV_QPT_UD
                    && attr_mask.contains(ibv_qp_attr_mask::IBV_QP_QKEY) {
                    context.set_qkey(attr.qkey);
                    param_mask.insert(OptionalParameterMask::QKEY);
                }
                if attr_mask.contains(ibv_qp_attr_mask::IBV_QP_PKEY_INDEX) {
                    let mut primary_path = context.primary_path_one();
                    primary_path.set_pkey_index(
                        attr.pkey_index.try_into().unwrap()
                    );
                    context.set_primary_path_one(primary_path);
                    param_mask.insert(OptionalParameterMask::PKEY_INDEX);
                }
                if (self.qp_type == ibv_qp_type::IBV_QPT_RC
                    || self.qp_type == ibv_qp_type::IBV_QPT_UC)
                    && attr_mask.contains(ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS)
                {
                    self.set_access_flags(&mut context, attr.qp_access_flags);
                    param_mask.insert(OptionalParameterMask::REMOTE_READ);
                    param_mask.insert(OptionalParameterMask::REMOTE_WRITE);
                    param_mask.insert(OptionalParameterMask::REMOTE_ATOMIC);
                }
            },
            Opcode::Init2RtrQp => {
                if self.qp_type == ibv_qp_type::IBV_QPT_UD {
                    // datagrams are always fragmented to the path MTU
                    context.set_mtu(ibv_mtu_to_hw(mlx_infiniband::ibv_mtu::Mtu4096));
                    context.set_msg_max(12);
                } else {
                    if !attr_mask.contains(ibv_qp_attr_mask::IBV_QP_PATH_MTU) {
                        return Err("connected queue pairs need a path MTU");
                    }
                    context.set_mtu(ibv_mtu_to_hw(attr.path_mtu));
                    context.set_msg_max(30);
                }
                if attr_mask.contains(ibv_qp_attr_mask::IBV_QP_DEST_QPN) {
                    context.set_remote_qpn(attr.dest_qp_num);
                }
                if attr_mask.contains(ibv_qp_attr_mask::IBV_QP_AV) {
                    let mut primary_path = context.primary_path_one();
                    primary_path.set_rlid(attr.ah_attr.dlid);
                    primary_path.set_grh(attr.ah_attr.is_global != 0);
                    context.set_primary_path_one(primary_path);
                    let mut primary_path = context.primary_path_two();
                    primary_path.set_sched_queue(
                        0x83
                            | (attr.ah_attr.port_num.saturating_sub(1)) << 6
                            | (attr.ah_attr.sl & 0xf) << 2
                    );
                    context.set_primary_path_two(primary_path);
                }
                if attr_mask.contains(ibv_qp_attr_mask::IBV_QP_RQ_PSN) {
                    context.set_next_recv_psn(attr.rq_psn);
                }
                if attr_mask.contains(ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER) {
                    context.set_rnr_nak(attr.min_rnr_timer & 0x1f);
                    param_mask.insert(OptionalParameterMask::RNR_TIMEOUT);
                }
                if self.qp_type == ibv_qp_type::IBV_QPT_UD
                    && attr_mask.contains(ibv_qp_attr_mask::IBV_QP_QKEY) {
                    context.set_qkey(attr.qkey);
                    param_mask.insert(OptionalParameterMask::QKEY);
                }
            },
            Opcode::Rtr2RtsQp | Opcode::Sqd2RtsQp => {
                if attr_mask.contains(ibv_qp_attr_mask::IBV_QP_SQ_PSN) {
                    context.set_next_send_psn(attr.sq_psn);
                }
                if attr_mask.contains(ibv_qp_attr_mask::IBV_QP_TIMEOUT) {
                    let mut primary_path = context.primary_path_one();
                    primary_path.set_ack_timeout(attr.timeout & 0x1f);
                    context.set_primary_path_one(primary_path);
                    param_mask.insert(OptionalParameterMask::ACK_TIMEOUT);
                }
                if self.qp_type == ibv_qp_type::IBV_QPT_UD
                    && attr_mask.contains(ibv_qp_attr_mask::IBV_QP_QKEY) {
                    context.set_qkey(attr.qkey);
                    param_mask.insert(OptionalParameterMask::QKEY);
                }
            },
            Opcode::Rts2SqdQp => {
                // ask for an event once the send queue really drained
                if attr.en_sqd_async_notify != 0 {
                    input_modifier |= 1 << 31;
                }
            },
            Opcode::Rts2RtsQp | Opcode::Sqd2SqdQp | Opcode::Any2ErrQp => {},
            _ => unreachable!(),
        }

        // actually execute the command
        let mut input = StateTransitionCommandParameter::new_zeroed();
        input.opt_param_mask.set(param_mask.bits());
        input.qpc_data = context.into_bytes();
        cmd.execute_command::<_, _, ()>(opcode, (), input.as_bytes(), input_modifier)?;
        self.state = target;
        trace!("QP {} is now in {:?}", self.number, self.state);
        Ok(())
    }

    fn set_access_flags(
        &self, context: &mut QueuePairContext, flags: ibv_access_flags,
    ) {
        context.set_remote_read(
            flags.contains(ibv_access_flags::IBV_ACCESS_REMOTE_READ)
        );
        context.set_remote_write(
            flags.contains(ibv_access_flags::IBV_ACCESS_REMOTE_WRITE)
        );
        context.set_remote_atomic(
            flags.contains(ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC)
        );
    }

    /// Ask the card about the current state of this queue pair.
    ///
    /// This is used by ibv_query_qp.
    pub(super) fn query<H: Hal>(
        &mut self, cmd: &mut CommandInterface<H>,
    ) -> Result<ibv_qp_attr, &'static str> {
        let page: DmaPages = cmd.execute_command(
            Opcode::QueryQp, (), (), self.number,
        )?;
        // the context follows the parameter mask and a reserved word
        let context = QueuePairContext::from_bytes(
            page.as_slice(8, 248)?.try_into().unwrap()
        );
        let state = match context.state() {
            0 => ibv_qp_state::IBV_QPS_RESET,
            1 => ibv_qp_state::IBV_QPS_INIT,
            2 => ibv_qp_state::IBV_QPS_RTR,
            3 => ibv_qp_state::IBV_QPS_RTS,
            5 => ibv_qp_state::IBV_QPS_SQD,
            6 => ibv_qp_state::IBV_QPS_ERR,
            _ => return Err("card reported an unknown state"),
        };
        Ok(ibv_qp_attr {
            qp_state: state,
            cur_qp_state: state,
            dest_qp_num: context.remote_qpn(),
            qkey: context.qkey(),
            rq_psn: context.next_recv_psn(),
            sq_psn: context.next_send_psn(),
            cap: ibv_qp_cap {
                max_send_wr: self.sq.max_post,
                max_recv_wr: self.rq.max_post,
                max_send_sge: self.sq.max_gs,
                max_recv_sge: self.rq.max_gs,
                max_inline_data: 0,
            },
            ..Default::default()
        })
    }

    /// Post a send work request and ring the doorbell.
    ///
    /// Returns the index the completion will refer to.
    pub(super) fn post_send<H: Hal>(
        &mut self, hal: &H, wr: &ibv_send_wr,
    ) -> Result<u32, &'static str> {
        const CTRL_FENCE: u32 = 1 << 6;
        const SRCRB_FLAG_CQ_UPDATE: u32 = 3 << 2;
        const SRCRB_FLAG_SOLICITED: u32 = 1 << 1;
        use mlx_infiniband::ibv_send_flags;

        if self.state != ibv_qp_state::IBV_QPS_RTS {
            return Err("queue pair is not ready to send");
        }
        if self.sq.would_overflow(1) {
            return Err("send queue is full");
        }
        if wr.sg_list.len() > self.sq.max_gs as usize {
            return Err("too many scatter-gather entries");
        }
        let opcode = send_opcode(wr)?;

        let index = self.sq.head & (self.sq.wqe_cnt - 1);
        let wqe_base = (self.sq.offset + (index << self.sq.wqe_shift)) as usize;
        let mut offset = wqe_base + size_of::<WqeControlSegment>();
        let memory = self.memory.as_mut().unwrap();

        // the transport-specific segment comes right after the control one
        match (self.qp_type, &wr.wr) {
            (ibv_qp_type::IBV_QPT_UD, ibv_send_wr_wr::ud {
                ah, remote_qpn, remote_qkey,
            }) => {
                let mut seg = WqeDatagramSegment::new_zeroed();
                seg.port_pd.set(u32::from(ah.port) << 24);
                seg.g_slid = (ah.slid & 0x7f) as u8;
                seg.dlid.set(ah.dlid);
                seg.dst_qpn.set(*remote_qpn);
                seg.qkey.set(*remote_qkey);
                memory.0
                    .as_slice_mut(offset, size_of::<WqeDatagramSegment>())?
                    .copy_from_slice(seg.as_bytes());
                offset += size_of::<WqeDatagramSegment>();
            },
            (ibv_qp_type::IBV_QPT_UD, _) => {
                return Err("datagram sends need a destination");
            },
            (_, ibv_send_wr_wr::rdma { remote_addr, rkey }) if matches!(
                wr.opcode,
                Some(ibv_wr_opcode::IBV_WR_RDMA_WRITE)
                | Some(ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM)
                | Some(ibv_wr_opcode::IBV_WR_RDMA_READ)
            ) => {
                let mut seg = WqeRemoteAddressSegment::new_zeroed();
                seg.va.set(*remote_addr);
                seg.key.set(*rkey);
                memory.0
                    .as_slice_mut(offset, size_of::<WqeRemoteAddressSegment>())?
                    .copy_from_slice(seg.as_bytes());
                offset += size_of::<WqeRemoteAddressSegment>();
            },
            _ => {},
        }

        // Write the data segments in reverse order, so that the first
        // one, which comes last in memory from the card's point of view,
        // is written last.
        let data_base = offset;
        for (i, sge) in wr.sg_list.iter().enumerate().rev() {
            let mut seg = WqeDataSegment::new_zeroed();
            seg.byte_count.set(sge.length);
            seg.lkey.set(sge.lkey);
            seg.addr.set(sge.addr);
            memory.0
                .as_slice_mut(
                    data_base + i * size_of::<WqeDataSegment>(),
                    size_of::<WqeDataSegment>(),
                )?
                .copy_from_slice(seg.as_bytes());
        }
        offset = data_base + wr.sg_list.len() * size_of::<WqeDataSegment>();

        let size_in_16 = ((offset - wqe_base) / 16) as u32;
        let mut word1 = size_in_16;
        if wr.send_flags.contains(ibv_send_flags::IBV_SEND_FENCE) {
            word1 |= CTRL_FENCE;
        }
        let mut flags = 0;
        if wr.send_flags.contains(ibv_send_flags::IBV_SEND_SIGNALED) {
            flags |= SRCRB_FLAG_CQ_UPDATE;
        }
        if wr.send_flags.contains(ibv_send_flags::IBV_SEND_SOLICITED) {
            flags |= SRCRB_FLAG_SOLICITED;
        }
        let immediate = match wr.opcode {
            Some(ibv_wr_opcode::IBV_WR_SEND_WITH_IMM)
            | Some(ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM) => wr.imm_data,
            _ => 0,
        };
        // the ownership bit alternates with every pass over the ring
        let owner = if self.sq.head & self.sq.wqe_cnt != 0 { 1 << 31 } else { 0 };

        let ctrl = self.sq.get_control_segment(memory, index)?;
        ctrl.vlan_cv_f_ds.set(word1);
        ctrl.flags.set(flags);
        ctrl.flags2.set(immediate);
        // all other descriptor fields are written before the card
        // can see the request
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
        let ctrl = self.sq.get_control_segment(memory, index)?;
        ctrl.owner_opcode.set(opcode as u32 | owner);

        // keep the headroom stamped
        if let Some(spare_wqes) = self.sq.spare_wqes {
            let spare = (self.sq.head + spare_wqes) & (self.sq.wqe_cnt - 1);
            self.sq.stamp_wqe(memory, spare)?;
        }
        self.sq.head = self.sq.head.wrapping_add(1);

        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
        match &mut self.doorbell_strategy {
            DoorbellStrategy::Doorbell => {
                hal.write_doorbell(
                    doorbell_offset(self.uar_idx, DOORBELL_SEND_QUEUE_NUMBER),
                    self.number << 8,
                );
            },
            DoorbellStrategy::BlueFlame {
                register_offset, register_size, second_half,
            } => {
                let length = (size_in_16 as usize * 16)
                    .min(*register_size / 2);
                let mut target = *register_offset;
                if *second_half {
                    target += *register_size / 2;
                }
                *second_half = !*second_half;
                let wqe = self.memory.as_ref().unwrap().0
                    .as_slice(wqe_base, length)?;
                hal.write_blueflame(target, wqe);
            },
        }
        Ok(index)
    }

    /// Turn this queue pair into the special one that carries raw
    /// packets with software-built wire headers.
    pub(super) fn make_special<H: Hal>(
        &self, cmd: &mut CommandInterface<H>,
    ) -> Result<(), &'static str> {
        cmd.execute_command::<_, _, ()>(Opcode::ConfSpecialQp, (), (), self.number)?;
        Ok(())
    }

    /// Post a raw send whose wire headers were built by software.
    ///
    /// The headers and the payload go inline into the descriptor, so no
    /// memory region is involved.
    pub(super) fn post_send_special<H: Hal>(
        &mut self, hal: &H, header: &UdHeader, payload: &[u8],
    ) -> Result<u32, &'static str> {
        const SRCRB_FLAG_CQ_UPDATE: u32 = 3 << 2;
        const INLINE: u32 = 1 << 31;

        if self.state != ibv_qp_state::IBV_QPS_RTS {
            return Err("queue pair is not ready to send");
        }
        if self.sq.would_overflow(1) {
            return Err("send queue is full");
        }
        let inline_len = UdHeader::SIZE + payload.len();
        let index = self.sq.head & (self.sq.wqe_cnt - 1);
        let wqe_base = (self.sq.offset + (index << self.sq.wqe_shift)) as usize;
        let wqe_size = (size_of::<WqeControlSegment>() + 4 + inline_len)
            .next_multiple_of(16);
        if wqe_size > 1usize << self.sq.wqe_shift {
            return Err("payload does not fit in a descriptor");
        }
        let mut offset = wqe_base + size_of::<WqeControlSegment>();
        let memory = self.memory.as_mut().unwrap();
        memory.0
            .as_slice_mut(offset, 4)?
            .copy_from_slice(
                &(INLINE | u32::try_from(inline_len).unwrap()).to_be_bytes()
            );
        offset += 4;
        memory.0
            .as_slice_mut(offset, UdHeader::SIZE)?
            .copy_from_slice(&header.to_bytes());
        offset += UdHeader::SIZE;
        memory.0
            .as_slice_mut(offset, payload.len())?
            .copy_from_slice(payload);

        let owner = if self.sq.head & self.sq.wqe_cnt != 0 { 1 << 31 } else { 0 };
        let ctrl = self.sq.get_control_segment(memory, index)?;
        ctrl.vlan_cv_f_ds.set((wqe_size / 16) as u32);
        ctrl.flags.set(SRCRB_FLAG_CQ_UPDATE);
        ctrl.flags2.set(0);
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
        let ctrl = self.sq.get_control_segment(memory, index)?;
        ctrl.owner_opcode.set(QueuePairOpcode::Send as u32 | owner);

        if let Some(spare_wqes) = self.sq.spare_wqes {
            let spare = (self.sq.head + spare_wqes) & (self.sq.wqe_cnt - 1);
            self.sq.stamp_wqe(memory, spare)?;
        }
        self.sq.head = self.sq.head.wrapping_add(1);
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
        hal.write_doorbell(
            doorbell_offset(self.uar_idx, DOORBELL_SEND_QUEUE_NUMBER),
            self.number << 8,
        );
        Ok(index)
    }

    /// Post a receive work request and update the doorbell record.
    pub(super) fn post_receive(
        &mut self, wr: &ibv_recv_wr,
    ) -> Result<u32, &'static str> {
        if self.state == ibv_qp_state::IBV_QPS_RESET {
            return Err("queue pair is still reset");
        }
        if self.rq.would_overflow(1) {
            return Err("receive queue is full");
        }
        if wr.sg_list.len() > self.rq.max_gs as usize {
            return Err("too many scatter-gather entries");
        }

        let index = self.rq.head & (self.rq.wqe_cnt - 1);
        let mut offset = (self.rq.offset + (index << self.rq.wqe_shift)) as usize;
        let memory = self.memory.as_mut().unwrap();
        for sge in wr.sg_list.iter() {
            let mut seg = WqeDataSegment::new_zeroed();
            seg.byte_count.set(sge.length);
            seg.lkey.set(sge.lkey);
            seg.addr.set(sge.addr);
            memory.0
                .as_slice_mut(offset, size_of::<WqeDataSegment>())?
                .copy_from_slice(seg.as_bytes());
            offset += size_of::<WqeDataSegment>();
        }
        // a sentinel ends short scatter lists
        if wr.sg_list.len() < self.rq.max_gs as usize {
            let mut seg = WqeDataSegment::new_zeroed();
            seg.lkey.set(INVALID_LKEY);
            memory.0
                .as_slice_mut(offset, size_of::<WqeDataSegment>())?
                .copy_from_slice(seg.as_bytes());
        }

        self.rq.head = self.rq.head.wrapping_add(1);
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
        let doorbell: &mut QueuePairDoorbell = self.doorbell_page
            .as_type_mut(0)?;
        doorbell.receive_wqe_index.set((self.rq.head & 0xffff) as u16);
        Ok(index)
    }

    /// Retire one send request, making room in the queue.
    pub(super) fn note_send_completion(&mut self) {
        self.sq.tail = self.sq.tail.wrapping_add(1);
    }

    /// Retire one receive request, making room in the queue.
    pub(super) fn note_receive_completion(&mut self) {
        self.rq.tail = self.rq.tail.wrapping_add(1);
    }

    /// Destroy this queue pair.
    pub(super) fn destroy<H: Hal>(
        mut self, cmd: &mut CommandInterface<H>,
    ) -> Result<(), &'static str> {
        trace!("destroying QP {}..", self.number);
        if self.state != ibv_qp_state::IBV_QPS_RESET {
            self.modify(cmd, &ibv_qp_attr {
                qp_state: ibv_qp_state::IBV_QPS_RESET,
                ..Default::default()
            }, ibv_qp_attr_mask::IBV_QP_STATE)?;
        }
        // actually free the memory
        self.memory.take().unwrap();
        Ok(())
    }

    /// Get the number of this queue pair.
    pub(super) fn number(&self) -> u32 {
        self.number
    }

    /// Get the current state of this queue pair.
    pub(super) fn state(&self) -> ibv_qp_state {
        self.state
    }

    /// Get the geometry the queues ended up with.
    pub(super) fn capabilities(&self) -> ibv_qp_cap {
        ibv_qp_cap {
            max_send_wr: self.sq.max_post,
            max_recv_wr: self.rq.max_post,
            max_send_sge: self.sq.max_gs,
            max_recv_sge: self.rq.max_gs,
            max_inline_data: 0,
        }
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        if self.memory.is_some() {
            panic!("please destroy instead of dropping")
        }
    }
}

/// The firmware command for a state transition, if the transition
/// is legal.
///
/// Resetting is always possible; everything else follows the ladder.
fn transition_opcode(
    from: ibv_qp_state, to: ibv_qp_state,
) -> Option<Opcode> {
    use ibv_qp_state::*;
    Some(match (from, to) {
        (_, IBV_QPS_RESET) => Opcode::Any2RstQp,
        (_, IBV_QPS_ERR) => Opcode::Any2ErrQp,
        (IBV_QPS_RESET, IBV_QPS_INIT) => Opcode::Rst2InitQp,
        (IBV_QPS_INIT, IBV_QPS_INIT) => Opcode::Init2InitQp,
        (IBV_QPS_INIT, IBV_QPS_RTR) => Opcode::Init2RtrQp,
        (IBV_QPS_RTR, IBV_QPS_RTS) => Opcode::Rtr2RtsQp,
        (IBV_QPS_RTS, IBV_QPS_RTS) => Opcode::Rts2RtsQp,
        (IBV_QPS_RTS, IBV_QPS_SQD) => Opcode::Rts2SqdQp,
        (IBV_QPS_SQD, IBV_QPS_SQD) => Opcode::Sqd2SqdQp,
        (IBV_QPS_SQD, IBV_QPS_RTS) => Opcode::Sqd2RtsQp,
        _ => return None,
    })
}

fn ibv_mtu_to_hw(mtu: mlx_infiniband::ibv_mtu) -> u8 {
    mtu as u8
}

/// The descriptor opcode for a send work request.
fn send_opcode(wr: &ibv_send_wr) -> Result<QueuePairOpcode, &'static str> {
    match wr.opcode {
        Some(ibv_wr_opcode::IBV_WR_SEND) | None => Ok(QueuePairOpcode::Send),
        Some(ibv_wr_opcode::IBV_WR_SEND_WITH_IMM) => {
            Ok(QueuePairOpcode::SendImmediate)
        },
        Some(ibv_wr_opcode::IBV_WR_RDMA_WRITE) => {
            Ok(QueuePairOpcode::RdmaWrite)
        },
        Some(ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM) => {
            Ok(QueuePairOpcode::RdmaWriteImmediate)
        },
        Some(ibv_wr_opcode::IBV_WR_RDMA_READ) => Ok(QueuePairOpcode::RdmaRead),
    }
}

/// Work request opcodes, as the descriptors encode them.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueuePairOpcode {
    Nop = 0x00,
    RdmaWrite = 0x08,
    RdmaWriteImmediate = 0x09,
    Send = 0x0a,
    SendImmediate = 0x0b,
    RdmaRead = 0x10,
}

#[derive(FromBytes)]
#[repr(C, packed)]
struct QueuePairDoorbell {
    _reserved: u16,
    receive_wqe_index: U16<BigEndian>,
}

#[derive(Debug)]
struct WorkQueue {
    wqe_cnt: u32,
    max_post: u32,
    max_gs: u32,
    offset: u32,
    wqe_shift: u32,
    spare_wqes: Option<u32>,
    head: u32,
    tail: u32,
}

impl WorkQueue {
    /// Compute the size of the receive queue and return it.
    fn new_receive_queue(
        hca_caps: &Capabilities, ib_caps: &mut ibv_qp_cap,
    ) -> Result<Self, &'static str> {
        // check the RQ size before proceeding
        if ib_caps.max_recv_wr > (1 << u32::from(hca_caps.log_max_qp_sz())) - IB_SQ_MAX_SPARE
         || ib_caps.max_recv_sge > hca_caps.max_sg_sq().into()
         || ib_caps.max_recv_sge > hca_caps.max_sg_rq().into() {
            return Err("RQ size is invalid")
        }
        let mut wqe_cnt = ib_caps.max_recv_wr;
        if wqe_cnt < 1 {
            wqe_cnt = 1;
        }
        wqe_cnt = wqe_cnt.next_power_of_two();
        let mut max_gs = ib_caps.max_recv_sge;
        if max_gs < 1 {
            max_gs = 1;
        }
        max_gs = max_gs.next_power_of_two();
        let wqe_shift = (
            max_gs * u32::try_from(size_of::<WqeDataSegment>()).unwrap()
        ).ilog2();
        let mut max_post = (1 << u32::from(
            hca_caps.log_max_qp_sz()
        )) - IB_SQ_MAX_SPARE;
        if max_post > wqe_cnt {
            max_post = wqe_cnt;
        }
        // update the caps
        ib_caps.max_recv_wr = max_post;
        ib_caps.max_recv_sge = *[
            max_gs, hca_caps.max_sg_sq().into(), hca_caps.max_sg_rq().into(),
        ].iter().min().unwrap();
        Ok(Self {
            wqe_cnt, max_post, max_gs, offset: 0, wqe_shift,
            spare_wqes: None, head: 0, tail: 0,
        })
    }

    /// Compute the size of the send queue and return it.
    fn new_send_queue(
        hca_caps: &Capabilities, ib_caps: &mut ibv_qp_cap,
        qp_type: ibv_qp_type::Type,
    ) -> Result<Self, &'static str> {
        // check the SQ size before proceeding
        if ib_caps.max_send_wr > (1 << u32::from(hca_caps.log_max_qp_sz())) - IB_SQ_MAX_SPARE
         || ib_caps.max_send_sge > hca_caps.max_sg_sq().into()
         || ib_caps.max_send_sge > hca_caps.max_sg_rq().into() {
            return Err("SQ size is invalid")
        }
        let size = ib_caps.max_send_sge * u32::try_from(
            size_of::<WqeDataSegment>()
        ).unwrap() + send_wqe_overhead(qp_type);
        if size > hca_caps.max_desc_sz_sq().into() {
            return Err("SQ size is invalid")
        }
        let wqe_shift = size.next_power_of_two().ilog2();
        // We need to leave 2 KB + 1 WR of headroom in the SQ to
        // allow HW to prefetch.
        let spare_wqes = ib_sq_headroom(wqe_shift);
        let wqe_cnt = (ib_caps.max_send_wr + spare_wqes).next_power_of_two();
        let max_gs = (u32::from(*[
            hca_caps.max_desc_sz_sq(), 1 << wqe_shift
        ].iter().min().unwrap()) - send_wqe_overhead(qp_type)) / u32::try_from(
            size_of::<WqeDataSegment>()
        ).unwrap();
        let max_post = wqe_cnt - spare_wqes;
        // update the caps
        ib_caps.max_send_wr = max_post;
        ib_caps.max_send_sge = *[
            max_gs, hca_caps.max_sg_sq().into(), hca_caps.max_sg_rq().into(),
        ].iter().min().unwrap();
        Ok(Self {
            wqe_cnt, max_post, max_gs, offset: 0, wqe_shift,
            spare_wqes: Some(spare_wqes), head: 0, tail: 0,
        })
    }

    /// Get the size.
    fn size(&self) -> u32 {
        self.wqe_cnt << self.wqe_shift
    }

    /// Whether posting `nreq` more requests would exceed the queue.
    fn would_overflow(&self, nreq: u32) -> bool {
        self.head.wrapping_sub(self.tail) + nreq > self.max_post
    }

    /// Get the control segment of an element of this work queue.
    fn get_control_segment<'e>(
        &self, memory: &'e mut (DmaPages, PhysicalAddress), index: u32,
    ) -> Result<&'e mut WqeControlSegment, &'static str> {
        let (pages, _) = memory;
        pages.as_type_mut(
            (self.offset + (index << self.wqe_shift)).try_into().unwrap()
        )
    }

    /// Stamp a WQE so that it is invalid if prefetched, by marking the
    /// first four bytes of every 64 byte chunk with 0xffffffff, except
    /// for the very first chunk of the WQE.
    fn stamp_wqe(
        &self, memory: &mut (DmaPages, PhysicalAddress), index: u32,
    ) -> Result<(), &'static str> {
        let base = (self.offset + (index << self.wqe_shift)) as usize;
        let size = 1usize << self.wqe_shift;
        for chunk in (64..size).step_by(64) {
            memory.0
                .as_slice_mut(base + chunk, 4)?
                .copy_from_slice(&u32::MAX.to_be_bytes());
        }
        Ok(())
    }
}

fn send_wqe_overhead(qp_type: ibv_qp_type::Type) -> u32 {
    // UD WQEs must have a datagram segment.
    // RC and UC WQEs might have a remote address segment.
    match qp_type {
        ibv_qp_type::IBV_QPT_UD => {
            size_of::<WqeControlSegment>() + size_of::<WqeDatagramSegment>()
        },
        ibv_qp_type::IBV_QPT_UC => {
            size_of::<WqeControlSegment>() + size_of::<WqeRemoteAddressSegment>()
        },
        ibv_qp_type::IBV_QPT_RC => {
            size_of::<WqeControlSegment>() + size_of::<WqeRemoteAddressSegment>()
        },
    }.try_into().unwrap()
}

#[derive(AsBytes, FromBytes)]
#[repr(C)]
struct WqeControlSegment {
    owner_opcode: U32<BigEndian>,
    vlan_cv_f_ds: U32<BigEndian>,
    flags: U32<BigEndian>,
    flags2: U32<BigEndian>,
}

#[derive(AsBytes, FromBytes)]
#[repr(C)]
struct WqeDataSegment {
    byte_count: U32<BigEndian>,
    lkey: U32<BigEndian>,
    addr: U64<BigEndian>,
}

/// The address vector and destination of a datagram send.
#[derive(AsBytes, FromBytes)]
#[repr(C)]
struct WqeDatagramSegment {
    port_pd: U32<BigEndian>,
    _reserved1: u8,
    g_slid: u8,
    dlid: U16<BigEndian>,
    _reserved2: u8,
    gid_index: u8,
    stat_rate: u8,
    hop_limit: u8,
    sl_tclass_flowlabel: U32<BigEndian>,
    dgid: [u8; 16],
    dst_qpn: U32<BigEndian>,
    qkey: U32<BigEndian>,
    _reserved3: [u8; 8],
}

#[derive(AsBytes, FromBytes)]
#[repr(C)]
struct WqeRemoteAddressSegment {
    va: U64<BigEndian>,
    key: U32<BigEndian>,
    _reserved: U32<BigEndian>,
}

#[bitfield]
struct QueuePairContext {
    state: B4,
    #[skip] __: B4,
    service_type: u8,
    #[skip] __: B3,
    path_migration_state: B2,
    #[skip] __: B19,
    protection_domain: B24,
    mtu: B3,
    msg_max: B5,
    #[skip] __: bool,
    log_rq_size: B4,
    log_rq_stride: B3,
    sq_no_prefetch: bool,
    log_sq_size: B4,
    log_sq_stride: B3,
    roce_mode: B2,
    #[skip] __: bool,
    reserved_lkey: bool,
    #[skip] __: B12,
    usr_page: B24,
    #[skip] __: u8,
    local_qpn: B24,
    #[skip] __: u8,
    remote_qpn: B24,
    // nested bitfields are only allowed to be 128 bits
    primary_path_one: QueuePairPathPartOne,
    primary_rgid: u128,
    primary_path_two: QueuePairPathPartTwo,
    alternative_path_one: QueuePairPathPartOne,
    alternative_rgid: u128,
    alternative_path_two: QueuePairPathPartTwo,
    #[skip] __: B72,
    next_send_psn: B24,
    #[skip] __: u8,
    cqn_send: B24,
    roce_entropy: u16,
    #[skip] __: B56,
    last_acked_psn: B24,
    #[skip] __: u8,
    ssn: B24,
    #[skip] __: u16,
    remote_read: bool,
    remote_write: bool,
    remote_atomic: bool,
    #[skip] __: B16,
    rnr_nak: B5,
    next_recv_psn: B24,
    #[skip] __: u16,
    xrcd: u16,
    #[skip] __: u8,
    cqn_receive: B24,
    /// The last three bits must be zero.
    db_record_addr: u64,
    qkey: u32,
    #[skip] __: u8,
    srqn: B24,
    #[skip] __: u8,
    msn: B24,
    rq_wqe_counter: u16,
    sq_wqe_counter: u16,
    // rate_limit_params
    #[skip] __: B56,
    qos_vport: u8,
    #[skip] __: u32,
    num_rmc_peers: u8,
    base_mkey: B24,
    #[skip] __: B2,
    log_page_size: B6,
    #[skip] __: u16,
    /// The last three bits must be zero.
    mtt_base_addr: B40,
    #[skip] __: u128,
    #[skip] __: u128,
    #[skip] __: u64,
}

// nested bitfields are only allowed to be 128 bits
#[bitfield]
#[derive(BitfieldSpecifier)]
struct QueuePairPathPartOne {
    #[skip] __: B17,
    disable_pkey_check: bool,
    #[skip] __: B7,
    pkey_index: B7,
    #[skip] __: u8,
    grh: bool,
    #[skip] __: B7,
    rlid: u16,
    ack_timeout: B5,
    #[skip] __: B4,
    mgid_index: B7,
    #[skip] __: u8,
    hop_limit: u8,
    #[skip] __: B4,
    tclass: u8,
    flow_label: B20,
}

#[bitfield]
#[derive(BitfieldSpecifier)]
struct QueuePairPathPartTwo {
    sched_queue: u8,
    #[skip] __: bool,
    vlan_index: B7,
    #[skip] __: u32,
    dmac: B48,
}

#[derive(AsBytes, FromBytes)]
#[repr(C, packed)]
struct StateTransitionCommandParameter {
    opt_param_mask: U32<BigEndian>,
    _reserved: u32,
    qpc_data: [u8; 248],
    _reserved2: [u8; 252],
}

bitflags! {
    struct OptionalParameterMask: u32 {
        const REMOTE_READ = 1 << 1;
        const REMOTE_ATOMIC = 1 << 2;
        const REMOTE_WRITE = 1 << 3;
        const PKEY_INDEX = 1 << 4;
        const QKEY = 1 << 5;
        const ACK_TIMEOUT = 1 << 10;
        const RNR_TIMEOUT = 1 << 13;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibv_qp_state::*;

    fn test_caps() -> Capabilities {
        let mut caps = Capabilities::new();
        caps.set_log_max_qp_sz(16);
        caps.set_max_sg_sq(32);
        caps.set_max_sg_rq(32);
        caps.set_max_desc_sz_sq(1008);
        caps.set_max_desc_sz_rq(512);
        caps
    }

    #[test]
    fn legal_transitions_map_to_commands() {
        assert_eq!(
            transition_opcode(IBV_QPS_RESET, IBV_QPS_INIT),
            Some(Opcode::Rst2InitQp),
        );
        assert_eq!(
            transition_opcode(IBV_QPS_INIT, IBV_QPS_RTR),
            Some(Opcode::Init2RtrQp),
        );
        assert_eq!(
            transition_opcode(IBV_QPS_RTR, IBV_QPS_RTS),
            Some(Opcode::Rtr2RtsQp),
        );
        assert_eq!(
            transition_opcode(IBV_QPS_RTS, IBV_QPS_SQD),
            Some(Opcode::Rts2SqdQp),
        );
    }

    #[test]
    fn skipping_states_is_refused() {
        assert_eq!(transition_opcode(IBV_QPS_RESET, IBV_QPS_RTS), None);
        assert_eq!(transition_opcode(IBV_QPS_RESET, IBV_QPS_RTR), None);
        assert_eq!(transition_opcode(IBV_QPS_INIT, IBV_QPS_RTS), None);
        assert_eq!(transition_opcode(IBV_QPS_RTR, IBV_QPS_INIT), None);
    }

    #[test]
    fn every_state_can_reset() {
        for from in [
            IBV_QPS_RESET, IBV_QPS_INIT, IBV_QPS_RTR, IBV_QPS_RTS,
            IBV_QPS_SQD, IBV_QPS_ERR,
        ] {
            assert_eq!(
                transition_opcode(from, IBV_QPS_RESET),
                Some(Opcode::Any2RstQp),
            );
        }
    }

    #[test]
    fn datagram_queue_geometry() {
        let caps = test_caps();
        let mut ib_caps = ibv_qp_cap {
            max_send_wr: 2048,
            max_recv_wr: 2048,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        };
        let rq = WorkQueue::new_receive_queue(&caps, &mut ib_caps).unwrap();
        let sq = WorkQueue::new_send_queue(
            &caps, &mut ib_caps, ibv_qp_type::IBV_QPT_UD,
        ).unwrap();
        // each ring covers its entries exactly
        assert_eq!(rq.size(), rq.wqe_cnt << rq.wqe_shift);
        assert_eq!(sq.size(), sq.wqe_cnt << sq.wqe_shift);
        assert_eq!(rq.wqe_cnt, 2048);
        // the send ring also holds the prefetch headroom
        let spare = sq.spare_wqes.unwrap();
        assert_eq!(sq.wqe_cnt, (2048 + spare).next_power_of_two());
        assert_eq!(sq.max_post, sq.wqe_cnt - spare);
        assert_eq!(ib_caps.max_send_wr, sq.max_post);
    }

    #[test]
    fn send_ownership_flips_once_per_pass() {
        let wqe_cnt = 8;
        let bit = |head: u32| head & wqe_cnt != 0;
        for head in 0..wqe_cnt {
            assert!(!bit(head));
        }
        for head in wqe_cnt..2 * wqe_cnt {
            assert!(bit(head));
        }
        assert!(!bit(2 * wqe_cnt));
    }

    #[test]
    fn raw_send_places_the_headers_inline() {
        let caps = test_caps();
        let mut ib_caps = ibv_qp_cap {
            max_send_wr: 4,
            max_recv_wr: 4,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        };
        let mut rq = WorkQueue::new_receive_queue(&caps, &mut ib_caps).unwrap();
        let mut sq = WorkQueue::new_send_queue(
            &caps, &mut ib_caps, ibv_qp_type::IBV_QPT_UD,
        ).unwrap();
        if rq.wqe_shift > sq.wqe_shift {
            rq.offset = 0;
            sq.offset = rq.size();
        } else {
            rq.offset = sq.size();
            sq.offset = 0;
        }
        let buf_size = (rq.size() + sq.size()) as usize;
        let memory = create_contiguous_mapping(buf_size).unwrap();
        let (doorbell_page, doorbell_address) = create_contiguous_mapping(
            size_of::<QueuePairDoorbell>(),
        ).unwrap();
        let mut qp = QueuePair {
            number: 64,
            state: IBV_QPS_RTS,
            qp_type: ibv_qp_type::IBV_QPT_UD,
            sq,
            rq,
            send_cq_number: 16,
            receive_cq_number: 16,
            memory: Some(memory),
            uar_idx: 128,
            doorbell_page,
            doorbell_address,
            mtt: 0,
            doorbell_strategy: DoorbellStrategy::Doorbell,
        };
        let header = UdHeader::new(
            1, 2, 0, 0xffff, 0xffffff, 64, 0x1111_1111, 0, 16,
        );
        let payload = [0xab; 16];
        let sim = crate::sim::SimDevice::new();
        let index = qp.post_send_special(&sim, &header, &payload).unwrap();
        let base = (qp.sq.offset + (index << qp.sq.wqe_shift)) as usize;
        let memory = qp.memory.as_ref().unwrap();
        let inline_len = (UdHeader::SIZE + payload.len()) as u32;
        assert_eq!(
            memory.0.as_slice(base + 16, 4).unwrap(),
            &(0x8000_0000 | inline_len).to_be_bytes(),
        );
        assert_eq!(
            memory.0.as_slice(base + 20, UdHeader::SIZE).unwrap(),
            &header.to_bytes(),
        );
        assert_eq!(
            memory.0.as_slice(base + 20 + UdHeader::SIZE, 16).unwrap(),
            &payload,
        );
        qp.memory.take();
    }

    #[test]
    fn overflow_accounts_for_outstanding_requests() {
        let caps = test_caps();
        let mut ib_caps = ibv_qp_cap {
            max_recv_wr: 4, max_recv_sge: 1, ..Default::default()
        };
        let mut rq = WorkQueue::new_receive_queue(&caps, &mut ib_caps).unwrap();
        for _ in 0..rq.max_post {
            assert!(!rq.would_overflow(1));
            rq.head += 1;
        }
        assert!(rq.would_overflow(1));
        rq.tail += 1;
        assert!(!rq.would_overflow(1));
    }
}
