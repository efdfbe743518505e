//! Completion queues: creation, polling and teardown.
//!
//! The card appends 32-byte entries into a ring buffer we allocate and
//! tells it about. An entry belongs to software when its owner bit
//! differs from the pass parity of the consumer index, so a freshly
//! zeroed ring is entirely hardware-owned.

use core::mem::size_of;

use alloc::vec::Vec;
use byteorder::BigEndian;
use modular_bitfield_msb::{bitfield, specifiers::{B2, B24, B3, B40, B48, B5, B6}};
use strum_macros::FromRepr;
use zerocopy::{FromBytes, U32};

use mlx_infiniband::{ibv_wc, ibv_wc_flags, ibv_wc_opcode, ibv_wc_status};

use super::{
    cmd::{CommandInterface, Opcode},
    device::{uar_index_to_hw, PAGE_SHIFT},
    dma::{create_contiguous_mapping, DmaPages, PhysicalAddress, PAGE_SIZE},
    event_queue::EventQueue,
    fw::{
        doorbell_offset, Capabilities,
        DOORBELL_CQ_CONSUMER_INDEX, DOORBELL_CQ_SN_CMD_NUM,
    },
    hal::Hal,
    icm::{MrTable, ICM_PAGE_SHIFT},
    Offsets,
};

const CQE_SIZE: usize = 32;
const CQE_OPCODE_ERROR: u8 = 0x1e;
const CQE_OPCODE_RESIZE: u8 = 0x16;

#[derive(Debug)]
pub(super) struct CompletionQueue {
    number: usize,
    num_entries: usize,
    num_pages: usize,
    memory: Option<(DmaPages, PhysicalAddress)>,
    uar_idx: usize,
    doorbell_page: DmaPages,
    mtt: u64,
    arm_sequence_number: u32,
    consumer_index: u32,
    eq_number: Option<usize>,
}

impl CompletionQueue {
    /// Create a new completion queue.
    ///
    /// This is quite like creating an event queue.
    pub(super) fn new<H: Hal>(
        cmd: &mut CommandInterface<H>, caps: &Capabilities,
        offsets: &mut Offsets, memory_regions: &mut MrTable,
        eq: Option<&EventQueue>, num_entries: usize,
    ) -> Result<Self, &'static str> {
        let number = offsets.alloc_cqn();
        let uar_idx = offsets.alloc_scq_db();
        let num_pages = (num_entries * CQE_SIZE)
            .next_multiple_of(PAGE_SIZE) / PAGE_SIZE;
        let memory = create_contiguous_mapping(num_pages * PAGE_SIZE)?;
        let mtt = memory_regions.alloc_mtt(cmd, caps, num_pages, memory.1)?;
        let (mut doorbell_page, doorbell_address) = create_contiguous_mapping(
            size_of::<CompletionQueueDoorbell>(),
        )?;
        let doorbell: &mut CompletionQueueDoorbell = doorbell_page
            .as_type_mut(0)?;
        doorbell.update_consumer_index.set(0);
        doorbell.arm_consumer_index.set(0);

        let mut ctx = CompletionQueueContext::new();
        ctx.set_log_size(num_entries.ilog2().try_into().unwrap());
        ctx.set_usr_page(uar_index_to_hw(uar_idx).try_into().unwrap());
        let mut eq_number = None;
        if let Some(eq) = eq {
            ctx.set_comp_eqn(eq.number().try_into().unwrap());
            eq_number = Some(eq.number());
        }
        ctx.set_log_page_size(PAGE_SHIFT - ICM_PAGE_SHIFT);
        ctx.set_mtt_base_addr(mtt);
        ctx.set_doorbell_record_addr(doorbell_address.value() as u64);
        cmd.execute_command::<_, _, ()>(
            Opcode::Sw2HwCq, (), &ctx.bytes[..], number.try_into().unwrap(),
        )?;

        let cq = Self {
            number, num_entries, num_pages, memory: Some(memory), uar_idx,
            doorbell_page, mtt, arm_sequence_number: 0, consumer_index: 0,
            eq_number,
        };
        trace!("created new CQ: {cq:?}");
        Ok(cq)
    }

    /// Destroy this completion queue.
    pub(super) fn destroy<H: Hal>(
        mut self, cmd: &mut CommandInterface<H>,
    ) -> Result<(), &'static str> {
        cmd.execute_command::<_, _, ()>(
            Opcode::Hw2SwCq, (), (), self.number.try_into().unwrap(),
        )?;
        // actually free the memory
        self.memory.take().unwrap();
        Ok(())
    }

    /// Request an interrupt for the next completion.
    pub(super) fn arm<H: Hal>(&mut self, hal: &H) -> Result<(), &'static str> {
        const _DOORBELL_REQUEST_NOTIFICATION_SOLICITED: u32 = 0x1;
        const DOORBELL_REQUEST_NOTIFICATION: u32 = 0x2;
        let sn = self.arm_sequence_number & 3;
        let ci = self.consumer_index & 0xffffff;
        let command = DOORBELL_REQUEST_NOTIFICATION;
        let doorbell_record: &mut CompletionQueueDoorbell = self.doorbell_page
            .as_type_mut(0)?;
        doorbell_record.arm_consumer_index.set(sn << 28 | command << 24 | ci);
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
        hal.write_doorbell(
            doorbell_offset(self.uar_idx, DOORBELL_CQ_SN_CMD_NUM),
            sn << 28 | command << 24 | u32::try_from(self.number).unwrap(),
        );
        hal.write_doorbell(
            doorbell_offset(self.uar_idx, DOORBELL_CQ_CONSUMER_INDEX), ci,
        );
        Ok(())
    }

    /// Poll for completions, consuming up to `max` entries.
    pub(super) fn poll(&mut self, max: usize) -> Result<Vec<ibv_wc>, &'static str> {
        let mut completions = Vec::new();
        while completions.len() < max {
            match self.poll_one()? {
                Some(wc) => completions.push(wc),
                None => break,
            }
        }
        Ok(completions)
    }

    /// Consume the next completion, if software owns one.
    pub(super) fn poll_one(&mut self) -> Result<Option<ibv_wc>, &'static str> {
        let cqe = loop {
            let Some(cqe) = self.get_next_cqe_sw()? else {
                return Ok(None);
            };
            self.consumer_index = self.consumer_index.wrapping_add(1);
            // resize entries carry no completion
            if cqe.opcode() != CQE_OPCODE_RESIZE {
                break cqe;
            }
        };

        let mut wc = ibv_wc {
            wr_id: cqe.wqe_index().into(),
            qp_num: cqe.my_qpn(),
            byte_len: cqe.byte_cnt(),
            imm_data: cqe.immed_rss_invalid(),
            src_qp: cqe.g_mlpath_rqpn() & 0xffffff,
            slid: cqe.rlid(),
            sl: (cqe.sl_vid() >> 12) as u8,
            ..Default::default()
        };
        if cqe.opcode() == CQE_OPCODE_ERROR {
            wc.status = Syndrome::from_repr(cqe.syndrome())
                .map(|s| s.into())
                .unwrap_or(ibv_wc_status::IBV_WC_GENERAL_ERR);
            wc.vendor_err = cqe.vendor_err_syndrome().into();
        } else {
            wc.status = ibv_wc_status::IBV_WC_SUCCESS;
            wc.wc_flags = ibv_wc_flags::empty();
            if cqe.is_send() {
                wc.opcode = match cqe.opcode() {
                    0x08 => ibv_wc_opcode::IBV_WC_RDMA_WRITE,
                    0x10 => ibv_wc_opcode::IBV_WC_RDMA_READ,
                    _ => ibv_wc_opcode::IBV_WC_SEND,
                };
            } else {
                wc.opcode = match cqe.opcode() {
                    // write with immediate
                    0x00 => {
                        wc.wc_flags |= ibv_wc_flags::IBV_WC_WITH_IMM;
                        ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM
                    },
                    // send with immediate
                    0x02 => {
                        wc.wc_flags |= ibv_wc_flags::IBV_WC_WITH_IMM;
                        ibv_wc_opcode::IBV_WC_RECV
                    },
                    _ => ibv_wc_opcode::IBV_WC_RECV,
                };
            }
        }

        // tell the card how far we got
        let ci = self.consumer_index & 0xffffff;
        let doorbell_record: &mut CompletionQueueDoorbell = self.doorbell_page
            .as_type_mut(0)?;
        doorbell_record.update_consumer_index.set(ci);
        Ok(Some(wc))
    }

    /// Read the entry at the consumer index, if software owns it.
    fn get_next_cqe_sw(
        &self,
    ) -> Result<Option<CompletionQueueEntry>, &'static str> {
        let memory = &self.memory.as_ref().unwrap().0;
        let index = self.consumer_index as usize & (self.num_entries - 1);
        let bytes: [u8; CQE_SIZE] = memory
            .as_slice(index * CQE_SIZE, CQE_SIZE)?
            .try_into()
            .unwrap();
        let cqe = CompletionQueueEntry::from_bytes(bytes);
        // the parity of the pass we're on
        let parity = self.consumer_index as usize & self.num_entries != 0;
        if cqe.owner() != parity {
            Ok(Some(cqe))
        } else {
            Ok(None)
        }
    }

    /// Get the number of this completion queue.
    pub(super) fn number(&self) -> usize {
        self.number
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        if self.memory.is_some() {
            panic!("please destroy instead of dropping")
        }
    }
}

/// Completion error syndromes, as reported in error entries.
#[repr(u8)]
#[derive(Clone, Copy, Debug, FromRepr)]
enum Syndrome {
    LocalLength = 0x01,
    LocalQpOperation = 0x02,
    LocalProtection = 0x04,
    WorkRequestFlushed = 0x05,
    MemoryWindowBind = 0x06,
    BadResponse = 0x10,
    LocalAccess = 0x11,
    RemoteInvalidRequest = 0x12,
    RemoteAccess = 0x13,
    RemoteOperation = 0x14,
    TransportRetryExceeded = 0x15,
    RnrRetryExceeded = 0x16,
    RemoteAborted = 0x22,
}

impl From<Syndrome> for ibv_wc_status::Type {
    fn from(syndrome: Syndrome) -> Self {
        match syndrome {
            Syndrome::LocalLength => ibv_wc_status::IBV_WC_LOC_LEN_ERR,
            Syndrome::LocalQpOperation => ibv_wc_status::IBV_WC_LOC_QP_OP_ERR,
            Syndrome::LocalProtection => ibv_wc_status::IBV_WC_LOC_PROT_ERR,
            Syndrome::WorkRequestFlushed => ibv_wc_status::IBV_WC_WR_FLUSH_ERR,
            Syndrome::MemoryWindowBind => ibv_wc_status::IBV_WC_MW_BIND_ERR,
            Syndrome::BadResponse => ibv_wc_status::IBV_WC_BAD_RESP_ERR,
            Syndrome::LocalAccess => ibv_wc_status::IBV_WC_LOC_ACCESS_ERR,
            Syndrome::RemoteInvalidRequest => ibv_wc_status::IBV_WC_REM_INV_REQ_ERR,
            Syndrome::RemoteAccess => ibv_wc_status::IBV_WC_REM_ACCESS_ERR,
            Syndrome::RemoteOperation => ibv_wc_status::IBV_WC_REM_OP_ERR,
            Syndrome::TransportRetryExceeded => ibv_wc_status::IBV_WC_RETRY_EXC_ERR,
            Syndrome::RnrRetryExceeded => ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR,
            Syndrome::RemoteAborted => ibv_wc_status::IBV_WC_REM_ABORT_ERR,
        }
    }
}

#[bitfield]
struct CompletionQueueContext {
    flags: u32,
    #[skip] __: B48,
    page_offset: u16,
    #[skip] __: B3,
    log_size: B5,
    usr_page: B24,
    cq_period: u16,
    cq_max_count: u16,
    #[skip] __: B24,
    comp_eqn: u8,
    #[skip] __: B2,
    log_page_size: B6,
    #[skip] __: u16,
    // the last three bits must be zero
    mtt_base_addr: B40,
    #[skip] __: u8,
    last_notified_index: B24,
    #[skip] __: u8,
    solicit_producer_index: B24,
    #[skip] __: u8,
    consumer_index: B24,
    #[skip] __: u8,
    producer_index: B24,
    #[skip] __: u64,
    // the last three bits must be zero
    doorbell_record_addr: u64,
}

#[bitfield]
struct CompletionQueueEntry {
    #[skip] __: u8,
    my_qpn: B24,
    immed_rss_invalid: u32,
    g_mlpath_rqpn: u32,
    sl_vid: u16,
    rlid: u16,
    status: u32,
    byte_cnt: u32,
    wqe_index: u16,
    vendor_err_syndrome: u8,
    syndrome: u8,
    #[skip] __: B24,
    owner: bool,
    is_send: bool,
    #[skip] __: bool,
    opcode: B5,
}

#[derive(FromBytes)]
#[repr(C, packed)]
struct CompletionQueueDoorbell {
    update_consumer_index: U32<BigEndian>,
    arm_consumer_index: U32<BigEndian>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cq(num_entries: usize) -> CompletionQueue {
        let memory = create_contiguous_mapping(num_entries * CQE_SIZE).unwrap();
        let (doorbell_page, _) = create_contiguous_mapping(
            size_of::<CompletionQueueDoorbell>(),
        ).unwrap();
        CompletionQueue {
            number: 0x42, num_entries, num_pages: 1, memory: Some(memory),
            uar_idx: 0, doorbell_page, mtt: 0, arm_sequence_number: 0,
            consumer_index: 0, eq_number: None,
        }
    }

    /// Pretend to be the card and complete the k-th request.
    fn complete(cq: &mut CompletionQueue, k: usize) {
        let mut cqe = CompletionQueueEntry::new();
        cqe.set_owner(k & cq.num_entries == 0);
        cqe.set_is_send(true);
        cqe.set_opcode(0x0a);
        cqe.set_wqe_index(k as u16);
        let slot = k & (cq.num_entries - 1);
        let memory = &mut cq.memory.as_mut().unwrap().0;
        memory
            .as_slice_mut(slot * CQE_SIZE, CQE_SIZE)
            .unwrap()
            .copy_from_slice(&cqe.bytes);
    }

    #[test]
    fn zeroed_ring_is_hardware_owned() {
        let mut cq = test_cq(128);
        assert!(cq.poll_one().unwrap().is_none());
        cq.memory.take();
    }

    #[test]
    fn ownership_follows_pass_parity_across_the_wrap() {
        let mut cq = test_cq(128);
        // two full passes plus the wrap entries keep alternating parity
        for k in 0..130 {
            assert!(cq.poll_one().unwrap().is_none(), "entry {k} polled early");
            complete(&mut cq, k);
            let wc = cq.poll_one().unwrap().expect("entry should be ready");
            assert_eq!(wc.wr_id, k as u64);
            assert!(wc.is_valid());
        }
        assert_eq!(cq.consumer_index, 130);
        cq.memory.take();
    }

    #[test]
    fn error_entries_carry_a_syndrome() {
        let mut cq = test_cq(128);
        let mut cqe = CompletionQueueEntry::new();
        cqe.set_owner(true);
        cqe.set_opcode(CQE_OPCODE_ERROR);
        cqe.set_syndrome(0x05);
        let memory = &mut cq.memory.as_mut().unwrap().0;
        memory
            .as_slice_mut(0, CQE_SIZE)
            .unwrap()
            .copy_from_slice(&cqe.bytes);
        let wc = cq.poll_one().unwrap().unwrap();
        assert_eq!(
            wc.error().unwrap().0,
            ibv_wc_status::IBV_WC_WR_FLUSH_ERR,
        );
        cq.memory.take();
    }
}
