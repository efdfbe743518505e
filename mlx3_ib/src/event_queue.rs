//! Event queues: the card's way of telling us something happened.
//!
//! Entries use the same ownership convention as completion queues:
//! an entry is ours when its owner bit differs from the pass parity
//! of the consumer index.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use byteorder::{BigEndian, ByteOrder};
use modular_bitfield_msb::{
    bitfield,
    specifiers::{B10, B16, B2, B22, B24, B4, B40, B5, B6, B60, B7, B72, B96},
};
use zerocopy::FromBytes;

use super::{
    cmd::{CommandInterface, Opcode},
    device::PAGE_SHIFT,
    dma::{create_contiguous_mapping, DmaPages, PhysicalAddress, PAGE_SIZE},
    fw::{eq_doorbell_offset, Capabilities, Firmware},
    hal::Hal,
    icm::{MrTable, ICM_PAGE_SHIFT},
};

const EQE_SIZE: usize = 32;
/// How often to tell the card how far we've read, while draining.
const CONSUMER_UPDATE_PERIOD: u32 = 128;

/// Events the driver can map to an event queue.
///
/// The mask bit for each event is `1 << type`.
const ASYNC_EVENT_MASK: u64 = (1 << EventType::PathMigrated as u64)
    | (1 << EventType::CommunicationEstablished as u64)
    | (1 << EventType::SendQueueDrained as u64)
    | (1 << EventType::CqError as u64)
    | (1 << EventType::WqCatastrophicError as u64)
    | (1 << EventType::PathMigrationFailed as u64)
    | (1 << EventType::PortChange as u64)
    | (1 << EventType::CommandComplete as u64)
    | (1 << EventType::WqInvalidRequestError as u64)
    | (1 << EventType::WqAccessError as u64)
    | (1 << EventType::SrqCatastrophicError as u64)
    | (1 << EventType::SrqLastWqeReached as u64)
    | (1 << EventType::SrqLimitReached as u64)
    | (1 << EventType::FatalWarning as u64)
    | (1 << EventType::PortManagementChange as u64)
    | (1 << EventType::LocalCatastrophicError as u64);

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EventType {
    Completion = 0x00,
    PathMigrated = 0x01,
    CommunicationEstablished = 0x02,
    SendQueueDrained = 0x03,
    CqError = 0x04,
    WqCatastrophicError = 0x05,
    PathMigrationFailed = 0x07,
    PortChange = 0x09,
    CommandComplete = 0x0a,
    WqInvalidRequestError = 0x10,
    WqAccessError = 0x11,
    SrqCatastrophicError = 0x12,
    SrqLastWqeReached = 0x13,
    SrqLimitReached = 0x14,
    FatalWarning = 0x1b,
    PortManagementChange = 0x1d,
    LocalCatastrophicError = 0x3e,
}

/// A decoded event, queued until somebody asks for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Event {
    Completion { cqn: u32 },
    CommandComplete { token: u16, status: u8, out_param: u64 },
    CommunicationEstablished { qpn: u32 },
    PortChange { port: u8, active: bool },
    CqError { cqn: u32 },
    QpError { qpn: u32, event_type: u8 },
    PortManagementChange,
    Fatal { event_type: u8 },
    Unknown { event_type: u8 },
}

/// Create the event queues ahead of time and map the async events
/// to the first one.
///
/// Completions are routed per completion queue instead, when one
/// names an EQ in its context.
pub(super) fn init_eqs<H: Hal>(
    cmd: &mut CommandInterface<H>, caps: &Capabilities, offsets: &mut Offsets,
    memory_regions: &mut MrTable,
) -> Result<Vec<EventQueue>, &'static str> {
    const NUM_EQS: usize = 1;
    let mut eqs = Vec::with_capacity(NUM_EQS);
    for _ in 0..NUM_EQS {
        let eq = EventQueue::new(cmd, caps, offsets, memory_regions)?;
        eqs.push(eq);
    }
    eqs[0].map(cmd, ASYNC_EVENT_MASK)?;
    Ok(eqs)
}

#[derive(Debug)]
pub(super) struct EventQueue {
    number: usize,
    num_entries: usize,
    num_pages: usize,
    memory: Option<(DmaPages, PhysicalAddress)>,
    mtt: u64,
    consumer_index: u32,
    mapped_mask: u64,
    events: VecDeque<Event>,
}

impl EventQueue {
    /// Create a new event queue and pass it to the hardware.
    ///
    /// The queue is polled; nothing here registers an interrupt vector.
    fn new<H: Hal>(
        cmd: &mut CommandInterface<H>, caps: &Capabilities,
        offsets: &mut Offsets, memory_regions: &mut MrTable,
    ) -> Result<Self, &'static str> {
        const EQ_STATUS_OK: u8 = 0;
        const EQ_STATE_ARMED: u8 = 9;
        let number = offsets.alloc_eqn();
        let num_entries = 4096;
        let num_pages = (num_entries * EQE_SIZE)
            .next_multiple_of(PAGE_SIZE) / PAGE_SIZE;
        let (pages, physical) = create_contiguous_mapping(
            num_pages * PAGE_SIZE,
        )?;
        let mtt = memory_regions.alloc_mtt(cmd, caps, num_pages, physical)?;

        let mut ctx = EventQueueContext::new();
        ctx.set_status(EQ_STATUS_OK);
        ctx.set_state(EQ_STATE_ARMED);
        ctx.set_log_eq_size(num_entries.ilog2().try_into().unwrap());
        ctx.set_log_page_size(PAGE_SHIFT - ICM_PAGE_SHIFT);
        ctx.set_mtt_base_addr(mtt);
        cmd.execute_command::<_, _, ()>(
            Opcode::Sw2HwEq, (), &ctx.bytes[..], number.try_into().unwrap(),
        )?;

        let eq = Self {
            number, num_entries, num_pages, memory: Some((pages, physical)),
            mtt, consumer_index: 0, mapped_mask: 0, events: VecDeque::new(),
        };
        trace!("created new EQ: {eq:?}");
        Ok(eq)
    }

    /// Route the masked events to this queue.
    fn map<H: Hal>(
        &mut self, cmd: &mut CommandInterface<H>, mask: u64,
    ) -> Result<(), &'static str> {
        cmd.execute_command::<_, _, ()>(
            Opcode::MapEq, (), mask, self.number.try_into().unwrap(),
        )?;
        self.mapped_mask = mask;
        Ok(())
    }

    /// Take the queue back from the hardware.
    pub(super) fn destroy<H: Hal>(
        mut self, cmd: &mut CommandInterface<H>,
    ) -> Result<(), &'static str> {
        const MAP_EQ_UNMAP: u32 = 1 << 31;
        if self.mapped_mask != 0 {
            cmd.execute_command::<_, _, ()>(
                Opcode::MapEq, (), self.mapped_mask,
                MAP_EQ_UNMAP | u32::try_from(self.number).unwrap(),
            )?;
            self.mapped_mask = 0;
        }
        cmd.execute_command::<_, _, ()>(
            Opcode::Hw2SwEq, (), (), self.number.try_into().unwrap(),
        )?;
        self.memory.take().unwrap();
        Ok(())
    }

    /// Acknowledge the interrupt and drain all pending entries.
    ///
    /// Returns how many entries were consumed; the decoded events are
    /// queued for [`Self::pop_event`].
    pub(super) fn service<H: Hal>(
        &mut self, hal: &H, firmware: &Firmware, inta_pin: u8,
    ) -> Result<usize, &'static str> {
        // clear the interrupt before reading any entries,
        // so we can't lose an event that fires in between
        let (clr_int_bar, clr_int_offset) = firmware.clr_int();
        if clr_int_bar == 0 {
            let offset = clr_int_offset as usize
                + if inta_pin < 32 { 4 } else { 0 };
            hal.write_config(offset, 1 << (inta_pin & 31));
        }

        let mut drained = 0;
        while let Some(eqe) = self.get_next_eqe_sw()? {
            self.consumer_index = self.consumer_index.wrapping_add(1);
            drained += 1;
            let event = decode(&eqe);
            trace!("EQ {}: {event:?}", self.number);
            self.events.push_back(event);
            if drained % CONSUMER_UPDATE_PERIOD == 0 {
                self.update_consumer_index(hal, false);
            }
        }
        // re-arm so the next event raises an interrupt again
        self.update_consumer_index(hal, true);
        Ok(drained as usize)
    }

    /// Take the oldest event off the queue.
    pub(super) fn pop_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Read the entry at the consumer index, if software owns it.
    fn get_next_eqe_sw(&self) -> Result<Option<EventQueueEntry>, &'static str> {
        let memory = &self.memory.as_ref().unwrap().0;
        let index = self.consumer_index as usize & (self.num_entries - 1);
        let eqe: &EventQueueEntry = memory.as_type(index * EQE_SIZE)?;
        let parity = self.consumer_index as usize & self.num_entries != 0;
        if (eqe.owner & 0x80 != 0) != parity {
            Ok(Some(eqe.clone()))
        } else {
            Ok(None)
        }
    }

    fn update_consumer_index<H: Hal>(&self, hal: &H, arm: bool) {
        let mut value = self.consumer_index & 0xffffff;
        if arm {
            value |= 1 << 31;
        }
        hal.write_doorbell(eq_doorbell_offset(self.number), value);
    }

    /// Get the number of this event queue.
    pub(super) fn number(&self) -> usize {
        self.number
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        if self.memory.is_some() {
            panic!("please destroy instead of dropping")
        }
    }
}

fn decode(eqe: &EventQueueEntry) -> Event {
    let data = &eqe.data;
    match eqe.event_type {
        t if t == EventType::Completion as u8 => Event::Completion {
            cqn: BigEndian::read_u32(&data[0..4]) & 0xffffff,
        },
        t if t == EventType::CommandComplete as u8 => Event::CommandComplete {
            token: BigEndian::read_u16(&data[0..2]),
            status: data[9],
            out_param: BigEndian::read_u64(&data[10..18]),
        },
        t if t == EventType::CommunicationEstablished as u8 => {
            Event::CommunicationEstablished {
                qpn: BigEndian::read_u32(&data[0..4]) & 0xffffff,
            }
        },
        t if t == EventType::PortChange as u8 => {
            const PORT_CHANGE_SUBTYPE_ACTIVE: u8 = 4;
            Event::PortChange {
                port: (BigEndian::read_u32(&data[4..8]) >> 28) as u8,
                active: eqe.subtype == PORT_CHANGE_SUBTYPE_ACTIVE,
            }
        },
        t if t == EventType::CqError as u8 => Event::CqError {
            cqn: BigEndian::read_u32(&data[0..4]) & 0xffffff,
        },
        t if t == EventType::WqCatastrophicError as u8
            || t == EventType::WqInvalidRequestError as u8
            || t == EventType::WqAccessError as u8 => Event::QpError {
            qpn: BigEndian::read_u32(&data[0..4]) & 0xffffff,
            event_type: t,
        },
        t if t == EventType::PortManagementChange as u8 => {
            Event::PortManagementChange
        },
        t if t == EventType::FatalWarning as u8
            || t == EventType::LocalCatastrophicError as u8 => {
            Event::Fatal { event_type: t }
        },
        t => Event::Unknown { event_type: t },
    }
}

#[derive(FromBytes, Clone)]
#[repr(C, packed)]
struct EventQueueEntry {
    _reserved1: u8,
    event_type: u8,
    _reserved2: u8,
    subtype: u8,
    data: [u8; 24],
    _reserved3: [u8; 3],
    owner: u8,
}

#[bitfield]
struct EventQueueContext {
    status: B4,
    #[skip] __: B16,
    state: B4,
    #[skip] __: B60,
    page_offset: B7,
    #[skip] __: u8,
    log_eq_size: B5,
    #[skip] __: B24,
    eq_period: u16,
    eq_max_count: u16,
    #[skip] __: B22,
    intr: B10,
    #[skip] __: B2,
    log_page_size: B6,
    #[skip] __: u16,
    // the last three bits must be zero
    mtt_base_addr: B40,
    #[skip] __: B72,
    consumer_index: B24,
    #[skip] __: u8,
    producer_index: B24,
    #[skip] __: B96,
}

/// Running counters for the resource numbers we hand out.
///
/// Numbers are never reused; none of the queues are reclaimed either.
pub(super) struct Offsets {
    next_cqn: usize,
    next_qpn: usize,
    next_dmpt: u32,
    next_eqn: usize,
    next_sqc_doorbell_index: usize,
    next_eq_doorbell_index: usize,
}

impl Offsets {
    /// Initialize the queue offsets.
    pub(super) fn init(caps: &Capabilities) -> Self {
        Self {
            // the first non-reserved cq, qp, mr and eq number
            next_cqn: 1 << caps.log2_rsvd_cqs(),
            next_qpn: 1 << caps.log2_rsvd_qps(),
            next_dmpt: 1 << caps.log2_rsvd_mrws(),
            next_eqn: caps.num_rsvd_eqs().into(),
            // the SQ and CQ UAR doorbell indices start from 128
            next_sqc_doorbell_index: 128,
            // Each UAR has 4 EQ doorbells; so if a UAR is reserved,
            // then we can't use any EQs whose doorbell falls on that page,
            // even if the EQ itself isn't reserved.
            next_eq_doorbell_index: caps.num_rsvd_eqs() as usize / 4,
        }
    }

    /// Allocate an event queue number.
    fn alloc_eqn(&mut self) -> usize {
        let res = self.next_eqn;
        self.next_eqn += 1;
        res
    }

    /// Allocate a completion queue number.
    pub(super) fn alloc_cqn(&mut self) -> usize {
        let res = self.next_cqn;
        self.next_cqn += 1;
        res
    }

    /// Allocate a queue pair number.
    pub(super) fn alloc_qpn(&mut self) -> usize {
        let res = self.next_qpn;
        self.next_qpn += 1;
        res
    }

    /// Allocate a memory region index.
    ///
    /// Indices step by 256 so that the low key byte stays free for
    /// key versioning.
    pub(super) fn alloc_dmpt(&mut self) -> u32 {
        let res = self.next_dmpt;
        self.next_dmpt += 256;
        res
    }

    /// Allocate a doorbell index for a send or completion queue.
    pub(super) fn alloc_scq_db(&mut self) -> usize {
        let res = self.next_sqc_doorbell_index;
        self.next_sqc_doorbell_index += 1;
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_eq(num_entries: usize) -> EventQueue {
        let memory = create_contiguous_mapping(num_entries * EQE_SIZE).unwrap();
        EventQueue {
            number: 3, num_entries, num_pages: 1, memory: Some(memory),
            mtt: 0, consumer_index: 0, mapped_mask: 0,
            events: VecDeque::new(),
        }
    }

    /// Pretend to be the card and post the k-th event.
    fn post(eq: &mut EventQueue, k: usize, event_type: u8, data: [u8; 24]) {
        let eqe = EventQueueEntry {
            _reserved1: 0, event_type, _reserved2: 0, subtype: 0, data,
            _reserved3: [0; 3],
            owner: if k & eq.num_entries == 0 { 0x80 } else { 0 },
        };
        let slot = k & (eq.num_entries - 1);
        let memory = &mut eq.memory.as_mut().unwrap().0;
        *memory.as_type_mut(slot * EQE_SIZE).unwrap() = eqe;
    }

    #[test]
    fn zeroed_ring_has_no_events() {
        let mut eq = test_eq(128);
        assert!(eq.get_next_eqe_sw().unwrap().is_none());
        eq.memory.take();
    }

    #[test]
    fn completion_events_decode_across_the_wrap() {
        let mut eq = test_eq(128);
        for k in 0..130 {
            assert!(eq.get_next_eqe_sw().unwrap().is_none());
            let mut data = [0; 24];
            BigEndian::write_u32(&mut data[0..4], k as u32);
            post(&mut eq, k, EventType::Completion as u8, data);
            let eqe = eq.get_next_eqe_sw().unwrap().expect("event should be ready");
            assert_eq!(decode(&eqe), Event::Completion { cqn: k as u32 });
            eq.consumer_index += 1;
        }
        eq.memory.take();
    }

    #[test]
    fn command_completions_carry_token_and_status() {
        let mut data = [0; 24];
        BigEndian::write_u16(&mut data[0..2], 0x1234);
        data[9] = 0x40;
        BigEndian::write_u64(&mut data[10..18], 0xdead_beef);
        let eqe = EventQueueEntry {
            _reserved1: 0, event_type: EventType::CommandComplete as u8,
            _reserved2: 0, subtype: 0, data, _reserved3: [0; 3], owner: 0x80,
        };
        assert_eq!(decode(&eqe), Event::CommandComplete {
            token: 0x1234, status: 0x40, out_param: 0xdead_beef,
        });
    }
}
