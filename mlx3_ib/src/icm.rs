//! The InfiniBand Context Memory: host memory the card borrows to keep
//! its queue contexts and translation tables in.
//!
//! Also home to the memory region table, since regions live in the
//! MTT and dMPT parts of the ICM.


use alloc::vec::Vec;
use byteorder::BigEndian;
use modular_bitfield_msb::{bitfield, specifiers::B24};
use zerocopy::{FromBytes, U64};

use super::cmd::{CommandInterface, Opcode};
use super::dma::{create_contiguous_mapping, DmaPages, PhysicalAddress, PAGE_SIZE};
use super::fw::{map_memory, Capabilities, InitHcaParameters};
use super::hal::Hal;
use super::mcg::get_mgm_entry_size;

pub(super) const ICM_PAGE_SHIFT: u8 = 12;

/// Size of a single address translation entry.
const MTT_ENTRY_SIZE: u64 = 8;
const MTT_FLAG_PRESENT: u64 = 1;
const LOG_MTT_PER_SEG: usize = 3;

#[repr(u64)]
#[derive(Default, Clone, Copy)]
enum CmptType {
    #[default] QP, SRQ, CQ, EQ,
}

/// A mapped ICM auxiliary area.
///
/// Instead of dropping, please unmap the area from the card.
pub(super) struct MappedIcmAuxiliaryArea {
    pages: DmaPages,
    physical: PhysicalAddress,
}

impl MappedIcmAuxiliaryArea {
    pub(super) fn new(pages: DmaPages, physical: PhysicalAddress) -> Self {
        Self { pages, physical }
    }

    /// Unmaps the area from the card.
    pub(super) fn unmap<H: Hal>(
        self, cmd: &mut CommandInterface<H>,
    ) -> Result<(), &'static str> {
        trace!("unmapping ICM auxiliary area...");
        cmd.execute_command::<_, _, ()>(Opcode::UnmapIcmAux, (), (), 0)?;
        trace!("successfully unmapped ICM auxiliary area");
        let _ = (&self.pages, self.physical);
        core::mem::forget(self); // don't run the drop handler in this case
        Ok(())
    }

    pub(super) fn map_icm_tables<H: Hal>(
        &self, cmd: &mut CommandInterface<H>,
        init_hca_params: &InitHcaParameters, caps: &Capabilities,
    ) -> Result<MappedIcmTables, &'static str> {
        const CMPT_SHIFT: u8 = 24;
        let cmpt_virt = |typ: CmptType| {
            init_hca_params.cmpt_base
                + ((typ as u64 * caps.c_mpt_entry_sz() as u64) << CMPT_SHIFT)
        };
        // Every table that was already mapped when a later one fails
        // is unmapped again, so a mid-sequence error leaves the card clean.
        let mut created = Vec::new();
        // first, the cmpt tables
        self.init_or_unwind(
            cmd, &mut created, caps.c_mpt_entry_sz(), init_hca_params.num_qps,
            1 << caps.log2_rsvd_qps(), cmpt_virt(CmptType::QP),
        )?;
        self.init_or_unwind(
            cmd, &mut created, caps.c_mpt_entry_sz(), init_hca_params.num_srqs,
            1 << caps.log2_rsvd_srqs(), cmpt_virt(CmptType::SRQ),
        )?;
        self.init_or_unwind(
            cmd, &mut created, caps.c_mpt_entry_sz(), init_hca_params.num_cqs,
            1 << caps.log2_rsvd_cqs(), cmpt_virt(CmptType::CQ),
        )?;
        self.init_or_unwind(
            cmd, &mut created, caps.c_mpt_entry_sz(), init_hca_params.num_eqs,
            init_hca_params.num_eqs, cmpt_virt(CmptType::EQ),
        )?;
        trace!("mapped cMPT tables");

        // then, the rest
        self.init_or_unwind(
            cmd, &mut created, caps.eqc_entry_sz(), init_hca_params.num_eqs,
            init_hca_params.num_eqs, init_hca_params.eqc_base,
        )?;
        let reserved_mtts = reserved_mtts(
            1 << caps.log2_rsvd_mtts(), caps.mtt_entry_sz().into(),
        );
        self.init_or_unwind(
            cmd, &mut created, caps.mtt_entry_sz(), init_hca_params.num_mtts,
            reserved_mtts, init_hca_params.mtt_base,
        )?;
        self.init_or_unwind(
            cmd, &mut created, caps.d_mpt_entry_sz(), init_hca_params.num_mpts,
            1 << caps.log2_rsvd_mrws(), init_hca_params.dmpt_base,
        )?;
        self.init_or_unwind(
            cmd, &mut created, caps.qpc_entry_sz(), init_hca_params.num_qps,
            1 << caps.log2_rsvd_qps(), init_hca_params.qpc_base,
        )?;
        self.init_or_unwind(
            cmd, &mut created, caps.aux_entry_sz(), init_hca_params.num_qps,
            1 << caps.log2_rsvd_qps(), init_hca_params.auxc_base,
        )?;
        self.init_or_unwind(
            cmd, &mut created, caps.altc_entry_sz(), init_hca_params.num_qps,
            1 << caps.log2_rsvd_qps(), init_hca_params.altc_base,
        )?;
        self.init_or_unwind(
            cmd, &mut created,
            caps.rdmarc_entry_sz() << init_hca_params.rdmarc_shift,
            init_hca_params.num_qps, 1 << caps.log2_rsvd_qps(),
            init_hca_params.rdmarc_base,
        )?;
        self.init_or_unwind(
            cmd, &mut created, caps.cqc_entry_sz(), init_hca_params.num_cqs,
            1 << caps.log2_rsvd_cqs(), init_hca_params.cqc_base,
        )?;
        self.init_or_unwind(
            cmd, &mut created, caps.srq_entry_sz(), init_hca_params.num_srqs,
            1 << caps.log2_rsvd_srqs(), init_hca_params.srqc_base,
        )?;
        self.init_or_unwind(
            cmd, &mut created, get_mgm_entry_size().try_into().unwrap(),
            init_hca_params.num_mgms + init_hca_params.num_amgms,
            init_hca_params.num_mgms + init_hca_params.num_amgms,
            init_hca_params.mc_base,
        )?;
        trace!("ICM tables mapped successfully");

        // same order as the calls above
        let mut tables = created.into_iter();
        let mut next = || tables.next().ok_or("missing ICM table");
        let qp_cmpt_table = next()?;
        let srq_cmpt_table = next()?;
        let cq_cmpt_table = next()?;
        let eq_cmpt_table = next()?;
        let eq_table = next()?;
        let mtt_table = next()?;
        let dmpt_table = next()?;
        let qpc_table = next()?;
        let auxc_table = next()?;
        let altc_table = next()?;
        let rdmarc_table = next()?;
        let cqc_table = next()?;
        let srqc_table = next()?;
        let mcg_table = next()?;
        Ok(MappedIcmTables {
            cq_table: Some(CqTable {
                table: cqc_table,
                cmpt_table: cq_cmpt_table,
            }),
            qp_table: Some(QpTable {
                table: qpc_table,
                cmpt_table: qp_cmpt_table,
                auxc_table, altc_table, rdmarc_table,
                rdmarc_base: init_hca_params.rdmarc_base,
                rdmarc_shift: init_hca_params.rdmarc_shift,
            }),
            eq_table: Some(EqTable {
                table: eq_table,
                cmpt_table: eq_cmpt_table,
            }),
            srq_table: Some(SrqTable {
                table: srqc_table,
                cmpt_table: srq_cmpt_table,
            }),
            mr_table: Some(MrTable {
                next_mtt: reserved_mtts
                    .next_multiple_of(1 << LOG_MTT_PER_SEG) as u64,
                mtt_base: init_hca_params.mtt_base,
                mtt_table, dmpt_table,
            }),
            mcg_table: Some(mcg_table),
        })
    }

    fn init_or_unwind<H: Hal>(
        &self, cmd: &mut CommandInterface<H>, created: &mut Vec<IcmTable>,
        obj_size: u16, obj_num: usize, reserved: usize, virt: u64,
    ) -> Result<(), &'static str> {
        match self.init_icm_table(cmd, obj_size, obj_num, reserved, virt) {
            Ok(table) => {
                created.push(table);
                Ok(())
            }
            Err(err) => {
                while let Some(table) = created.pop() {
                    table.unmap(cmd)?;
                }
                Err(err)
            }
        }
    }

    /// Map the chunks of a table that cover its reserved entries.
    ///
    /// The remaining chunks would be mapped on demand; nothing in this
    /// driver allocates outside the reserved ranges plus what the chunks
    /// round up to.
    fn init_icm_table<H: Hal>(
        &self, cmd: &mut CommandInterface<H>, obj_size: u16, obj_num: usize,
        reserved: usize, virt: u64,
    ) -> Result<IcmTable, &'static str> {
        // We allocate in as big chunks as we can,
        // up to a maximum of 256 KB per chunk.
        const TABLE_CHUNK_SIZE: usize = 1 << 18;

        let table_size = obj_size as usize * obj_num;
        let obj_per_chunk = TABLE_CHUNK_SIZE / obj_size as usize;
        let icm_num = (obj_num + obj_per_chunk - 1) / obj_per_chunk;
        let mut icm = Vec::new();
        // map the reserved entries
        let mut idx = 0;
        while idx * TABLE_CHUNK_SIZE < reserved * obj_size as usize {
            let mut chunk_size = TABLE_CHUNK_SIZE;
            if (idx + 1) * chunk_size > table_size {
                chunk_size = (table_size - idx * TABLE_CHUNK_SIZE)
                    .next_multiple_of(PAGE_SIZE);
            }
            let mut num_pages: u32 = (chunk_size / PAGE_SIZE).try_into().unwrap();
            if num_pages == 0 {
                num_pages = 1;
                chunk_size = num_pages as usize * PAGE_SIZE;
            }
            let mapped = MappedIcm::new(
                cmd, chunk_size, num_pages,
                virt + (idx * TABLE_CHUNK_SIZE) as u64,
            );
            match mapped {
                Ok(mapped) => icm.push(mapped),
                Err(err) => {
                    // release the chunks this table already got
                    while let Some(mapped) = icm.pop() {
                        mapped.unmap(cmd)?;
                    }
                    return Err(err);
                }
            }
            idx += 1;
        }
        Ok(IcmTable {
            virt, obj_num, obj_size, icm_num, icm,
        })
    }
}

impl Drop for MappedIcmAuxiliaryArea {
    fn drop(&mut self) {
        panic!("please unmap instead of dropping")
    }
}

/// Reserved MTT entries must be aligned up to a cacheline boundary, since
/// the firmware will write to them, while the driver writes to all other
/// MTT entries. (The entry size passed here is really the MTT segment
/// size, not the raw entry size.)
fn reserved_mtts(reserved: usize, entry_size: usize) -> usize {
    (reserved * entry_size).next_multiple_of(64) / entry_size
}

struct IcmTable {
    virt: u64,
    obj_num: usize,
    obj_size: u16,
    /// the available number of Icms
    icm_num: usize,
    /// must contain less than icm_num entries
    icm: Vec<MappedIcm>,
}

impl IcmTable {
    fn unmap<H: Hal>(
        mut self, cmd: &mut CommandInterface<H>,
    ) -> Result<(), &'static str> {
        while let Some(icm) = self.icm.pop() {
            icm.unmap(cmd)?;
        }
        Ok(())
    }
}

struct CqTable {
    table: IcmTable,
    cmpt_table: IcmTable,
}

struct QpTable {
    table: IcmTable,
    cmpt_table: IcmTable,
    auxc_table: IcmTable,
    altc_table: IcmTable,
    rdmarc_table: IcmTable,
    rdmarc_base: u64,
    rdmarc_shift: u8,
}

struct EqTable {
    table: IcmTable,
    cmpt_table: IcmTable,
}

struct SrqTable {
    table: IcmTable,
    cmpt_table: IcmTable,
}

/// The memory region table: address translation entries and protection
/// table entries, plus the cursor for handing the former out.
///
/// The cursor only walks back when the newest range is retired, so
/// regions destroyed in reverse creation order free their entries.
pub(super) struct MrTable {
    mtt_table: IcmTable,
    dmpt_table: IcmTable,
    mtt_base: u64,
    /// index of the next free MTT entry, segment aligned
    next_mtt: u64,
}

impl MrTable {
    /// Write address translation entries for a physically contiguous
    /// buffer and return the MTT address to point a context at.
    pub(super) fn alloc_mtt<H: Hal>(
        &mut self, cmd: &mut CommandInterface<H>, _caps: &Capabilities,
        num_pages: usize, physical: PhysicalAddress,
    ) -> Result<u64, &'static str> {
        // at most this many entries fit after the 16-byte mailbox header
        const BATCH: usize = 256;

        let per_seg = 1 << LOG_MTT_PER_SEG;
        let index = self.next_mtt;
        let segments = (num_pages + per_seg - 1) / per_seg;
        self.next_mtt += (segments * per_seg) as u64;
        if self.next_mtt > self.mtt_table.obj_num as u64 {
            return Err("out of MTT entries");
        }

        let mtt_address = self.mtt_base + index * MTT_ENTRY_SIZE;
        let (mut mailbox, mailbox_physical) = create_contiguous_mapping(PAGE_SIZE)?;
        let mut written = 0;
        while written < num_pages {
            let batch = (num_pages - written).min(BATCH);
            let mtt: &mut WriteMttMailbox = mailbox.as_type_mut(0)?;
            mtt.offset.set(mtt_address + (written as u64) * MTT_ENTRY_SIZE);
            for i in 0..batch {
                mtt.entries[i].set(
                    (physical.value() + (written + i) * PAGE_SIZE) as u64
                    | MTT_FLAG_PRESENT
                );
            }
            cmd.execute_command::<_, _, ()>(
                Opcode::WriteMtt, (), mailbox_physical.value() as u64,
                batch as u32,
            )?;
            written += batch;
        }
        trace!("wrote {num_pages} MTT entries at {mtt_address:#x}");
        Ok(mtt_address)
    }

    /// Create a memory region over a physically contiguous buffer
    /// and pass its entry to the hardware.
    pub(super) fn create_region<H: Hal>(
        &mut self, cmd: &mut CommandInterface<H>, caps: &Capabilities,
        index: u32, pd: u32, start: u64, length: u64,
        num_pages: usize, physical: PhysicalAddress,
    ) -> Result<MemoryRegion, &'static str> {
        use super::device::PAGE_SHIFT;

        const MPT_FLAG_MIO: u32 = 1 << 17;
        const MPT_FLAG_REGION: u32 = 1 << 8;
        const MPT_PERM_LOCAL_READ: u32 = 1 << 10;
        const MPT_PERM_LOCAL_WRITE: u32 = 1 << 11;

        let mtt = self.alloc_mtt(cmd, caps, num_pages, physical)?;
        let mtt_entries = num_pages.next_multiple_of(1 << LOG_MTT_PER_SEG) as u64;
        let key = hw_key(index);
        let mut entry = MemoryProtectionTableEntry::new();
        entry.set_flags(
            MPT_FLAG_MIO | MPT_FLAG_REGION
            | MPT_PERM_LOCAL_READ | MPT_PERM_LOCAL_WRITE
        );
        entry.set_key(key);
        entry.set_pd_flags(pd);
        entry.set_start(start);
        entry.set_length(length);
        entry.set_entity_size(PAGE_SHIFT.into());
        entry.set_mtt_addr(mtt);
        entry.set_mtt_sz(num_pages as u32);
        cmd.execute_command::<_, _, ()>(
            Opcode::Sw2HwMpt, (), &entry.bytes[..], index,
        )?;
        trace!("created memory region {index} with key {key:#x}");
        Ok(MemoryRegion { index, lkey: key, rkey: key, mtt, mtt_entries })
    }

    /// Take a region back from the hardware.
    ///
    /// Its translation entries come back to the allocator only if the
    /// region was the most recently created one.
    pub(super) fn destroy_region<H: Hal>(
        &mut self, cmd: &mut CommandInterface<H>, region: MemoryRegion,
    ) -> Result<(), &'static str> {
        cmd.execute_command::<_, _, ()>(Opcode::Hw2SwMpt, (), (), region.index)?;
        let index = (region.mtt - self.mtt_base) / MTT_ENTRY_SIZE;
        if index + region.mtt_entries == self.next_mtt {
            self.next_mtt = index;
        }
        Ok(())
    }
}

/// The key the hardware derives from a dMPT index.
fn hw_key(index: u32) -> u32 {
    (index << 8) | (index >> 24)
}

#[derive(Clone, Debug)]
pub(super) struct MemoryRegion {
    index: u32,
    pub(super) lkey: u32,
    pub(super) rkey: u32,
    /// MTT address of the first translation entry
    mtt: u64,
    /// number of translation entries, segment aligned
    mtt_entries: u64,
}

#[derive(FromBytes)]
#[repr(C, packed)]
struct WriteMttMailbox {
    offset: U64<BigEndian>,
    _reserved: u64,
    entries: [U64<BigEndian>; 256],
}

#[bitfield]
struct MemoryProtectionTableEntry {
    flags: u32,
    qpn: u32,
    key: u32,
    pd_flags: u32,
    start: u64,
    length: u64,
    lkey: u32,
    win_cnt: u32,
    #[skip] __: B24,
    mtt_rep: u8,
    mtt_addr: u64,
    mtt_sz: u32,
    entity_size: u32,
    first_byte_offset: u32,
}

/// An ICM mapping.
struct MappedIcm {
    pages: DmaPages,
    physical: PhysicalAddress,
    card_virtual: u64,
    num_pages: u32,
}

impl MappedIcm {
    /// Allocate and map an ICM chunk.
    fn new<H: Hal>(
        cmd: &mut CommandInterface<H>, chunk_size: usize, num_pages: u32,
        card_virtual: u64,
    ) -> Result<Self, &'static str> {
        let (pages, physical) = create_contiguous_mapping(chunk_size)?;
        map_memory(
            cmd, Opcode::MapIcm, Some(card_virtual), physical,
            num_pages as u64 * PAGE_SIZE as u64,
        )?;
        Ok(Self { pages, physical, card_virtual, num_pages })
    }

    /// Unmaps the chunk from the card.
    fn unmap<H: Hal>(
        self, cmd: &mut CommandInterface<H>,
    ) -> Result<(), &'static str> {
        cmd.execute_command::<_, _, ()>(
            Opcode::UnmapIcm, (), self.card_virtual, self.num_pages,
        )?;
        let _ = (&self.pages, self.physical);
        core::mem::forget(self); // don't run the drop handler in this case
        Ok(())
    }
}

impl Drop for MappedIcm {
    fn drop(&mut self) {
        panic!("please unmap instead of dropping")
    }
}

pub(super) struct MappedIcmTables {
    cq_table: Option<CqTable>,
    qp_table: Option<QpTable>,
    eq_table: Option<EqTable>,
    srq_table: Option<SrqTable>,
    mr_table: Option<MrTable>,
    mcg_table: Option<IcmTable>,
}

impl MappedIcmTables {
    pub(super) fn memory_regions(&mut self) -> &mut MrTable {
        self.mr_table.as_mut().unwrap()
    }

    /// Unmaps the tables from the card.
    pub(super) fn unmap<H: Hal>(
        mut self, cmd: &mut CommandInterface<H>,
    ) -> Result<(), &'static str> {
        trace!("unmapping ICM tables...");
        if let Some(eq_table) = self.eq_table.take() {
            eq_table.table.unmap(cmd)?;
            eq_table.cmpt_table.unmap(cmd)?;
        }
        if let Some(cq_table) = self.cq_table.take() {
            cq_table.table.unmap(cmd)?;
            cq_table.cmpt_table.unmap(cmd)?;
        }
        if let Some(qp_table) = self.qp_table.take() {
            qp_table.table.unmap(cmd)?;
            qp_table.rdmarc_table.unmap(cmd)?;
            qp_table.altc_table.unmap(cmd)?;
            qp_table.auxc_table.unmap(cmd)?;
            qp_table.cmpt_table.unmap(cmd)?;
        }
        if let Some(mr_table) = self.mr_table.take() {
            mr_table.dmpt_table.unmap(cmd)?;
            mr_table.mtt_table.unmap(cmd)?;
        }
        if let Some(mcg_table) = self.mcg_table.take() {
            mcg_table.unmap(cmd)?;
        }
        if let Some(srq_table) = self.srq_table.take() {
            srq_table.table.unmap(cmd)?;
            srq_table.cmpt_table.unmap(cmd)?;
        }
        trace!("successfully unmapped ICM tables");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_mtts_round_up_to_a_cacheline() {
        // 1 reserved entry of 8 bytes still reserves a whole cacheline
        assert_eq!(reserved_mtts(1, 8), 8);
        // segment-sized entries are already aligned
        assert_eq!(reserved_mtts(16, 64), 16);
    }

    #[test]
    fn memory_keys_mix_in_the_index() {
        assert_eq!(hw_key(0), 0);
        assert_eq!(hw_key(0x100), 0x10000);
        assert_eq!(hw_key(0xab00_0001), 0x1ab);
    }

    #[test]
    fn mpt_entry_is_wire_sized() {
        assert_eq!(size_of::<MemoryProtectionTableEntry>(), 64);
    }

    #[test]
    fn translation_entries_come_back_in_reverse_order() {
        use spin::Mutex;
        use super::super::cmd::CommandState;
        use super::super::sim::SimDevice;

        fn table(obj_num: usize) -> IcmTable {
            IcmTable { virt: 0, obj_num, obj_size: 8, icm_num: 1, icm: Vec::new() }
        }

        let hal = SimDevice::new();
        let state = Mutex::new(CommandState::default());
        let mut cmd = CommandInterface::new(&hal, &state);
        let caps = Capabilities::new();
        let (_pages, physical) = create_contiguous_mapping(PAGE_SIZE).unwrap();
        let mut mr_table = MrTable {
            mtt_table: table(1024),
            dmpt_table: table(1024),
            mtt_base: 0,
            next_mtt: 0,
        };

        let per_seg = 1 << LOG_MTT_PER_SEG;
        let first = mr_table.alloc_mtt(&mut cmd, &caps, 1, physical).unwrap();
        let second = mr_table.alloc_mtt(&mut cmd, &caps, 1, physical).unwrap();
        assert_eq!(mr_table.next_mtt, 2 * per_seg as u64);

        // retiring the older range leaves the cursor alone
        mr_table.destroy_region(&mut cmd, MemoryRegion {
            index: 0, lkey: 0, rkey: 0, mtt: first, mtt_entries: per_seg as u64,
        }).unwrap();
        assert_eq!(mr_table.next_mtt, 2 * per_seg as u64);

        // the newest range walks it back
        mr_table.destroy_region(&mut cmd, MemoryRegion {
            index: 1, lkey: 0, rkey: 0, mtt: second, mtt_entries: per_seg as u64,
        }).unwrap();
        assert_eq!(mr_table.next_mtt, per_seg as u64);
    }
}
