//! This module contains functionality to interact with the firmware.

use core::mem::size_of;

use alloc::vec::Vec;
use byteorder::BigEndian;
use mlx_infiniband::ibv_mtu;
use modular_bitfield_msb::{bitfield, specifiers::{B1, B10, B11, B12, B15, B2, B24, B3, B31, B36, B4, B5, B56, B6, B7, B72}};
use zerocopy::{FromBytes, U16, U64};

use super::cmd::{CommandInterface, MadDemuxOpcodeModifier, Opcode};
use super::device::{DEFAULT_UAR_PAGE_SHIFT, PAGE_SHIFT};
use super::dma::{create_contiguous_mapping, DmaPages, PhysicalAddress, PAGE_SIZE};
use super::hal::Hal;
use super::icm::{MappedIcmAuxiliaryArea, ICM_PAGE_SHIFT};
use super::port::Port;

/// Mapping commands take chunks of at most 256 KiB.
pub(super) const MAX_CHUNK_LOG2: u32 = 18;

/// Byte offset of the send doorbell within a UAR page.
pub(super) const DOORBELL_SEND_QUEUE_NUMBER: usize = 0x14;
/// Byte offset of the CQ command doorbell within a UAR page.
pub(super) const DOORBELL_CQ_SN_CMD_NUM: usize = 0x20;
/// Byte offset of the CQ consumer index doorbell within a UAR page.
pub(super) const DOORBELL_CQ_CONSUMER_INDEX: usize = 0x24;
/// Byte offset of the first of the four EQ doorbells of a UAR page.
pub(super) const DOORBELL_EQ_BASE: usize = 0x800;

/// Get the offset of a doorbell register in the User Access Region.
pub(super) fn doorbell_offset(uar_idx: usize, register: usize) -> usize {
    (uar_idx << PAGE_SHIFT) + register
}

/// Get the offset of an event queue doorbell in the User Access Region.
///
/// Each UAR page carries four EQ doorbells.
pub(super) fn eq_doorbell_offset(eqn: usize) -> usize {
    ((eqn / 4) << PAGE_SHIFT) + DOORBELL_EQ_BASE + 8 * (eqn % 4)
}

#[derive(Clone, FromBytes)]
#[repr(C, packed)]
pub(super) struct Firmware {
    pages: U16<BigEndian>,
    major: U16<BigEndian>,
    sub_minor: U16<BigEndian>,
    minor: U16<BigEndian>,
    _padding1: u16,
    ix_rev: U16<BigEndian>,
    _padding2: [u8; 22], // contains the build timestamp
    clr_int_base: U64<BigEndian>,
    clr_int_bar: u8,
    // many fields follow
}

impl Firmware {
    pub(super) fn query<H: Hal>(
        cmd: &mut CommandInterface<H>,
    ) -> Result<Self, &'static str> {
        let pages: DmaPages = cmd.execute_command(Opcode::QueryFw, (), (), 0)?;
        let mut fw = pages.as_type::<Firmware>(0)?.clone();
        // the bar is encoded in the upper two bits
        fw.clr_int_bar = (fw.clr_int_bar >> 6) * 2;
        trace!("got firmware info: {fw:?}");
        Ok(fw)
    }

    pub(super) fn map_area<H: Hal>(
        self, cmd: &mut CommandInterface<H>,
    ) -> Result<MappedFirmwareArea, &'static str> {
        trace!("mapping firmware area...");
        let size = PAGE_SIZE * usize::from(self.pages);
        let (pages, physical) = create_contiguous_mapping(size)?;
        map_memory(cmd, Opcode::MapFa, None, physical, size as u64)?;
        trace!("mapped {} pages for firmware area", self.pages);
        Ok(MappedFirmwareArea { pages, physical, icm_aux_area: None })
    }

    pub(super) fn version(&self) -> (u16, u16, u16) {
        (self.major.get(), self.minor.get(), self.sub_minor.get())
    }

    /// The location of the clear interrupt register, as (bar, offset).
    pub(super) fn clr_int(&self) -> (u8, u64) {
        (self.clr_int_bar, self.clr_int_base.get())
    }
}

impl core::fmt::Debug for Firmware {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f
            .debug_struct("Firmware")
            .field("clr_int_bar", &self.clr_int_bar)
            .field("clr_int_base", &format_args!("{:#x}", self.clr_int_base))
            .field("version", &format_args!("{}.{}.{}", self.major, self.minor, self.sub_minor))
            .field("ix_rev", &self.ix_rev.get())
            .field("size", &format_args!(
                "{}.{} KB",
                (self.pages.get() as usize * PAGE_SIZE) / 1024,
                (self.pages.get() as usize * PAGE_SIZE) % 1024,
            ))
            .finish()
    }
}

#[derive(Clone, FromBytes, Default)]
#[repr(C, packed)]
pub(super) struct VirtualPhysicalMapping {
    // actually just 52 bits
    pub(super) virtual_address: U64<BigEndian>,
    // actually just 52 bits and then log2size
    pub(super) physical_address: U64<BigEndian>,
}

/// Hand a physically contiguous memory area to the card, chunk by chunk.
///
/// This is the common part of MAP_FA, MAP_ICM_AUX and MAP_ICM. Chunks are
/// as large as the alignment of the area allows and as many mapping entries
/// are batched into a mailbox as fit.
pub(super) fn map_memory<H: Hal>(
    cmd: &mut CommandInterface<H>, opcode: Opcode, mut virtual_address: Option<u64>,
    physical: PhysicalAddress, size: u64,
) -> Result<(), &'static str> {
    let align = (physical.value().trailing_zeros()).min(MAX_CHUNK_LOG2);
    let chunk = 1u64 << align;
    let mut count = size / chunk;
    if size % chunk != 0 {
        count += 1;
    }
    let entries_per_mailbox = PAGE_SIZE / size_of::<VirtualPhysicalMapping>();
    let (mut vpm_pages, vpm_physical) = create_contiguous_mapping(PAGE_SIZE)?;
    let mut pointer = physical;
    while count > 0 {
        let batch = count.min(entries_per_mailbox as u64);
        for i in 0..batch {
            let vpm: &mut VirtualPhysicalMapping = vpm_pages
                .as_type_mut(i as usize * size_of::<VirtualPhysicalMapping>())?;
            if let Some(virt) = virtual_address.as_mut() {
                vpm.virtual_address.set(*virt);
                *virt += chunk;
            }
            vpm.physical_address.set(
                pointer.value() as u64 | u64::from(align - u32::from(ICM_PAGE_SHIFT))
            );
            pointer += chunk as usize;
        }
        cmd.execute_command::<_, _, ()>(
            opcode, (), vpm_physical.value() as u64, batch as u32,
        )?;
        count -= batch;
    }
    Ok(())
}

/// A mapped firmware area.
///
/// Instead of dropping, please unmap the area from the card.
pub(super) struct MappedFirmwareArea {
    pages: DmaPages,
    physical: PhysicalAddress,
    icm_aux_area: Option<MappedIcmAuxiliaryArea>,
}

impl MappedFirmwareArea {
    pub(super) fn run<H: Hal>(
        &self, cmd: &mut CommandInterface<H>,
    ) -> Result<(), &'static str> {
        cmd.execute_command::<_, _, ()>(Opcode::RunFw, (), (), 0)?;
        trace!("successfully run firmware");
        Ok(())
    }

    /// Query the device capabilities, retrying on implausible answers.
    ///
    /// Right after RUN_FW the firmware occasionally reports a maximum ICM
    /// size of zero; asking again returns the real values.
    pub(super) fn query_capabilities<H: Hal>(
        &self, cmd: &mut CommandInterface<H>,
    ) -> Result<Capabilities, &'static str> {
        let mut last = "failed to query capabilities";
        for _ in 0..3 {
            match self.try_query_capabilities(cmd) {
                Ok(caps) if caps.max_icm_sz() == 0 => {
                    last = "reported maximum ICM size of zero";
                }
                Ok(caps) => return Ok(caps),
                Err(err) => last = err,
            }
        }
        Err(last)
    }

    fn try_query_capabilities<H: Hal>(
        &self, cmd: &mut CommandInterface<H>,
    ) -> Result<Capabilities, &'static str> {
        let pages: DmaPages = cmd.execute_command(Opcode::QueryDevCap, (), (), 0)?;
        let mut caps = Capabilities::from_bytes(pages.as_slice(
            0, size_of::<Capabilities>()
        )?.try_into().map_err(|_| "capability page too short")?);
        // each UAR has 4 EQ doorbells; so if a UAR is reserved,
        // then we can't use any EQs whose doorbell falls on that page,
        // even if the EQ itself isn't reserved
        if caps.num_rsvd_uars() * 4 > caps.num_rsvd_eqs() {
            caps.set_num_rsvd_eqs(caps.num_rsvd_uars() * 4);
        }
        trace!("got caps: {:?}", caps);
        Ok(caps)
    }

    /// Set the ICM size.
    ///
    /// Returns `aux_pages`, the auxiliary ICM size in pages.
    pub(super) fn set_icm<H: Hal>(
        &self, cmd: &mut CommandInterface<H>, icm_size: u64,
    ) -> Result<u64, &'static str> {
        let aux_pages: u64 = cmd.execute_command(
            Opcode::SetIcmSize, (), icm_size, 0,
        )?;
        trace!("ICM auxiliary area requires {aux_pages} 4K pages");
        Ok(aux_pages)
    }

    /// Map the ICM auxiliary area.
    pub(super) fn map_icm_aux<H: Hal>(
        &mut self, cmd: &mut CommandInterface<H>, aux_pages: u64,
    ) -> Result<&MappedIcmAuxiliaryArea, &'static str> {
        if self.icm_aux_area.is_some() {
            return Err("ICM auxiliary area has already been mapped");
        }
        trace!("mapping ICM auxiliary area...");
        let size = aux_pages * PAGE_SIZE as u64;
        let (pages, physical) = create_contiguous_mapping(size as usize)?;
        map_memory(cmd, Opcode::MapIcmAux, None, physical, size)?;
        trace!("mapped {} pages for ICM auxiliary area", aux_pages);
        self.icm_aux_area = Some(MappedIcmAuxiliaryArea::new(pages, physical));
        Ok(self.icm_aux_area.as_ref().unwrap())
    }

    /// Unmaps the area from the card. Further usage requires a software reset.
    pub(super) fn unmap<H: Hal>(
        mut self, cmd: &mut CommandInterface<H>,
    ) -> Result<(), &'static str> {
        if let Some(icm_aux_area) = self.icm_aux_area.take() {
            icm_aux_area.unmap(cmd)?;
        }
        trace!("unmapping firmware area...");
        cmd.execute_command::<_, _, ()>(Opcode::UnmapFa, (), (), 0)?;
        trace!("successfully unmapped firmware area");
        // actually free the memory
        let _ = &self.pages;
        let _ = self.physical;
        core::mem::forget(self); // don't run the drop handler in this case
        Ok(())
    }
}

impl Drop for MappedFirmwareArea {
    fn drop(&mut self) {
        panic!("please unmap instead of dropping")
    }
}

#[bitfield]
pub(super) struct Capabilities {
    #[skip] __: u128,
    log_max_srq_sz: u8,
    pub(super) log_max_qp_sz: u8,
    #[skip] __: B4,
    pub(super) log2_rsvd_qps: B4,
    #[skip] __: B3,
    pub(super) log_max_qp: B5,
    pub(super) log2_rsvd_srqs: B4,
    #[skip] __: B7,
    log_max_srqs: B5,
    #[skip] __: B2,
    num_rsvd_eec: B6,
    #[skip] __: B4,
    log_max_eec: B4,
    // deprecated
    pub(super) num_rsvd_eqs: u8,
    pub(super) log_max_cq_sz: u8,
    #[skip] __: B4,
    pub(super) log2_rsvd_cqs: B4,
    #[skip] __: B3,
    pub(super) log_max_cq: B5,
    log_max_eq_sz: u8,
    #[skip] __: B2,
    log_max_d_mpts: B6,
    // deprecated
    #[skip] __: B4,
    pub(super) log2_rsvd_eqs: B4,
    #[skip] __: B4,
    pub(super) log_max_eq: B4,
    pub(super) log2_rsvd_mtts: B4,
    #[skip] __: B4,
    #[skip] __: B1,
    log_max_mrw_sz: B7,
    #[skip] __: B4,
    pub(super) log2_rsvd_mrws: B4,
    #[skip] __: B2,
    log_max_mtts: B6,
    #[skip] __: u16,
    #[skip] __: B4,
    // not present in mlx3
    num_sys_eq: B12,
    // max_av?
    #[skip] __: B10,
    log_max_ra_req_qp: B6,
    #[skip] __: B10,
    log_max_ra_res_qp: B6,
    #[skip] __: B11,
    log2_max_gso_sz: B5,
    rss: u8,
    #[skip] __: B2,
    rdma: B6,
    #[skip] __: B31,
    rsz_srq: B1,
    port_beacon: B1,
    #[skip] __: B7,
    pub(super) ack_delay: u8,
    mtu_width: u8,
    #[skip] __: B4,
    pub(super) num_ports: B4,
    #[skip] __: B3,
    pub(super) log_max_msg: B5,
    #[skip] __: u16,
    pub(super) max_gid: u8,
    rate_support: u16,
    cq_timestamp: B1,
    #[skip] __: B15,
    // max_pkey?
    ext_flags: u32,
    pub(super) cap_flags: u32,
    num_rsvd_uars: B4,
    #[skip] __: B6,
    uar_sz: B6,
    #[skip] __: u8,
    log_page_sz: u8,
    bf: B1,
    #[skip] __: B10,
    log_bf_reg_sz: B5,
    #[skip] __: B2,
    log_max_bf_regs_per_page: B6,
    #[skip] __: B2,
    log_max_bf_pages: B6,
    #[skip] __: u8,
    pub(super) max_sg_sq: u8,
    pub(super) max_desc_sz_sq: u16,
    #[skip] __: u8,
    pub(super) max_sg_rq: u8,
    pub(super) max_desc_sz_rq: u16,
    // user_mac_en?
    // svlan_by_qp?
    #[skip] __: B72,
    log_max_qp_mcg: u8,
    num_rsvd_mcgs: u8,
    log_max_mcg: u8,
    num_rsvd_pds: B4,
    #[skip] __: B7,
    log_max_pd: B5,
    num_rsvd_xrcds: B4,
    #[skip] __: B7,
    log_max_xrcd: B5,
    max_if_cnt_basic: u32,
    max_if_cnt_extended: u32,
    ext2_flags: u16,
    #[skip] __: u16,
    flow_steering_flags: u16,
    flow_steering_range: u8,
    flow_steering_max_qp_per_entry: u8,
    sl2vl_event: u8,
    #[skip] __: u8,
    cq_eq_cache_line_stride: u8,
    #[skip] __: B7,
    ecn_qcn_ver: B1,
    #[skip ]__: u32,
    pub(super) rdmarc_entry_sz: u16,
    pub(super) qpc_entry_sz: u16,
    pub(super) aux_entry_sz: u16,
    pub(super) altc_entry_sz: u16,
    pub(super) eqc_entry_sz: u16,
    pub(super) cqc_entry_sz: u16,
    pub(super) srq_entry_sz: u16,
    pub(super) c_mpt_entry_sz: u16,
    pub(super) mtt_entry_sz: u16,
    pub(super) d_mpt_entry_sz: u16,
    bmme_flags: u16,
    phv_en: u16,
    pub(super) rsvd_lkey: u32,
    diag_flags: u32,
    pub(super) max_icm_sz: u64,
    #[skip] __: u8,
    dmfs_high_rate_qpn_base: B24,
    #[skip] __: u8,
    dmfs_high_rate_qpn_range: B24,
    #[skip] __: B31,
    pub(super) mad_demux: B1,
    #[skip] __: u128,
    #[skip] __: u128,
    #[skip] __: B36,
    qp_rate_limit_max: B12,
    // actually just u12
    #[skip] __: B4,
    qp_rate_limit_min: B12,
    // reserved space follows
}

impl Capabilities {
    pub(super) fn bf_regs_per_page(&self) -> usize {
        if self.bf() == 1 {
            if 1 << self.log_max_bf_regs_per_page() > PAGE_SIZE / self.bf_reg_size() {
                3
            } else {
                1 << self.log_max_bf_regs_per_page()
            }
        } else {
            0
        }
    }

    pub(super) fn bf_reg_size(&self) -> usize {
        if self.bf() == 1 {
            1 << self.log_bf_reg_sz()
        } else {
            0
        }
    }

    pub(super) fn num_uars(&self) -> usize {
        usize::try_from(self.uar_size()).unwrap_or(PAGE_SIZE) / PAGE_SIZE
    }

    fn uar_size(&self) -> u64 {
        1 << (self.uar_sz() + 20)
    }

    /// Split the User Access Region into doorbells and BlueFlame registers.
    ///
    /// The first `num_uars` pages carry the doorbells, the pages after
    /// them the BlueFlame registers.
    pub(super) fn get_doorbells_and_blueflame(&self) -> (usize, BlueFlame) {
        let num_uars = self.num_uars();
        (num_uars, BlueFlame {
            base_page: num_uars,
            reg_size: self.bf_reg_size(),
            regs_per_page: self.bf_regs_per_page(),
        })
    }
}

impl core::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f
            .debug_struct("Capabilities")
            .field("BlueFlame available", &self.bf())
            .field("BlueFlame reg size", &self.bf_reg_size())
            .field("BlueFlame regs/page", &self.bf_regs_per_page())
            .field("Max ICM size (PB)", &(self.max_icm_sz() >> 50))
            .field("Max QPs", &(1 << self.log_max_qp()))
            .field("reserved QPs", &(1 << self.log2_rsvd_qps()))
            .field("QPC entry size", &self.qpc_entry_sz())
            .field("Max SRQs", &(1 << self.log_max_srqs()))
            .field("reserved SRQs", &(1 << self.log2_rsvd_srqs()))
            .field("SRQ entry size", &self.srq_entry_sz())
            .field("Max CQs", &(1 << self.log_max_cq()))
            .field("reserved CQs", &(1 << self.log2_rsvd_cqs()))
            .field("CQC entry size", &self.cqc_entry_sz())
            .field("Max EQs", &(1 << self.log_max_eq()))
            .field("reserved EQs", &(1 << self.log2_rsvd_eqs()))
            .field("EQC entry size", &self.eqc_entry_sz())
            .field("reserved MPTs", &(1 << self.log2_rsvd_mrws()))
            .field("reserved MTTs", &(1 << self.log2_rsvd_mtts()))
            .field("Max CQE count", &(1 << self.log_max_cq_sz()))
            .field("max QPE count", &(1 << self.log_max_qp_sz()))
            .field("MTT Entry Size", &self.mtt_entry_sz())
            .field("cMPT Entry Size", &self.c_mpt_entry_sz())
            .field("dMPT Entry Size", &self.d_mpt_entry_sz())
            .field("Reserved UAR", &self.num_rsvd_uars())
            .field("UAR Size", &self.uar_size())
            .field("Num UAR", &self.num_uars())
            .field("Network Port count", &self.num_ports())
            .field("Min Page Size", &(1 << self.log_page_sz()))
            .field("Max SQ desc size WQE Entry Size", &self.max_desc_sz_sq())
            .field("max SQ S/G WQE Entries", &self.max_sg_sq())
            .field("Max RQ desc size", &self.max_desc_sz_rq())
            .field("max RQ S/G", &self.max_sg_rq())
            .field("Max Message Size", &(1 << self.log_max_msg()))
            .finish()
    }
}

/// The location of the BlueFlame registers within the User Access Region.
#[derive(Clone, Debug)]
pub(super) struct BlueFlame {
    base_page: usize,
    reg_size: usize,
    regs_per_page: usize,
}

impl BlueFlame {
    pub(super) fn available(&self) -> bool {
        self.reg_size != 0 && self.regs_per_page != 0
    }

    pub(super) fn reg_size(&self) -> usize {
        self.reg_size
    }

    /// Get the offset of a BlueFlame register in the User Access Region.
    pub(super) fn register_offset(&self, index: usize) -> usize {
        let page = self.base_page + index / self.regs_per_page;
        (page << PAGE_SHIFT) + (index % self.regs_per_page) * self.reg_size
    }
}

/// The parameters the profile computed for INIT_HCA.
#[derive(Default)]
pub(super) struct InitHcaParameters {
    pub(super) qpc_base: u64,
    pub(super) rdmarc_base: u64,
    pub(super) auxc_base: u64,
    pub(super) altc_base: u64,
    pub(super) srqc_base: u64,
    pub(super) cqc_base: u64,
    pub(super) eqc_base: u64,
    pub(super) mc_base: u64,
    pub(super) dmpt_base: u64,
    pub(super) cmpt_base: u64,
    pub(super) mtt_base: u64,
    pub(super) num_cqs: usize,
    pub(super) num_qps: usize,
    pub(super) num_eqs: usize,
    pub(super) num_mpts: usize,
    pub(super) num_mgms: usize,
    pub(super) num_amgms: usize,
    pub(super) num_srqs: usize,
    pub(super) num_mtts: usize,
    pub(super) max_qp_dest_rdma: usize,
    pub(super) log_mc_entry_sz: u16,
    pub(super) log_mc_hash_sz: u16,
    pub(super) log_num_qps: u8,
    pub(super) log_num_srqs: u8,
    pub(super) log_num_cqs: u8,
    pub(super) log_num_eqs: u8,
    pub(super) log_rd_per_qp: u8,
    pub(super) log_mc_table_sz: u8,
    pub(super) log_mpt_sz: u8,
    pub(super) rdmarc_shift: u8,
}

impl InitHcaParameters {
    /// Initialize the HCA with these parameters.
    pub(super) fn init_hca<H: Hal>(
        &self, cmd: &mut CommandInterface<H>, caps: &Capabilities,
    ) -> Result<Hca, &'static str> {
        const INIT_HCA_VERSION: u8 = 2;
        // check the UD address vector port and enable the counters;
        // bit 1 stays clear to mark a little-endian host
        const INIT_HCA_FLAGS: u32 = (1 << 4) | 1;
        // combined base-address-and-log-count words
        const BASE_MASK: u64 = !0x1f;

        let mut layout = InitHcaLayout::new();
        layout.set_version(INIT_HCA_VERSION);
        layout.set_flags(INIT_HCA_FLAGS);
        layout.set_qpc_base_num(
            self.qpc_base & BASE_MASK | u64::from(self.log_num_qps)
        );
        layout.set_qpc_srqc_base_num(
            self.srqc_base & BASE_MASK | u64::from(self.log_num_srqs)
        );
        layout.set_qpc_cqc_base_num(
            self.cqc_base & BASE_MASK | u64::from(self.log_num_cqs)
        );
        layout.set_qpc_altc_base(self.altc_base);
        layout.set_qpc_auxc_base(self.auxc_base);
        layout.set_qpc_eqc_base_num(
            self.eqc_base & BASE_MASK | u64::from(self.log_num_eqs)
        );
        layout.set_qpc_rdmarc_base_num(
            self.rdmarc_base & !0x7 | u64::from(self.log_rd_per_qp)
        );
        layout.set_mc_base(self.mc_base);
        layout.set_log_mc_entry_sz(self.log_mc_entry_sz as u8);
        layout.set_log_mc_hash_sz(self.log_mc_hash_sz as u8);
        layout.set_log_mc_table_sz(self.log_mc_table_sz);
        layout.set_tpt_dmpt_base(self.dmpt_base);
        layout.set_tpt_log_dmpt_sz(self.log_mpt_sz);
        layout.set_tpt_mtt_base(self.mtt_base);
        layout.set_tpt_cmpt_base(self.cmpt_base);
        layout.set_uar_log_sz(caps.num_uars().ilog2().try_into().unwrap_or(0));
        layout.set_uar_page_sz(DEFAULT_UAR_PAGE_SHIFT - 12);
        cmd.execute_command::<_, _, ()>(Opcode::InitHca, (), &layout.bytes[..], 0)?;
        debug!("HCA initialized");
        Ok(Hca { initialized: true })
    }
}

#[bitfield]
struct InitHcaLayout {
    version: u8,                // 0x000
    #[skip] __: u128,
    #[skip] __: B24,
    flags: u32,                 // 0x014
    #[skip] __: u128,
    #[skip] __: u64,
    qpc_base_num: u64,          // 0x030: base and log count combined
    #[skip] __: u128,
    qpc_srqc_base_num: u64,     // 0x048
    qpc_cqc_base_num: u64,      // 0x050
    #[skip] __: u64,
    qpc_altc_base: u64,         // 0x060
    #[skip] __: u64,
    qpc_auxc_base: u64,         // 0x070
    #[skip] __: u64,
    qpc_eqc_base_num: u64,      // 0x080
    #[skip] __: u16,
    num_sys_eqs: u16,           // 0x08a
    #[skip] __: u32,
    qpc_rdmarc_base_num: u64,   // 0x090
    #[skip] __: u128,
    #[skip] __: u128,
    #[skip] __: u64,
    mc_base: u64,               // 0x0c0
    #[skip] __: u64,
    #[skip] __: u16,
    log_mc_entry_sz: u8,        // 0x0d2
    #[skip] __: B24,
    log_mc_hash_sz: u8,         // 0x0d6
    #[skip] __: u32,
    log_mc_table_sz: u8,        // 0x0db
    #[skip] __: u128,
    #[skip] __: u32,
    tpt_dmpt_base: u64,         // 0x0f0
    #[skip] __: B24,
    tpt_log_dmpt_sz: u8,        // 0x0fb
    #[skip] __: u32,
    tpt_mtt_base: u64,          // 0x100
    tpt_cmpt_base: u64,         // 0x108
    #[skip] __: u128,
    #[skip] __: u64,
    #[skip] __: u16,
    uar_log_sz: u8,             // 0x12a
    uar_page_sz: u8,            // 0x12b
    #[skip] __: u128,
    #[skip] __: u128,
    #[skip] __: u128,
    #[skip] __: u128,
    #[skip] __: u128,
    #[skip] __: u128,
    #[skip] __: u128,
    #[skip] __: u128,
    #[skip] __: u128,
    #[skip] __: u128,
    #[skip] __: u128,
    #[skip] __: u128,
    #[skip] __: u128,
    #[skip] __: u32,            // pad to 0x200
}

/// An initialized HCA.
///
/// Instead of dropping, please close it.
pub(super) struct Hca {
    initialized: bool,
}

impl Hca {
    /// Get the interrupt pin from the adapter.
    pub(super) fn query_adapter<H: Hal>(
        &self, cmd: &mut CommandInterface<H>,
    ) -> Result<Adapter, &'static str> {
        let pages: DmaPages = cmd.execute_command(Opcode::QueryAdapter, (), (), 0)?;
        let adapter = Adapter::from_bytes(pages.as_slice(
            0, size_of::<Adapter>()
        )?.try_into().map_err(|_| "adapter page too short")?);
        trace!("INTA pin: {}", adapter.inta_pin());
        Ok(adapter)
    }

    /// Configure MAD demuxing so that the firmware answers some management
    /// class queries itself.
    pub(super) fn config_mad_demux<H: Hal>(
        &self, cmd: &mut CommandInterface<H>, caps: &Capabilities,
    ) -> Result<(), &'static str> {
        const SUBNET_MANAGEMENT_CLASS: u32 = 0x1;
        if caps.mad_demux() == 0 {
            return Ok(());
        }
        let restrictions: DmaPages = cmd.execute_command(
            Opcode::MadDemux, MadDemuxOpcodeModifier::QueryRestrictions, (),
            SUBNET_MANAGEMENT_CLASS,
        )?;
        cmd.execute_command::<_, _, ()>(
            Opcode::MadDemux, MadDemuxOpcodeModifier::Configure,
            restrictions.as_slice(0, 256)?, SUBNET_MANAGEMENT_CLASS,
        )?;
        trace!("configured MAD demuxing");
        Ok(())
    }

    /// Bring up all ports.
    pub(super) fn init_ports<H: Hal>(
        &self, cmd: &mut CommandInterface<H>, caps: &Capabilities,
    ) -> Result<Vec<Port>, &'static str> {
        let mut ports = Vec::new();
        for number in 1..=caps.num_ports() {
            ports.push(Port::new(cmd, number, ibv_mtu::Mtu4096, None)?);
        }
        Ok(ports)
    }

    /// Close the HCA. Further usage requires initializing it again.
    pub(super) fn close<H: Hal>(
        mut self, cmd: &mut CommandInterface<H>,
    ) -> Result<(), &'static str> {
        cmd.execute_command::<_, _, ()>(Opcode::CloseHca, (), (), 0)?;
        self.initialized = false;
        debug!("HCA closed");
        Ok(())
    }
}

impl Drop for Hca {
    fn drop(&mut self) {
        if self.initialized {
            panic!("please close instead of dropping")
        }
    }
}

#[bitfield]
pub(super) struct Adapter {
    #[skip] __: u128,       // 0x00..0x10
    pub(super) inta_pin: u8, // 0x10
    #[skip] __: B56,        // pad to 0x18
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_page_has_the_right_size() {
        // QUERY_DEV_CAP fills 0x200 bytes
        assert!(size_of::<Capabilities>() <= 0x200);
    }

    #[test]
    fn init_hca_layout_is_wire_sized() {
        assert_eq!(size_of::<InitHcaLayout>(), 0x200);
        let mut layout = InitHcaLayout::new();
        layout.set_version(2);
        layout.set_qpc_base_num(0xabcd_e0 | 17);
        assert_eq!(layout.bytes[0], 2);
        // the combined word sits at 0x030, big endian
        assert_eq!(layout.bytes[0x37], 0xe0 | 17);
    }

    #[test]
    fn blueflame_register_offsets() {
        let bf = BlueFlame { base_page: 8, reg_size: 512, regs_per_page: 8 };
        assert_eq!(bf.register_offset(0), 8 * PAGE_SIZE);
        assert_eq!(bf.register_offset(3), 8 * PAGE_SIZE + 3 * 512);
        assert_eq!(bf.register_offset(8), 9 * PAGE_SIZE);
    }
}
