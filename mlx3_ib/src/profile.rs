//! The firmware profile: how much ICM each resource type gets.

use strum::EnumCount;
use strum_macros::{Display, EnumCount, FromRepr};

use super::dma::PAGE_SIZE;
use super::fw::{Capabilities, InitHcaParameters};

#[repr(usize)]
#[derive(Default, Display, EnumCount, FromRepr, Clone, Copy, Debug, PartialEq, Eq)]
enum ResourceType {
    #[default] QP, RDMARC, ALTC, AUXC, SRQ, CQ, EQ, DMPT, CMPT, MTT, MCG,
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct Resource {
    size: u64,
    start: u64,
    typ: ResourceType,
    num: u64,
}

impl Resource {
    fn lognum(&self) -> u32 {
        self.num.ilog2()
    }
}

const DEFAULT_NUM_QP: u64 = 1 << 17;
const DEFAULT_NUM_SRQ: u64 = 1 << 16;
const DEFAULT_RDMARC_PER_QP: u64 = 1 << 4;
const DEFAULT_NUM_CQ: u64 = 1 << 16;
const DEFAULT_NUM_MCG: u64 = 1 << 13;
const DEFAULT_NUM_MPT: u64 = 1 << 19;
const DEFAULT_NUM_MTT: u64 = 1 << 20;
const MAX_NUM_EQS: u64 = 1 << 9;

#[repr(usize)]
#[derive(EnumCount)]
enum CmptType {
    QP, SRQ, CQ, EQ,
}

/// The computed firmware profile.
pub(super) struct Profile {
    pub(super) init_hca: InitHcaParameters,
    /// the ICM size in bytes
    pub(super) total_size: u64,
}

impl Profile {
    pub(super) fn new(caps: &Capabilities) -> Result<Self, &'static str> {
        let (profiles, total_size) = compute_layout(caps)?;
        let mut init_hca = InitHcaParameters::default();
        init_hca.rdmarc_shift = 0;
        for profile in profiles.iter() {
            match profile.typ {
                ResourceType::CMPT => init_hca.cmpt_base = profile.start,
                ResourceType::CQ => {
                    init_hca.num_cqs = profile.num.try_into().unwrap();
                    init_hca.cqc_base = profile.start;
                    init_hca.log_num_cqs = profile.lognum().try_into().unwrap();
                },
                ResourceType::SRQ => {
                    init_hca.num_srqs = profile.num.try_into().unwrap();
                    init_hca.srqc_base = profile.start;
                    init_hca.log_num_srqs = profile.lognum().try_into().unwrap();
                },
                ResourceType::QP => {
                    init_hca.num_qps = profile.num.try_into().unwrap();
                    init_hca.qpc_base = profile.start;
                    init_hca.log_num_qps = profile.lognum().try_into().unwrap();
                },
                ResourceType::ALTC => init_hca.altc_base = profile.start,
                ResourceType::AUXC => init_hca.auxc_base = profile.start,
                ResourceType::MTT => {
                    init_hca.num_mtts = profile.num.try_into().unwrap();
                    init_hca.mtt_base = profile.start;
                },
                ResourceType::EQ => {
                    init_hca.num_eqs = MAX_NUM_EQS.try_into().unwrap();
                    init_hca.eqc_base = profile.start;
                    init_hca.log_num_eqs = init_hca.num_eqs.ilog2().try_into().unwrap();
                },
                ResourceType::RDMARC => {
                    while DEFAULT_NUM_QP << init_hca.rdmarc_shift < profile.num {
                        init_hca.max_qp_dest_rdma = 1 << init_hca.rdmarc_shift;
                        init_hca.rdmarc_base = profile.start;
                        init_hca.log_rd_per_qp = init_hca.rdmarc_shift;
                        init_hca.rdmarc_shift += 1;
                    }
                },
                ResourceType::DMPT => {
                    init_hca.num_mpts = profile.num.try_into().unwrap();
                    init_hca.dmpt_base = profile.start;
                    init_hca.log_mpt_sz = profile.lognum().try_into().unwrap();
                },
                ResourceType::MCG => {
                    init_hca.mc_base = profile.start;
                    init_hca.log_mc_entry_sz = super::mcg::get_mgm_entry_size()
                        .ilog2().try_into().unwrap();
                    init_hca.log_mc_table_sz = profile.lognum().try_into().unwrap();
                    init_hca.log_mc_hash_sz = (profile.lognum() - 1).try_into().unwrap();
                    init_hca.num_mgms = (profile.num >> 1).try_into().unwrap();
                    init_hca.num_amgms = (profile.num >> 1).try_into().unwrap();
                },
            }
        }
        trace!(
            "reserving {} GiB of ICM (card limit {} GiB), {} pages",
            total_size >> 30, caps.max_icm_sz() >> 30, total_size >> 12,
        );
        Ok(Self { init_hca, total_size })
    }
}

/// Compute where each resource lives in the ICM.
///
/// Each count is rounded up to a power of two and each region occupies at
/// least one page. Sorting the regions in decreasing order of size keeps
/// every region aligned to its own size while packing them without gaps.
fn compute_layout(
    caps: &Capabilities,
) -> Result<([Resource; ResourceType::COUNT], u64), &'static str> {
    let mut total_size = 0;
    let log_mtt_per_seg = 3;

    // this temporarily produces invalid values until the loop below
    let mut profiles: [Resource; ResourceType::COUNT] = Default::default();

    profiles[ResourceType::QP as usize].size = caps.qpc_entry_sz().into();
    profiles[ResourceType::RDMARC as usize].size = caps.rdmarc_entry_sz().into();
    profiles[ResourceType::ALTC as usize].size = caps.altc_entry_sz().into();
    profiles[ResourceType::AUXC as usize].size = caps.aux_entry_sz().into();
    profiles[ResourceType::SRQ as usize].size = caps.srq_entry_sz().into();
    profiles[ResourceType::CQ as usize].size = caps.cqc_entry_sz().into();
    profiles[ResourceType::EQ as usize].size = caps.eqc_entry_sz().into();
    profiles[ResourceType::DMPT as usize].size = caps.d_mpt_entry_sz().into();
    profiles[ResourceType::CMPT as usize].size = caps.c_mpt_entry_sz().into();
    profiles[ResourceType::MTT as usize].size = caps.mtt_entry_sz().into();
    profiles[ResourceType::MCG as usize].size = super::mcg::get_mgm_entry_size();

    profiles[ResourceType::QP as usize].num = DEFAULT_NUM_QP;
    profiles[ResourceType::RDMARC as usize].num = DEFAULT_NUM_QP * DEFAULT_RDMARC_PER_QP;
    profiles[ResourceType::ALTC as usize].num = DEFAULT_NUM_QP;
    profiles[ResourceType::AUXC as usize].num = DEFAULT_NUM_QP;
    profiles[ResourceType::SRQ as usize].num = DEFAULT_NUM_SRQ;
    profiles[ResourceType::CQ as usize].num = DEFAULT_NUM_CQ;
    profiles[ResourceType::EQ as usize].num = MAX_NUM_EQS;
    profiles[ResourceType::DMPT as usize].num = DEFAULT_NUM_MPT;
    profiles[ResourceType::CMPT as usize].num = (CmptType::COUNT << 24).try_into().unwrap();
    profiles[ResourceType::MTT as usize].num = DEFAULT_NUM_MTT * (1 << log_mtt_per_seg);
    profiles[ResourceType::MCG as usize].num = DEFAULT_NUM_MCG;

    for (idx, profile) in profiles.iter_mut().enumerate() {
        profile.typ = ResourceType::from_repr(idx).unwrap();
        profile.num = profile.num.checked_next_power_of_two().unwrap();
        profile.size *= profile.num;
        if profile.size < PAGE_SIZE.try_into().unwrap() {
            profile.size = PAGE_SIZE.try_into().unwrap();
        }
    }

    profiles.sort_unstable_by_key(|p| p.size);
    profiles.reverse();

    for (idx, profile) in profiles.iter_mut().enumerate() {
        profile.start = total_size;
        total_size += profile.size;
        if total_size > caps.max_icm_sz() {
            return Err("total size > maximum ICM size");
        }
        if profile.size > 0 {
            trace!(
                "icm[{idx:02}] {:>6}: 2^{} entries at {:#x}, {} KiB",
                profile.typ, profile.lognum(), profile.start, profile.size >> 10,
            );
        }
    }
    Ok((profiles, total_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_caps() -> Capabilities {
        let mut caps = Capabilities::new();
        caps.set_log2_rsvd_qps(2);
        caps.set_qpc_entry_sz(256);
        caps.set_rdmarc_entry_sz(128);
        caps.set_altc_entry_sz(64);
        caps.set_aux_entry_sz(128);
        caps.set_srq_entry_sz(128);
        caps.set_cqc_entry_sz(128);
        caps.set_eqc_entry_sz(64);
        caps.set_d_mpt_entry_sz(64);
        caps.set_c_mpt_entry_sz(64);
        caps.set_mtt_entry_sz(8);
        caps.set_max_icm_sz(1 << 44);
        caps
    }

    #[test]
    fn layout_is_aligned_and_contiguous() {
        let caps = test_caps();
        let (profiles, total_size) = compute_layout(&caps).unwrap();
        let mut expected_start = 0;
        let mut previous_size = u64::MAX;
        for profile in profiles.iter() {
            assert_eq!(profile.start % profile.size, 0);
            assert_eq!(profile.start, expected_start);
            assert!(profile.size <= previous_size);
            expected_start += profile.size;
            previous_size = profile.size;
        }
        assert_eq!(expected_start, total_size);
        assert!(total_size <= caps.max_icm_sz());
    }

    #[test]
    fn counts_are_rounded_to_powers_of_two() {
        let (profiles, _) = compute_layout(&test_caps()).unwrap();
        for profile in profiles.iter() {
            assert!(profile.num.is_power_of_two());
        }
    }

    #[test]
    fn qp_region_covers_the_default_count() {
        let mut caps = test_caps();
        caps.set_qpc_entry_sz(64);
        let (profiles, total_size) = compute_layout(&caps).unwrap();
        let qp = profiles.iter().find(|p| p.typ == ResourceType::QP).unwrap();
        assert_eq!(qp.size, 64 * DEFAULT_NUM_QP.next_power_of_two());
        assert!(total_size <= caps.max_icm_sz());
    }

    #[test]
    fn oversized_layout_is_rejected() {
        let mut caps = test_caps();
        caps.set_max_icm_sz(1 << 20);
        assert!(compute_layout(&caps).is_err());
    }

    #[test]
    fn profile_fills_init_hca() {
        let profile = Profile::new(&test_caps()).unwrap();
        assert_eq!(profile.init_hca.log_num_qps, 17);
        assert_eq!(profile.init_hca.num_eqs, 512);
        assert_eq!(
            profile.init_hca.num_mgms + profile.init_hca.num_amgms,
            1 << 13,
        );
    }
}
