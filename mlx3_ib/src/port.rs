//! Physical port setup and queries.
//!
//! QUERY_PORT reports what the link can do; the PortInfo management
//! datagram reports what it is currently doing. Both feed ibv_port_attr.

use core::{fmt::{self, Debug}, mem::size_of};

use byteorder::BigEndian;
use modular_bitfield_msb::{
    bitfield,
    prelude::{B11, B28, B3, B5, B60, B84},
    specifiers::{B2, B4, B48, B9},
};
use mlx_infiniband::{ibv_mtu, ibv_port_attr, ibv_port_state, PhysicalPortState};
use zerocopy::{AsBytes, FromBytes, U16, U32, U64};

use super::cmd::{
    CommandInterface, MadIfcOpcodeModifier, Opcode, SetPortOpcodeModifier,
};
use super::dma::DmaPages;
use super::hal::Hal;

const LINK_LAYER_INFINIBAND: u8 = 1;

#[derive(Debug)]
pub(super) struct Port {
    number: u8,
    open: bool,
    capabilities: Option<PortCapabilities>,
}

impl Port {
    /// Configure a port and bring it up.
    pub(super) fn new<H: Hal>(
        cmd: &mut CommandInterface<H>, number: u8, mtu: ibv_mtu,
        pkey_table_size: Option<u16>,
    ) -> Result<Self, &'static str> {
        trace!("initializing port {number}...");
        let mut port = Self {
            number, open: false, capabilities: None,
        };
        let port_attr = port.query(cmd)?;

        // echo the capability mask back and request MTU and VL settings
        let mut set_port_input = SetPortCommand::new();
        set_port_input.set_capabilities(port_attr.port_cap_flags);
        if let Some(size) = pkey_table_size {
            set_port_input.set_change_port_pkey(true);
            set_port_input.set_max_pkey(size);
        }
        set_port_input.set_change_port_mtu(true);
        set_port_input.set_change_port_vl(true);
        set_port_input.set_mtu_cap(mtu as u8);
        // try the highest VL count first, then fall back
        for vl_cap_shift in (0..=3).rev() {
            set_port_input.set_vl_cap(1 << vl_cap_shift);
            cmd.execute_command::<_, _, ()>(
                Opcode::SetPort, SetPortOpcodeModifier::Ib,
                &set_port_input.bytes[..], number.into(),
            )?;
        }

        cmd.execute_command::<_, _, ()>(Opcode::InitPort, (), (), number.into())?;
        // the state only moves once the port is up
        port.query(cmd)?;
        trace!("initialized {port:?}");
        port.open = true;
        Ok(port)
    }

    pub(super) fn close<H: Hal>(
        mut self, cmd: &mut CommandInterface<H>,
    ) -> Result<(), &'static str> {
        cmd.execute_command::<_, _, ()>(Opcode::ClosePort, (), (), self.number.into())?;
        self.open = false;
        Ok(())
    }

    /// Query the port capabilities, configuration and current settings.
    pub(super) fn query<H: Hal>(
        &mut self, cmd: &mut CommandInterface<H>,
    ) -> Result<ibv_port_attr, &'static str> {
        // QUERY_PORT gives us the static limits
        let page: DmaPages = cmd.execute_command(
            Opcode::QueryPort, (), (), self.number.into(),
        )?;
        let caps = PortCapabilities::from_bytes(
            page
                .as_slice(0, size_of::<PortCapabilities>())?
                .try_into()
                .unwrap()
        );

        // the PortInfo attribute gives us the live state
        const MGMT_CLASS_SUBN_LID_ROUTED: u8 = 0x1;
        const MGMT_METHOD_GET: u8 = 0x1;
        const SMP_ATTR_PORT_INFO: u16 = 0x15;
        let mut madifc_modifier = MadIfcOpcodeModifier::empty();
        madifc_modifier.insert(MadIfcOpcodeModifier::DISABLE_MKEY_VALIDATION);
        madifc_modifier.insert(MadIfcOpcodeModifier::DISABLE_BKEY_VALIDATION);
        let mut madifc_input = MadPacket::new_zeroed();
        madifc_input.base_version = 1;
        madifc_input.mgmt_class = MGMT_CLASS_SUBN_LID_ROUTED;
        madifc_input.class_version = 1;
        madifc_input.method = MGMT_METHOD_GET;
        madifc_input.attr_id = SMP_ATTR_PORT_INFO.into();
        madifc_input.attr_mod = u32::from(self.number).into();
        let madifc_output: DmaPages = cmd.execute_command(
            Opcode::MadIfc, madifc_modifier, madifc_input.as_bytes(),
            self.number.into(),
        )?;
        let port_info = MadPacketData::from_bytes(
            madifc_output.as_type::<MadPacket>(0)?.data
        );

        let phys_state = PhysicalPortState::from_repr(port_info.phys_state())
            .ok_or("invalid physical port state")?;
        let attr = ibv_port_attr {
            state: ibv_port_state::from_repr(
                port_info.state().into()
            ).ok_or("invalid state")?,
            max_mtu: ibv_mtu::from_repr(
                port_info.max_mtu()
            ).ok_or("invalid max MTU")?,
            active_mtu: ibv_mtu::from_repr(
                port_info.active_mtu()
            ).ok_or("invalid MTU")?,
            gid_tbl_len: 1 << caps.log_max_gids(),
            port_cap_flags: port_info.port_cap_flags(),
            bad_pkey_cntr: port_info.bad_pkey_cntr().into(),
            qkey_viol_cntr: port_info.qkey_viol_cnt().into(),
            pkey_tbl_len: 1 << caps.log_max_pkeys(),
            lid: port_info.lid(),
            sm_lid: port_info.sm_lid(),
            lmc: port_info.lmc(),
            max_vl_num: port_info.max_vl_num(),
            subnet_timeout: port_info.subnet_timeout(),
            init_type_reply: port_info.init_type_reply(),
            active_width: port_info.active_width(),
            active_speed: port_info.active_speed(),
            phys_state: phys_state as u8,
            link_layer: LINK_LAYER_INFINIBAND,
            ..Default::default()
        };
        self.capabilities = Some(caps);
        Ok(attr)
    }

    pub(super) fn number(&self) -> u8 {
        self.number
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        if self.open {
            panic!("please close instead of dropping")
        }
    }
}

#[bitfield]
struct SetPortCommand {
    #[skip] __: B9,
    change_port_mtu: bool,
    change_port_vl: bool,
    change_port_pkey: bool,
    #[skip] __: B4,
    mtu_cap: B4,
    #[skip] __: B4,
    vl_cap: B4,
    #[skip] __: B4,
    capabilities: u32,
    #[skip] __: u64,
    #[skip] __: u64,
    #[skip] __: u64,
    #[skip] __: u32,
    #[skip] __: u32,
    max_pkey: u16,
    // ...
}

#[bitfield]
pub(super) struct PortCapabilities {
    pub(super) link_up: bool,
    #[skip] __: B2,
    default_sense: bool,
    default_type: bool,
    #[skip] __: bool,
    eth: bool,
    pub(super) ib: bool,
    #[skip] __: B4,
    pub(super) ib_mtu: B4,
    eth_mtu: u16,
    ib_link_speed: u8,
    eth_link_speed: u8,
    pub(super) ib_port_width: u8,
    pub(super) log_max_gids: B4,
    pub(super) log_max_pkeys: B4,
    #[skip] __: u16,
    log_max_vlan: B4,
    log_max_mac: B4,
    max_tc_eth: B4,
    pub(super) max_vl_ib: B4,
    #[skip] __: B48,
    mac: B48,
    // ...
}

impl Debug for PortCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f
            .debug_struct("PortCapabilities")
            .field("IB supported", &self.ib())
            .field("Ethernet supported", &self.eth())
            .field("Link", &self.link_up())
            .field("IB MTU", &ibv_mtu::from_repr(self.ib_mtu()))
            .field("IB port width", &self.ib_port_width())
            .finish()
    }
}

pub(super) const SMP_DATA_SIZE: usize = 64;
const SMP_MAX_PATH_HOPS: usize = 64;

/// A subnet management datagram, as passed to MAD_IFC.
#[derive(AsBytes, FromBytes, Clone)]
#[repr(C, packed)]
pub(super) struct MadPacket {
    base_version: u8,
    mgmt_class: u8,
    class_version: u8,
    method: u8,
    status: U16<BigEndian>,
    hop_ptr: u8,
    hop_cnt: u8,
    tid: U64<BigEndian>,
    attr_id: U16<BigEndian>,
    resv: U16<BigEndian>,
    attr_mod: U32<BigEndian>,
    mkey: U64<BigEndian>,
    dr_slid: U16<BigEndian>,
    dr_dlid: U16<BigEndian>,
    _reserved: [u8; 28],
    pub(super) data: [u8; SMP_DATA_SIZE],
    initial_path: [u8; SMP_MAX_PATH_HOPS],
    return_path: [u8; SMP_MAX_PATH_HOPS],
}

/// The PortInfo attribute carried in the MAD data.
#[bitfield]
pub(super) struct MadPacketData {
    #[skip] __: u128,
    pub(super) lid: u16,
    pub(super) sm_lid: u16,
    port_cap_flags: u32,
    #[skip] __: B60,
    pub(super) active_width: B4,
    #[skip] __: B4,
    pub(super) state: B4,
    pub(super) phys_state: B4,
    #[skip] __: B9,
    lmc: B3,
    pub(super) active_speed: B4,
    #[skip] __: B4,
    pub(super) active_mtu: B4,
    #[skip] __: B4,
    pub(super) max_vl_num: B4,
    #[skip] __: B28,
    init_type_reply: B4,
    pub(super) max_mtu: B4,
    #[skip] __: u32,
    bad_pkey_cntr: u16,
    qkey_viol_cnt: u16,
    #[skip] __: B11,
    subnet_timeout: B5,
    #[skip] __: B84,
    ext_active_speed: B4,
    #[skip] __: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mad_packet_is_wire_sized() {
        assert_eq!(size_of::<MadPacket>(), 64 + SMP_DATA_SIZE + 2 * SMP_MAX_PATH_HOPS);
    }

    #[test]
    fn port_info_decodes_an_active_port() {
        let mut data = MadPacketData::new();
        data.set_lid(7);
        data.set_state(ibv_port_state::IBV_PORT_ACTIVE as u8);
        data.set_phys_state(PhysicalPortState::LinkUp as u8);
        data.set_active_mtu(ibv_mtu::Mtu2048 as u8);
        let copy = MadPacketData::from_bytes(data.bytes);
        assert_eq!(copy.lid(), 7);
        assert_eq!(copy.state(), 4);
        assert_eq!(copy.phys_state(), 5);
        assert_eq!(copy.active_mtu(), 4);
    }
}
