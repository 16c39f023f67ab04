//! HCI event parsing for LE advertising
//!
//! Legacy, extended and periodic advertising reports are decoded into the
//! fragment types consumed by the advertising reassembler. Legacy reports
//! are mapped onto their extended event-type encoding so that only one
//! reassembly path exists.

use crate::adv::constants::SID_NOT_PRESENT;
use crate::adv::{
    AdvReportFragment, DataStatus, ExtendedEventType, PeriodicReportFragment,
};
use crate::codec::{CodecError, CodecResult, PduReader};
use crate::gap::{AddressType, AddressWithType, BdAddr};
use crate::hci::constants::*;

/// HCI Event packet
#[derive(Debug, Clone)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameter_total_length: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    /// Parse an HCI event from raw bytes (without the packet indicator)
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }

        let event_code = data[0];
        let parameter_total_length = data[1];

        if data.len() < (parameter_total_length as usize + 2) {
            return None;
        }

        let parameters = data[2..(parameter_total_length as usize + 2)].to_vec();

        Some(HciEvent {
            event_code,
            parameter_total_length,
            parameters,
        })
    }

    /// Decode the LE meta sub-event carried by this event, if any
    pub fn le_meta(&self) -> CodecResult<Option<LeMetaEvent>> {
        if self.event_code != EVT_LE_META_EVENT {
            return Ok(None);
        }
        LeMetaEvent::parse(&self.parameters).map(Some)
    }
}

/// LE meta sub-events relevant to advertising
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeMetaEvent {
    /// Legacy reports, already mapped onto extended event types
    AdvertisingReports(Vec<AdvReportFragment>),
    ExtendedAdvertisingReports(Vec<AdvReportFragment>),
    PeriodicAdvertisingReport(PeriodicReportFragment),
    PeriodicSyncLost { sync_handle: u16 },
    /// Any other sub-event
    Other(u8),
}

impl LeMetaEvent {
    /// Parse the parameters of an LE meta event
    pub fn parse(parameters: &[u8]) -> CodecResult<Self> {
        let mut reader = PduReader::new(parameters);
        let subevent = reader.read_u8()?;

        match subevent {
            EVT_LE_ADVERTISING_REPORT => {
                let count = reader.read_u8()?;
                let mut reports = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    reports.push(parse_legacy_report(&mut reader)?);
                }
                Ok(LeMetaEvent::AdvertisingReports(reports))
            }
            EVT_LE_EXTENDED_ADVERTISING_REPORT => {
                let count = reader.read_u8()?;
                let mut reports = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    reports.push(parse_extended_report(&mut reader)?);
                }
                Ok(LeMetaEvent::ExtendedAdvertisingReports(reports))
            }
            EVT_LE_PERIODIC_ADVERTISING_REPORT => {
                let sync_handle = reader.read_u16()?;
                let tx_power = reader.read_u8()? as i8;
                let rssi = reader.read_u8()? as i8;
                let cte_type = reader.read_u8()?;
                let data_status = DataStatus::from_u8(reader.read_u8()?);
                let data_len = reader.read_u8()? as usize;
                let data = reader.read_slice(data_len)?.to_vec();
                Ok(LeMetaEvent::PeriodicAdvertisingReport(PeriodicReportFragment {
                    sync_handle,
                    tx_power,
                    rssi,
                    cte_type,
                    data_status,
                    data,
                }))
            }
            EVT_LE_PERIODIC_ADVERTISING_SYNC_LOST => Ok(LeMetaEvent::PeriodicSyncLost {
                sync_handle: reader.read_u16()?,
            }),
            other => Ok(LeMetaEvent::Other(other)),
        }
    }
}

fn parse_legacy_report(reader: &mut PduReader<'_>) -> CodecResult<AdvReportFragment> {
    let pdu_type = reader.read_u8()?;
    let event_type = ExtendedEventType::from_legacy(pdu_type).ok_or(CodecError::InvalidValue {
        field: "legacy advertising event type",
        value: pdu_type,
    })?;
    let address_type = AddressType::from(reader.read_u8()?);
    let address = BdAddr::new(reader.read_array::<6>()?);
    let data_len = reader.read_u8()? as usize;
    let data = reader.read_slice(data_len)?.to_vec();
    let rssi = reader.read_u8()? as i8;

    Ok(AdvReportFragment {
        event_type,
        data_status: DataStatus::Complete,
        address: AddressWithType::new(address, address_type),
        primary_phy: LE_PHY_1M,
        secondary_phy: LE_PHY_NONE,
        sid: SID_NOT_PRESENT,
        tx_power: TX_POWER_NOT_AVAILABLE,
        rssi,
        periodic_adv_interval: 0,
        direct_address: None,
        data,
    })
}

fn parse_extended_report(reader: &mut PduReader<'_>) -> CodecResult<AdvReportFragment> {
    let (event_type, data_status) = ExtendedEventType::from_raw(reader.read_u16()?);
    let address_type = AddressType::from(reader.read_u8()?);
    let address = BdAddr::new(reader.read_array::<6>()?);
    let primary_phy = reader.read_u8()?;
    let secondary_phy = reader.read_u8()?;
    let sid = reader.read_u8()?;
    let tx_power = reader.read_u8()? as i8;
    let rssi = reader.read_u8()? as i8;
    let periodic_adv_interval = reader.read_u16()?;
    let direct_type = AddressType::from(reader.read_u8()?);
    let direct = BdAddr::new(reader.read_array::<6>()?);
    let data_len = reader.read_u8()? as usize;
    let data = reader.read_slice(data_len)?.to_vec();

    let direct_address = if event_type.contains(ExtendedEventType::DIRECTED) {
        Some(AddressWithType::new(direct, direct_type))
    } else {
        None
    };

    Ok(AdvReportFragment {
        event_type,
        data_status,
        address: AddressWithType::new(address, address_type),
        primary_phy,
        secondary_phy,
        sid,
        tx_power,
        rssi,
        periodic_adv_interval,
        direct_address,
        data,
    })
}
