//! Vector XL library FFI declarations
//!
//! Struct layouts and constants mirror `vxlapi.h`. Only what the driver
//! uses is declared. All functions use the `system` calling convention.

#![allow(non_snake_case, non_camel_case_types, dead_code)]

use std::os::raw::{c_char, c_void};

pub type XLstatus = i16;
pub type XLportHandle = i32;
pub type XLaccess = u64;
pub type XLhandle = *mut c_void;

pub const XL_INVALID_PORTHANDLE: XLportHandle = -1;

// Status codes
pub const XL_SUCCESS: XLstatus = 0;
pub const XL_ERR_QUEUE_IS_EMPTY: XLstatus = 10;
pub const XL_ERR_QUEUE_IS_FULL: XLstatus = 11;
pub const XL_ERR_TX_NOT_POSSIBLE: XLstatus = 12;
pub const XL_ERR_NO_LICENSE: XLstatus = 14;
pub const XL_ERR_WRONG_PARAMETER: XLstatus = 101;
pub const XL_ERR_HW_NOT_READY: XLstatus = 120;
pub const XL_ERR_HW_NOT_PRESENT: XLstatus = 129;
pub const XL_ERR_CANNOT_OPEN_DRIVER: XLstatus = 201;
pub const XL_ERR_DLL_NOT_FOUND: XLstatus = 203;

pub const XL_CAN_EXT_MSG_ID: u32 = 0x8000_0000;

pub const XL_BUS_TYPE_CAN: u32 = 0x0000_0001;
pub const XL_BUS_COMPATIBLE_CAN: u32 = 0x0001_0000;

pub const XL_INTERFACE_VERSION: u32 = 3;
pub const XL_INTERFACE_VERSION_V4: u32 = 4;

pub const XL_ACTIVATE_RESET_CLOCK: u32 = 8;

pub const XL_OUTPUT_MODE_SILENT: i32 = 0;
pub const XL_OUTPUT_MODE_NORMAL: i32 = 1;

pub const XL_CONFIG_MAX_CHANNELS: usize = 64;
pub const XL_MAX_LENGTH: usize = 31;

pub const RX_QUEUE_SIZE: u32 = 256;

// Classic event tags and message flags
pub const XL_RECEIVE_MSG: u8 = 1;
pub const XL_TRANSMIT_MSG: u8 = 10;

pub const XL_CAN_MSG_FLAG_ERROR_FRAME: u16 = 0x01;
pub const XL_CAN_MSG_FLAG_REMOTE_FRAME: u16 = 0x10;
pub const XL_CAN_MSG_FLAG_TX_COMPLETED: u16 = 0x40;

// Channel capabilities
pub const XL_CHANNEL_FLAG_CANFD_BOSCH_SUPPORT: u32 = 0x2000_0000;
pub const XL_CHANNEL_FLAG_CANFD_ISO_SUPPORT: u32 = 0x8000_0000;

// CAN-FD event tags
pub const XL_CAN_EV_TAG_RX_OK: u16 = 0x0400;
pub const XL_CAN_EV_TAG_TX_OK: u16 = 0x0404;
pub const XL_CAN_EV_TAG_TX_MSG: u16 = 0x0440;

pub const XL_CAN_RXMSG_FLAG_EDL: u32 = 0x0001;
pub const XL_CAN_RXMSG_FLAG_BRS: u32 = 0x0002;
pub const XL_CAN_RXMSG_FLAG_ESI: u32 = 0x0004;
pub const XL_CAN_RXMSG_FLAG_RTR: u32 = 0x0010;
pub const XL_CAN_RXMSG_FLAG_EF: u32 = 0x0200;

pub const XL_CAN_TXMSG_FLAG_EDL: u32 = 0x0001;
pub const XL_CAN_TXMSG_FLAG_BRS: u32 = 0x0002;
pub const XL_CAN_TXMSG_FLAG_RTR: u32 = 0x0010;

// Hardware types
pub const XL_HWTYPE_VIRTUAL: u8 = 1;
pub const XL_HWTYPE_CANCARDX: u8 = 2;
pub const XL_HWTYPE_CANCASEXL: u8 = 21;
pub const XL_HWTYPE_CANBOARDXL: u8 = 25;
pub const XL_HWTYPE_VN7600: u8 = 29;
pub const XL_HWTYPE_VN8900: u8 = 45;
pub const XL_HWTYPE_VN1610: u8 = 55;
pub const XL_HWTYPE_VN1630: u8 = 57;
pub const XL_HWTYPE_VN1640: u8 = 59;
pub const XL_HWTYPE_VN5610: u8 = 65;

// Win32 wait results
pub const WAIT_OBJECT_0: u32 = 0;
pub const WAIT_TIMEOUT: u32 = 0x102;

/// Classic CAN message inside an `XLevent`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct s_xl_can_msg {
    pub id: u32,
    pub flags: u16,
    pub dlc: u16,
    pub res1: u64,
    pub data: [u8; 8],
    pub res2: u64,
}

/// Classic event (48 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct XLevent {
    pub tag: u8,
    pub chanIndex: u8,
    pub transId: u16,
    pub portHandle: u16,
    pub flags: u8,
    pub reserved: u8,
    pub timeStamp: u64,
    pub msg: s_xl_can_msg,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct XLbusParams {
    pub busType: u32,
    pub data: [u8; 28],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct XLchannelConfig {
    pub name: [c_char; XL_MAX_LENGTH + 1],
    pub hwType: u8,
    pub hwIndex: u8,
    pub hwChannel: u8,
    pub transceiverType: u16,
    pub transceiverState: u16,
    pub configError: u16,
    pub channelIndex: u8,
    pub channelMask: XLaccess,
    pub channelCapabilities: u32,
    pub channelBusCapabilities: u32,
    pub isOnBus: u8,
    pub connectedBusType: u32,
    pub busParams: XLbusParams,
    pub _doNotUse: u32,
    pub driverVersion: u32,
    pub interfaceVersion: u32,
    pub raw_data: [u32; 10],
    pub serialNumber: u32,
    pub articleNumber: u32,
    pub transceiverName: [c_char; XL_MAX_LENGTH + 1],
    pub specialCabFlags: u32,
    pub dominantTimeout: u32,
    pub dominantRecessiveDelay: u8,
    pub recessiveDominantDelay: u8,
    pub connectionInfo: u8,
    pub currentlyAvailableTimestamps: u8,
    pub minimalSupplyVoltage: u16,
    pub maximalSupplyVoltage: u16,
    pub maximalBaudrate: u32,
    pub fpgaCoreCapabilities: u8,
    pub specialDeviceStatus: u8,
    pub channelBusActiveCapabilities: u16,
    pub breakOffset: u16,
    pub delimiterOffset: u16,
    pub reserved: [u32; 3],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct XLdriverConfig {
    pub dllVersion: u32,
    pub channelCount: u32,
    pub reserved: [u32; 10],
    pub channel: [XLchannelConfig; XL_CONFIG_MAX_CHANNELS],
}

impl XLdriverConfig {
    /// All-zero configuration for `xlGetDriverConfig` to fill
    pub fn zeroed() -> Box<Self> {
        // SAFETY: every field is a plain integer or integer array; all-zero is valid.
        unsafe { Box::new(std::mem::zeroed()) }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct XLcanFdConf {
    pub arbitrationBitRate: u32,
    pub sjwAbr: u32,
    pub tseg1Abr: u32,
    pub tseg2Abr: u32,
    pub dataBitRate: u32,
    pub sjwDbr: u32,
    pub tseg1Dbr: u32,
    pub tseg2Dbr: u32,
    pub reserved: u8,
    pub options: u8,
    pub reserved1: [u8; 2],
    pub reserved2: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct XL_CAN_EV_RX_MSG {
    pub canId: u32,
    pub msgFlags: u32,
    pub crc: u32,
    pub reserved1: [u8; 12],
    pub totalBitCnt: u16,
    pub dlc: u8,
    pub reserved: [u8; 5],
    pub data: [u8; 64],
}

/// CAN-FD receive event (128 bytes)
#[repr(C)]
#[derive(Clone, Copy)]
pub struct XLcanRxEvent {
    pub size: i32,
    pub tag: u16,
    pub chanIndex: u16,
    pub userHandle: u32,
    pub flagsChip: u16,
    pub reserved0: u16,
    pub reserved1: u64,
    pub timeStampSync: u64,
    pub msg: XL_CAN_EV_RX_MSG,
}

impl Default for XLcanRxEvent {
    fn default() -> Self {
        // SAFETY: plain integer fields; all-zero is valid.
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct XL_CAN_TX_MSG {
    pub canId: u32,
    pub msgFlags: u32,
    pub dlc: u8,
    pub reserved: [u8; 7],
    pub data: [u8; 64],
}

/// CAN-FD transmit event
#[repr(C)]
#[derive(Clone, Copy)]
pub struct XLcanTxEvent {
    pub tag: u16,
    pub transId: u16,
    pub channelIndex: u8,
    pub reserved: [u8; 3],
    pub msg: XL_CAN_TX_MSG,
}

impl Default for XLcanTxEvent {
    fn default() -> Self {
        // SAFETY: plain integer fields; all-zero is valid.
        unsafe { std::mem::zeroed() }
    }
}

pub type XlOpenDriver = unsafe extern "system" fn() -> XLstatus;
pub type XlCloseDriver = unsafe extern "system" fn() -> XLstatus;
pub type XlGetDriverConfig = unsafe extern "system" fn(*mut XLdriverConfig) -> XLstatus;
pub type XlOpenPort = unsafe extern "system" fn(
    *mut XLportHandle,
    *mut c_char,
    XLaccess,
    *mut XLaccess,
    u32,
    u32,
    u32,
) -> XLstatus;
pub type XlClosePort = unsafe extern "system" fn(XLportHandle) -> XLstatus;
pub type XlActivateChannel =
    unsafe extern "system" fn(XLportHandle, XLaccess, u32, u32) -> XLstatus;
pub type XlDeactivateChannel = unsafe extern "system" fn(XLportHandle, XLaccess) -> XLstatus;
pub type XlCanSetChannelBitrate =
    unsafe extern "system" fn(XLportHandle, XLaccess, u32) -> XLstatus;
pub type XlCanSetChannelOutput =
    unsafe extern "system" fn(XLportHandle, XLaccess, i32) -> XLstatus;
pub type XlSetNotification =
    unsafe extern "system" fn(XLportHandle, *mut XLhandle, i32) -> XLstatus;
pub type XlFlushReceiveQueue = unsafe extern "system" fn(XLportHandle) -> XLstatus;
pub type XlCanTransmit =
    unsafe extern "system" fn(XLportHandle, XLaccess, *mut u32, *mut c_void) -> XLstatus;
pub type XlReceive = unsafe extern "system" fn(XLportHandle, *mut u32, *mut XLevent) -> XLstatus;
pub type XlCanFdSetConfiguration =
    unsafe extern "system" fn(XLportHandle, XLaccess, *mut XLcanFdConf) -> XLstatus;
pub type XlCanTransmitEx = unsafe extern "system" fn(
    XLportHandle,
    XLaccess,
    u32,
    *mut u32,
    *mut XLcanTxEvent,
) -> XLstatus;
pub type XlCanReceive = unsafe extern "system" fn(XLportHandle, *mut XLcanRxEvent) -> XLstatus;
pub type XlGetErrorString = unsafe extern "system" fn(XLstatus) -> *const c_char;
pub type WaitForSingleObject = unsafe extern "system" fn(XLhandle, u32) -> u32;

/// Readable name for a status code when the library cannot provide one
pub fn status_name(status: XLstatus) -> String {
    match status {
        XL_SUCCESS => "XL_SUCCESS".to_string(),
        XL_ERR_QUEUE_IS_EMPTY => "QUEUE_EMPTY".to_string(),
        XL_ERR_QUEUE_IS_FULL => "QUEUE_FULL".to_string(),
        XL_ERR_TX_NOT_POSSIBLE => "TX_NOT_POSSIBLE".to_string(),
        XL_ERR_NO_LICENSE => "NO_LICENSE".to_string(),
        XL_ERR_WRONG_PARAMETER => "WRONG_PARAMETER".to_string(),
        XL_ERR_HW_NOT_READY => "HW_NOT_READY".to_string(),
        XL_ERR_CANNOT_OPEN_DRIVER => "CANNOT_OPEN_DRIVER".to_string(),
        XL_ERR_HW_NOT_PRESENT => "HW_NOT_PRESENT".to_string(),
        XL_ERR_DLL_NOT_FOUND => "DLL_NOT_FOUND".to_string(),
        other => format!("XL_ERR_{}", other),
    }
}

/// Product name for a hardware type code
pub fn hw_type_name(hw_type: u8) -> String {
    match hw_type {
        XL_HWTYPE_VIRTUAL => "Virtual".to_string(),
        XL_HWTYPE_CANCARDX => "CANcardX".to_string(),
        XL_HWTYPE_CANCASEXL => "CANcaseXL".to_string(),
        XL_HWTYPE_CANBOARDXL => "CANboardXL".to_string(),
        XL_HWTYPE_VN1610 => "VN1610".to_string(),
        XL_HWTYPE_VN1630 => "VN1630".to_string(),
        XL_HWTYPE_VN1640 => "VN1640".to_string(),
        XL_HWTYPE_VN8900 => "VN8900".to_string(),
        XL_HWTYPE_VN7600 => "VN7600".to_string(),
        XL_HWTYPE_VN5610 => "VN5610".to_string(),
        other => format!("HW_0x{:02x}", other),
    }
}

/// Convert a fixed-size C string field to a Rust string (Latin-1)
pub fn c_chars_to_string(chars: &[c_char]) -> String {
    chars
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8 as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_struct_sizes_match_header() {
        assert_eq!(size_of::<s_xl_can_msg>(), 32);
        assert_eq!(size_of::<XLevent>(), 48);
        assert_eq!(size_of::<XLcanRxEvent>(), 128);
        assert_eq!(size_of::<XLchannelConfig>(), 227);
    }

    #[test]
    fn test_names() {
        assert_eq!(status_name(XL_ERR_HW_NOT_PRESENT), "HW_NOT_PRESENT");
        assert_eq!(status_name(77), "XL_ERR_77");
        assert_eq!(hw_type_name(XL_HWTYPE_VN1630), "VN1630");
        assert_eq!(hw_type_name(0x7f), "HW_0x7f");
    }

    #[test]
    fn test_c_chars() {
        let raw: [c_char; 8] = [b'V' as c_char, b'N' as c_char, 0, b'x' as c_char, 0, 0, 0, 0];
        assert_eq!(c_chars_to_string(&raw), "VN");
    }
}
