//! IPVS netlink commands and attribute numbers.
//!
//! Values mirror the kernel's include/uapi/linux/ip_vs.h.

/// IPVS generic netlink commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IPVSCommand {
    NewService = 1,
    SetService = 2,
    DelService = 3,
    GetService = 4,
    NewDest = 5,
    SetDest = 6,
    DelDest = 7,
    GetDest = 8,
    /// Only used as the command of a `GetInfo` reply.
    SetInfo = 14,
    GetInfo = 15,
    Flush = 17,
}

impl IPVSCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        Some(match cmd {
            1 => IPVSCommand::NewService,
            2 => IPVSCommand::SetService,
            3 => IPVSCommand::DelService,
            4 => IPVSCommand::GetService,
            5 => IPVSCommand::NewDest,
            6 => IPVSCommand::SetDest,
            7 => IPVSCommand::DelDest,
            8 => IPVSCommand::GetDest,
            14 => IPVSCommand::SetInfo,
            15 => IPVSCommand::GetInfo,
            17 => IPVSCommand::Flush,
            _ => return None,
        })
    }
}

impl From<IPVSCommand> for u8 {
    fn from(cmd: IPVSCommand) -> u8 {
        cmd as u8
    }
}

/// Top-level command attributes (`IPVS_CMD_ATTR_*`).
pub const CMD_ATTR_SERVICE: u16 = 1;
pub const CMD_ATTR_DEST: u16 = 2;

/// Service attributes nested under `IPVS_CMD_ATTR_SERVICE`.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IPVSServiceAttr {
    AddressFamily = 1,
    Protocol = 2,
    Address = 3,
    Port = 4,
    FirewallMark = 5,
    Scheduler = 6,
    Flags = 7,
    Timeout = 8,
    Netmask = 9,
}

/// Destination attributes nested under `IPVS_CMD_ATTR_DEST`.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IPVSDestAttr {
    Address = 1,
    Port = 2,
    ForwardingMethod = 3,
    Weight = 4,
    UpperThreshold = 5,
    LowerThreshold = 6,
    AddressFamily = 11,
}

/// Info attributes, top level in a `GetInfo` reply.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IPVSInfoAttr {
    Version = 1,
    ConnTableSize = 2,
}
