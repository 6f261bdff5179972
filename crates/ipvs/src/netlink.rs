//! Netlink communication layer for IPVS.
//!
//! This module provides low-level netlink socket operations for communicating
//! with the kernel IPVS module via generic netlink.

use common::{Error, Result};
use netlink_packet_core::{
    NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST, NetlinkDeserializable, NetlinkMessage, NetlinkPayload,
    NetlinkSerializable,
};
use netlink_packet_generic::{
    GenlMessage,
    ctrl::{GenlCtrl, GenlCtrlCmd, nlas::GenlCtrlAttrs},
};
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_GENERIC};
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tracing::{debug, trace};

use crate::messages::{IPVS_GENL_NAME, IPVSMessage};

/// Receive buffer size; large enough for a full dump datagram.
const RECV_BUF_SIZE: usize = 64 * 1024;

/// Default time to wait for a kernel reply.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Netlink socket wrapper for IPVS operations.
pub struct NetlinkSocket {
    socket: Socket,
    family_id: u16,
    sequence: u32,
    recv_buf: Vec<u8>,
}

impl NetlinkSocket {
    /// Create a new netlink socket and resolve the IPVS family ID.
    pub fn new(timeout: Duration) -> Result<Self> {
        debug!("Creating netlink socket for IPVS");

        let mut socket = Socket::new(NETLINK_GENERIC)
            .map_err(|e| Error::netlink(format!("Failed to create netlink socket: {}", e)))?;

        socket
            .bind(&SocketAddr::new(0, 0))
            .map_err(|e| Error::netlink(format!("Failed to bind netlink socket: {}", e)))?;

        socket
            .connect(&SocketAddr::new(0, 0))
            .map_err(|e| Error::netlink(format!("Failed to connect netlink socket: {}", e)))?;

        set_recv_timeout(&socket, timeout)?;

        let mut nl_socket = Self {
            socket,
            family_id: 0,
            sequence: 0,
            recv_buf: Vec::with_capacity(RECV_BUF_SIZE),
        };

        nl_socket.family_id = nl_socket.resolve_family_id(IPVS_GENL_NAME)?;
        debug!("IPVS family ID: {}", nl_socket.family_id);

        Ok(nl_socket)
    }

    /// Get the IPVS family ID.
    pub fn family_id(&self) -> u16 {
        self.family_id
    }

    fn next_sequence(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    /// Resolve a generic netlink family name to its ID.
    fn resolve_family_id(&mut self, family_name: &str) -> Result<u16> {
        debug!("Resolving generic netlink family: {}", family_name);

        let mut genlmsg: GenlMessage<GenlCtrl> = GenlMessage::from_payload(GenlCtrl {
            cmd: GenlCtrlCmd::GetFamily,
            nlas: vec![GenlCtrlAttrs::FamilyName(family_name.to_string())],
        });
        genlmsg.set_resolved_family_id(libc::GENL_ID_CTRL as u16);
        genlmsg.finalize();

        let replies = self.transact("GetFamily", NetlinkMessage::from(genlmsg), false)?;
        replies
            .iter()
            .flat_map(|reply| reply.payload.nlas.iter())
            .find_map(|nla| match nla {
                GenlCtrlAttrs::FamilyId(id) => Some(*id),
                _ => None,
            })
            .ok_or_else(|| {
                Error::netlink(format!(
                    "Family ID not found in response for {} (is ip_vs loaded?)",
                    family_name
                ))
            })
    }

    /// Send an IPVS command and wait for the kernel's acknowledgement.
    pub fn execute(&mut self, message: IPVSMessage) -> Result<Vec<IPVSMessage>> {
        self.send_ipvs(message, false)
    }

    /// Send an IPVS dump request and collect every reply.
    pub fn dump(&mut self, message: IPVSMessage) -> Result<Vec<IPVSMessage>> {
        self.send_ipvs(message, true)
    }

    fn send_ipvs(&mut self, message: IPVSMessage, dump: bool) -> Result<Vec<IPVSMessage>> {
        let op = format!("{:?}", message.cmd);
        let mut genlmsg: GenlMessage<IPVSMessage> = GenlMessage::from_payload(message);
        genlmsg.set_resolved_family_id(self.family_id);
        genlmsg.finalize();

        let replies = self.transact(&op, NetlinkMessage::from(genlmsg), dump)?;
        Ok(replies.into_iter().map(|genl| genl.payload).collect())
    }

    /// Send one request and read until it is acknowledged, failed, or (for
    /// dumps) terminated with `NLMSG_DONE`.
    fn transact<T>(&mut self, op: &str, mut nlmsg: NetlinkMessage<T>, dump: bool) -> Result<Vec<T>>
    where
        T: NetlinkSerializable + NetlinkDeserializable + std::fmt::Debug,
    {
        let sequence = self.next_sequence();
        nlmsg.header.flags = if dump {
            NLM_F_REQUEST | NLM_F_DUMP
        } else {
            NLM_F_REQUEST | NLM_F_ACK
        };
        nlmsg.header.sequence_number = sequence;
        nlmsg.finalize();

        self.send_message(&nlmsg)?;

        let mut replies = Vec::new();
        loop {
            self.recv_buf.clear();
            let len = self
                .socket
                .recv(&mut self.recv_buf, 0)
                .map_err(|e| Error::netlink(format!("{}: failed to receive reply: {}", op, e)))?;

            let mut offset = 0;
            while offset < len {
                let message = NetlinkMessage::<T>::deserialize(&self.recv_buf[offset..len])
                    .map_err(|e| Error::netlink(format!("{}: malformed reply: {}", op, e)))?;
                let msg_len = message.header.length as usize;
                if msg_len == 0 {
                    return Err(Error::netlink(format!("{}: zero-length reply", op)));
                }
                offset += (msg_len + 3) & !3;

                if message.header.sequence_number != sequence {
                    trace!(
                        "Dropping stale reply seq {} (want {})",
                        message.header.sequence_number, sequence
                    );
                    continue;
                }

                trace!("Received netlink message: {:?}", message);

                match message.payload {
                    NetlinkPayload::InnerMessage(inner) => replies.push(inner),
                    NetlinkPayload::Done(_) => return Ok(replies),
                    NetlinkPayload::Error(err) => match err.code {
                        None => return Ok(replies),
                        Some(code) => return Err(Error::kernel(op, code.get())),
                    },
                    _ if dump => {}
                    _ => return Ok(replies),
                }
            }
        }
    }

    fn send_message<T>(&mut self, message: &NetlinkMessage<T>) -> Result<()>
    where
        T: NetlinkSerializable + std::fmt::Debug,
    {
        let mut buf = vec![0u8; message.buffer_len()];
        message.serialize(&mut buf[..]);

        trace!("Sending netlink message: {:?}", message);

        self.socket
            .send(&buf[..], 0)
            .map_err(|e| Error::netlink(format!("Failed to send netlink message: {}", e)))?;

        Ok(())
    }
}

fn set_recv_timeout(socket: &Socket, timeout: Duration) -> Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    // SAFETY: the fd is owned by `socket` and `tv` outlives the call.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}
