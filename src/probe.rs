use std::{net::IpAddr, time::Duration};

use crate::{
    command::{CommandRecord, SEND_PROBE},
    error::InputBuildError,
    resolve::{IpVersion, ResolvedHost},
    response::{MplsLabel, ReplyBody},
};

/// Transport a probe is sent over.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum Protocol {
    Icmp,
    Udp,
    Tcp,
    Sctp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Icmp => "icmp",
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Sctp => "sctp",
        }
    }
}

/// Parameters of a single probe. Everything but `target` is optional and
/// left to the daemon's defaults when unset.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ProbeInput {
    /// Hostname or address literal.
    pub target: String,
    /// Restricts resolution of `target` to one address family.
    pub ip_version: Option<IpVersion>,
    pub ttl: Option<u8>,
    pub protocol: Option<Protocol>,
    pub port: Option<u16>,
    /// Source address; sent under the key of the target's family.
    pub local_ip: Option<IpAddr>,
    pub local_port: Option<u16>,
    /// Sent in whole seconds, rounded up.
    pub timeout: Option<Duration>,
    pub size: Option<u32>,
    pub bit_pattern: Option<u8>,
    pub tos: Option<u8>,
    pub mark: Option<u32>,
}

impl ProbeInput {
    fn optional_args(&self) -> Vec<(&'static str, String)> {
        let mut args = Vec::new();
        if let Some(ttl) = self.ttl {
            args.push(("ttl", ttl.to_string()));
        }
        if let Some(protocol) = self.protocol {
            args.push(("protocol", protocol.as_str().to_string()));
        }
        if let Some(port) = self.port {
            args.push(("port", port.to_string()));
        }
        if let Some(local_port) = self.local_port {
            args.push(("local-port", local_port.to_string()));
        }
        if let Some(timeout) = self.timeout {
            let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
            args.push(("timeout", secs.to_string()));
        }
        if let Some(size) = self.size {
            args.push(("size", size.to_string()));
        }
        if let Some(bit_pattern) = self.bit_pattern {
            args.push(("bit-pattern", bit_pattern.to_string()));
        }
        if let Some(tos) = self.tos {
            args.push(("tos", tos.to_string()));
        }
        if let Some(mark) = self.mark {
            args.push(("mark", mark.to_string()));
        }
        args
    }

    /// Features the daemon has to confirm before this probe may be sent.
    pub(crate) fn required_features(&self, target: &ResolvedHost) -> Vec<&'static str> {
        let mut features: Vec<&'static str> =
            self.optional_args().into_iter().map(|(key, _)| key).collect();
        if self.local_ip.is_some() {
            features.push(target.ip_version.local_address_key());
        }
        if let Some(protocol) = self.protocol.filter(|protocol| *protocol != Protocol::Icmp) {
            features.push(protocol.as_str());
        }
        features
    }

    pub(crate) fn to_command(&self, target: &ResolvedHost) -> CommandRecord {
        let mut command = CommandRecord::new(SEND_PROBE)
            .with_arg(target.ip_version.address_key(), target.address);
        if let Some(local_ip) = self.local_ip {
            command = command.with_arg(target.ip_version.local_address_key(), local_ip);
        }
        for (key, value) in self.optional_args() {
            command = command.with_arg(key, value);
        }
        command
    }
}

/// Builder for [`ProbeInput`]; only the target is required.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct ProbeInputBuilder {
    target: Option<String>,
    ip_version: Option<IpVersion>,
    ttl: Option<u8>,
    protocol: Option<Protocol>,
    port: Option<u16>,
    local_ip: Option<IpAddr>,
    local_port: Option<u16>,
    timeout: Option<Duration>,
    size: Option<u32>,
    bit_pattern: Option<u8>,
    tos: Option<u8>,
    mark: Option<u32>,
}

impl ProbeInputBuilder {
    /// Starts with no target and every option left to the daemon's default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the host to probe: an address literal or a name to resolve.
    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Restricts resolution of the target to one address family.
    pub fn with_ip_version(mut self, ip_version: IpVersion) -> Self {
        self.ip_version = Some(ip_version);
        self
    }

    /// Sets the time-to-live of the outgoing packet.
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sends the probe over `protocol` instead of ICMP.
    ///
    /// Anything but ICMP is checked against the daemon's capabilities first.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Destination port, for UDP, TCP and SCTP probes.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Source address, sent under the key of the target's address family.
    pub fn with_local_ip(mut self, local_ip: IpAddr) -> Self {
        self.local_ip = Some(local_ip);
        self
    }

    /// Source port.
    pub fn with_local_port(mut self, local_port: u16) -> Self {
        self.local_port = Some(local_port);
        self
    }

    /// How long the daemon waits for a reply. Rounded up to whole seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Packet size in bytes.
    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    /// Byte used to fill the payload.
    pub fn with_bit_pattern(mut self, bit_pattern: u8) -> Self {
        self.bit_pattern = Some(bit_pattern);
        self
    }

    /// Type-of-service byte.
    pub fn with_tos(mut self, tos: u8) -> Self {
        self.tos = Some(tos);
        self
    }

    /// Socket mark (`SO_MARK`) applied to the packet.
    pub fn with_mark(mut self, mark: u32) -> Self {
        self.mark = Some(mark);
        self
    }

    /// Builds the [`ProbeInput`].
    ///
    /// # Errors
    /// Returns [`InputBuildError::MissingTarget`] if no target was set and
    /// [`InputBuildError::EmptyTarget`] if it is empty.
    pub fn build(&self) -> std::result::Result<ProbeInput, InputBuildError> {
        let target = self.target.clone().ok_or(InputBuildError::MissingTarget)?;
        if target.is_empty() {
            return Err(InputBuildError::EmptyTarget);
        }
        Ok(ProbeInput {
            target,
            ip_version: self.ip_version,
            ttl: self.ttl,
            protocol: self.protocol,
            port: self.port,
            local_ip: self.local_ip,
            local_port: self.local_port,
            timeout: self.timeout,
            size: self.size,
            bit_pattern: self.bit_pattern,
            tos: self.tos,
            mark: self.mark,
        })
    }
}

/// The typed result of one probe.
///
/// `result` is the daemon's reply kind, e.g. `reply`, `no-reply`,
/// `ttl-expired`, or any kind this client does not know about.
#[derive(Clone, PartialEq, Debug)]
pub struct ProbeOutcome {
    pub success: bool,
    pub result: String,
    pub responder: Option<IpAddr>,
    pub time_ms: Option<f64>,
    pub mpls: Vec<MplsLabel>,
}

impl From<ReplyBody> for ProbeOutcome {
    fn from(body: ReplyBody) -> Self {
        let result = body.kind().to_string();
        match body {
            ReplyBody::Reply(reply) | ReplyBody::TtlExpired(reply) => Self {
                success: result == crate::response::REPLY,
                result,
                responder: Some(reply.responder),
                time_ms: reply.round_trip_us.map(|us| us as f64 / 1000.0),
                mpls: reply.mpls,
            },
            _ => Self {
                success: false,
                result,
                responder: None,
                time_ms: None,
                mpls: Vec::new(),
            },
        }
    }
}
