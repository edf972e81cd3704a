use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::command::Token;
use crate::error::ProtocolError;

pub const REPLY: &str = "reply";
pub const NO_REPLY: &str = "no-reply";
pub const TTL_EXPIRED: &str = "ttl-expired";
pub const FEATURE_SUPPORT: &str = "feature-support";
pub const DNS_REPLY: &str = "dns-reply";

/// One entry of an MPLS label stack reported by an intermediate hop.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct MplsLabel {
    pub label: u32,
    pub traffic_class: u8,
    pub bottom_of_stack: bool,
    pub ttl: u8,
}

/// Fields carried by `reply` and `ttl-expired`.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ProbeReply {
    pub responder: IpAddr,
    pub round_trip_us: Option<u64>,
    pub mpls: Vec<MplsLabel>,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ReplyBody {
    Reply(ProbeReply),
    NoReply,
    TtlExpired(ProbeReply),
    FeatureSupport { supported: bool },
    DnsReply { address: IpAddr },
    /// A reply kind this client does not know, kept verbatim.
    Other { kind: String, raw: String },
}

impl ReplyBody {
    pub fn kind(&self) -> &str {
        match self {
            ReplyBody::Reply(_) => REPLY,
            ReplyBody::NoReply => NO_REPLY,
            ReplyBody::TtlExpired(_) => TTL_EXPIRED,
            ReplyBody::FeatureSupport { .. } => FEATURE_SUPPORT,
            ReplyBody::DnsReply { .. } => DNS_REPLY,
            ReplyBody::Other { kind, .. } => kind,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ReplyRecord {
    pub token: Token,
    pub body: ReplyBody,
}

/// Decodes one reply line (trailing newline optional).
pub fn decode(line: &str) -> Result<ReplyRecord, ProtocolError> {
    let mut atoms = line.split_whitespace();
    let token = atoms
        .next()
        .ok_or_else(|| ProtocolError::new(None, line, "empty line"))?;
    let token = token
        .parse::<Token>()
        .map_err(|_| ProtocolError::new(None, line, format!("invalid token `{}`", token)))?;
    let malformed = |reason: String| ProtocolError::new(Some(token), line, reason);

    let kind = atoms
        .next()
        .ok_or_else(|| malformed("missing reply kind".into()))?;
    let rest: Vec<&str> = atoms.collect();

    let body = match kind {
        REPLY => {
            let reply = parse_probe_reply(&rest).map_err(malformed)?;
            if reply.round_trip_us.is_none() {
                return Err(malformed("reply without round-trip-time".into()));
            }
            ReplyBody::Reply(reply)
        }
        NO_REPLY => {
            pairs(&rest).map_err(malformed)?;
            ReplyBody::NoReply
        }
        TTL_EXPIRED => ReplyBody::TtlExpired(parse_probe_reply(&rest).map_err(malformed)?),
        FEATURE_SUPPORT => {
            let fields = pairs(&rest).map_err(malformed)?;
            // Anything but `ok` means unsupported, e.g. the version string
            // answered for `check-support feature version`.
            let supported = match lookup(&fields, "support") {
                Some(value) => value == "ok",
                None => return Err(malformed("feature-support without support".into())),
            };
            ReplyBody::FeatureSupport { supported }
        }
        DNS_REPLY => {
            let fields = pairs(&rest).map_err(malformed)?;
            let address = parse_address(&fields)
                .map_err(malformed)?
                .ok_or_else(|| malformed("dns-reply without address".into()))?;
            ReplyBody::DnsReply { address }
        }
        other => ReplyBody::Other {
            kind: other.into(),
            raw: rest.join(" "),
        },
    };
    Ok(ReplyRecord { token, body })
}

fn pairs<'a>(atoms: &[&'a str]) -> Result<Vec<(&'a str, &'a str)>, String> {
    if atoms.len() % 2 != 0 {
        return Err(format!("odd number of fields ({})", atoms.len()));
    }
    Ok(atoms.chunks(2).map(|pair| (pair[0], pair[1])).collect())
}

fn lookup<'a>(fields: &[(&'a str, &'a str)], key: &str) -> Option<&'a str> {
    fields.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid {} `{}`", key, value))
}

fn parse_address(fields: &[(&str, &str)]) -> Result<Option<IpAddr>, String> {
    if let Some(addr) = lookup(fields, "ip-4") {
        return Ok(Some(IpAddr::V4(parse_number::<Ipv4Addr>("ip-4", addr)?)));
    }
    if let Some(addr) = lookup(fields, "ip-6") {
        return Ok(Some(IpAddr::V6(parse_number::<Ipv6Addr>("ip-6", addr)?)));
    }
    Ok(None)
}

fn parse_probe_reply(atoms: &[&str]) -> Result<ProbeReply, String> {
    let fields = pairs(atoms)?;
    let responder = parse_address(&fields)?.ok_or("missing responder address")?;
    let round_trip_us = lookup(&fields, "round-trip-time")
        .map(|value| parse_number("round-trip-time", value))
        .transpose()?;
    let mpls = lookup(&fields, "mpls")
        .map(parse_mpls)
        .transpose()?
        .unwrap_or_default();
    Ok(ProbeReply {
        responder,
        round_trip_us,
        mpls,
    })
}

/// Splits a flat `label,tc,bos,ttl,...` list into labels, in list order.
pub(crate) fn parse_mpls(list: &str) -> Result<Vec<MplsLabel>, String> {
    let values: Vec<&str> = list.split(',').collect();
    if values.len() % 4 != 0 {
        return Err(format!("mpls list `{}` is not a multiple of four", list));
    }
    values
        .chunks(4)
        .map(|group| {
            Ok(MplsLabel {
                label: parse_number("mpls label", group[0])?,
                traffic_class: parse_number("mpls traffic class", group[1])?,
                bottom_of_stack: parse_number::<u8>("mpls bottom of stack", group[2])? != 0,
                ttl: parse_number("mpls ttl", group[3])?,
            })
        })
        .collect()
}
