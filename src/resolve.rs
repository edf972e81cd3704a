use std::net::IpAddr;

use log::debug;

use crate::{
    command::{CommandRecord, DNS_RESOLVE},
    error::{Error, Result},
    multiplexer::Multiplexer,
    response::ReplyBody,
};

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(address: &IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }

    pub(crate) fn address_key(self) -> &'static str {
        match self {
            IpVersion::V4 => "ip-4",
            IpVersion::V6 => "ip-6",
        }
    }

    pub(crate) fn local_address_key(self) -> &'static str {
        match self {
            IpVersion::V4 => "local-ip-4",
            IpVersion::V6 => "local-ip-6",
        }
    }
}

/// How hostnames that are not address literals get resolved.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub enum ResolveStrategy {
    /// The host's resolver, queried from the client process.
    #[default]
    System,
    /// A `dns-resolve` command to the probe daemon.
    Daemon,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ResolvedHost {
    pub ip_version: IpVersion,
    pub address: IpAddr,
}

impl From<IpAddr> for ResolvedHost {
    fn from(address: IpAddr) -> Self {
        Self {
            ip_version: IpVersion::of(&address),
            address,
        }
    }
}

fn accepts(ip_version: Option<IpVersion>, address: &IpAddr) -> bool {
    ip_version.map_or(true, |version| version == IpVersion::of(address))
}

/// Short-circuits address literals; `None` means a lookup is needed.
fn literal(host: &str, ip_version: Option<IpVersion>) -> Option<Result<ResolvedHost>> {
    let address = host.parse::<IpAddr>().ok()?;
    if accepts(ip_version, &address) {
        Some(Ok(address.into()))
    } else {
        Some(Err(Error::HostResolve(host.into())))
    }
}

pub(crate) async fn resolve(
    mux: &Multiplexer,
    strategy: ResolveStrategy,
    host: &str,
    ip_version: Option<IpVersion>,
) -> Result<ResolvedHost> {
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(Error::HostResolve(host.into()));
    }
    if let Some(resolved) = literal(host, ip_version) {
        return resolved;
    }
    let resolved = match strategy {
        ResolveStrategy::System => resolve_system(host, ip_version).await?,
        ResolveStrategy::Daemon => resolve_daemon(mux, host, ip_version).await?,
    };
    debug!("resolved `{}` to {}", host, resolved.address);
    Ok(resolved)
}

async fn resolve_system(host: &str, ip_version: Option<IpVersion>) -> Result<ResolvedHost> {
    let addresses = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|err| {
            debug!("failed to look up `{}`, reason: {}", host, err);
            Error::HostResolve(host.into())
        })?;
    addresses
        .map(|socket| socket.ip())
        .find(|address| accepts(ip_version, address))
        .map(ResolvedHost::from)
        .ok_or_else(|| Error::HostResolve(host.into()))
}

async fn resolve_daemon(
    mux: &Multiplexer,
    host: &str,
    ip_version: Option<IpVersion>,
) -> Result<ResolvedHost> {
    let mut command = CommandRecord::new(DNS_RESOLVE).with_arg("hostname", host);
    if let Some(version) = ip_version {
        command = command.with_arg("ip-version", version.number());
    }
    let reply = match mux.submit(&command).await {
        Ok(reply) => reply,
        Err(Error::Protocol(err)) => {
            debug!("failed to resolve `{}`, reason: {}", host, err);
            return Err(Error::HostResolve(host.into()));
        }
        Err(err) => return Err(err),
    };
    match reply.body {
        ReplyBody::DnsReply { address } if accepts(ip_version, &address) => Ok(address.into()),
        other => {
            debug!("failed to resolve `{}`, daemon replied {}", host, other.kind());
            Err(Error::HostResolve(host.into()))
        }
    }
}
