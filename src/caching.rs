use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use log::debug;
use tokio::sync::OnceCell;

use crate::{
    command::CommandRecord,
    error::{Error, ProtocolError, Result},
    multiplexer::Multiplexer,
    response::ReplyBody,
};

/// Per-connection memo of which optional features the daemon supports.
///
/// Concurrent checks of the same feature share a single `check-support` query.
/// A failed query is not cached.
#[derive(Debug, Default)]
pub(super) struct CapabilityCache {
    features: Mutex<HashMap<String, Arc<OnceCell<bool>>>>,
}

impl CapabilityCache {
    pub(super) fn new() -> Self {
        Self::default()
    }

    pub(super) async fn check(&self, mux: &Multiplexer, feature: &str) -> Result<bool> {
        let cell = {
            let mut features = self.features.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(features.entry(feature.into()).or_default())
        };
        let supported = cell.get_or_try_init(|| query(mux, feature)).await?;
        Ok(*supported)
    }

    pub(super) async fn ensure(&self, mux: &Multiplexer, feature: &str) -> Result<()> {
        if self.check(mux, feature).await? {
            Ok(())
        } else {
            Err(Error::UnsupportedFeature(feature.into()))
        }
    }

    #[cfg(test)]
    pub(super) fn get(&self, feature: &str) -> Option<bool> {
        self.features
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(feature)
            .and_then(|cell| cell.get().copied())
    }
}

async fn query(mux: &Multiplexer, feature: &str) -> Result<bool> {
    let reply = mux.submit(&CommandRecord::check_support(feature)).await?;
    match reply.body {
        ReplyBody::FeatureSupport { supported } => {
            debug!("feature `{}` supported: {}", feature, supported);
            Ok(supported)
        }
        other => Err(Error::Protocol(ProtocolError::unexpected(
            reply.token,
            format!("`{}` in answer to check-support of `{}`", other.kind(), feature),
        ))),
    }
}
