use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::common::{Address, ProxyStream, RouterError};
use crate::proxy::{Network, OutboundHandler};

pub struct RejectOutbound {
    name: String,
}

impl RejectOutbound {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl OutboundHandler for RejectOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "reject"
    }

    async fn dial(&self, _network: Network, target: &Address) -> Result<ProxyStream> {
        debug!(target = %target, "reject: connection blocked");
        Err(RouterError::Rejected(self.name.clone()).into())
    }

    async fn test(&self, _url: &str, _timeout: Duration) -> Result<u64> {
        Err(RouterError::Rejected(self.name.clone()).into())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
