use std::time::Duration;

use futures::{FutureExt, future::BoxFuture};
use vertex_net_holepunch::{ConnectionInfo, IdentifyService};

/// Identify service stand-in with a fixed completion behaviour.
#[derive(Debug, Clone, Copy)]
pub enum SimIdentify {
    /// Every peer is identified immediately.
    Immediate,
    /// Identification completes after the given delay.
    Delayed(Duration),
    /// Identification never completes.
    Never,
}

impl IdentifyService for SimIdentify {
    fn identify_wait(&self, _connection: &ConnectionInfo) -> BoxFuture<'static, ()> {
        match *self {
            Self::Immediate => futures::future::ready(()).boxed(),
            Self::Delayed(delay) => tokio::time::sleep(delay).boxed(),
            Self::Never => futures::future::pending().boxed(),
        }
    }
}
