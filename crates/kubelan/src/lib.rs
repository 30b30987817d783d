//! kubelan: a VXLAN overlay whose peers follow Kubernetes service endpoints
//!
//! The daemon creates one kernel VXLAN interface and keeps a static all-zero
//! MAC flood entry for every endpoint address of a chosen set of services.
//! Broadcast and unknown-unicast frames reach every peer without multicast
//! in the underlay, and the kernel learns real MAC locations from traffic.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌────────────────────────┐   ┌─────────────────┐
//! │  WatchSource     │──▶│  MembershipReconciler  │──▶│ OverlayInterface│
//! │ (EndpointSlices) │   │  per-slice peer state  │   │  netlink FDB    │
//! └──────────────────┘   └───────────┬────────────┘   └─────────────────┘
//!                                    ▼
//!                              ┌────────────┐
//!                              │ HookRunner │
//!                              └────────────┘
//! ```

pub mod config;
pub mod error;
pub mod hooks;
pub mod http;
pub mod k8s;
pub mod manager;
pub mod netlink;
pub mod reconciler;
pub mod types;
pub mod vxlan;
pub mod watch;

pub use config::{Config, HooksConfig, MtuSetting, VxlanConfig, DEFAULT_CONFIG_PATH};
pub use error::{KubelanError, Result};
pub use hooks::HookRunner;
pub use k8s::{EndpointSliceWatcher, SliceTracker};
pub use manager::{Manager, ManagerStatus};
pub use netlink::RouteSocket;
pub use reconciler::{ChangeHook, MembershipChange, MembershipObserver, MembershipReconciler};
pub use types::{
    ChangeKind, EndpointChangeEvent, ServiceIdentity, ServiceRef, SliceChange, SliceKey,
    SliceResource, WatchSet,
};
pub use vxlan::{infer_mtu, HostInterface, LinkDriver, OverlayInterface, PeerTable, VxlanLinkSpec};
pub use watch::{ChannelWatchSource, WatchSource};

/// Initialize logging. `RUST_LOG` takes precedence over `log_level`.
pub fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).compact())
        .init();
}
