//! Overlay manager
//!
//! Owns the daemon lifecycle: create the VXLAN interface, run the up hook,
//! dispatch watch events to the reconciler until shutdown, then stop the
//! watch, cancel hooks and delete the interface, in that order.

use crate::config::Config;
use crate::error::{KubelanError, Result};
use crate::hooks::{up_env, HookRunner};
use crate::netlink::RouteSocket;
use crate::reconciler::{ChangeHook, MembershipReconciler};
use crate::types::WatchSet;
use crate::vxlan::{LinkDriver, OverlayInterface};
use crate::watch::WatchSource;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared flag reporting whether the overlay is up
#[derive(Debug, Clone, Default)]
pub struct ManagerStatus(Arc<AtomicBool>);

impl ManagerStatus {
    pub fn is_started(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set_started(&self, started: bool) {
        self.0.store(started, Ordering::Release);
    }
}

/// Wires a watch source to the reconciler and owns the overlay interface.
pub struct Manager<D: LinkDriver = RouteSocket> {
    config: Arc<Config>,
    source_ip: IpAddr,
    watch_set: WatchSet,
    hooks: HookRunner,
    status: ManagerStatus,
    driver: D,
}

impl Manager<RouteSocket> {
    /// Create a manager driving the kernel through a netlink socket
    pub fn new(config: Config) -> Result<Self> {
        Self::with_driver(config, RouteSocket::new()?)
    }
}

impl<D: LinkDriver> Manager<D> {
    /// Create a manager using `driver` for kernel operations.
    ///
    /// `config.ip` must already be resolved.
    pub fn with_driver(config: Config, driver: D) -> Result<Self> {
        let source_ip = config
            .ip
            .ok_or_else(|| KubelanError::config("No source IP address configured"))?;
        let watch_set = config.watch_set();

        if watch_set.is_empty() {
            warn!("No services to watch, overlay will have no peers");
        }

        Ok(Self {
            config: Arc::new(config),
            source_ip,
            watch_set,
            hooks: HookRunner::new(),
            status: ManagerStatus::default(),
            driver,
        })
    }

    pub fn status(&self) -> ManagerStatus {
        self.status.clone()
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    pub fn watch_set(&self) -> &WatchSet {
        &self.watch_set
    }

    /// Run until `shutdown` is cancelled or the watch source ends.
    ///
    /// Setup failures abort before any event is processed. A failure to
    /// delete the interface during teardown is returned.
    pub async fn run<W: WatchSource>(
        self,
        mut watch: W,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let Self {
            config,
            source_ip,
            watch_set,
            hooks,
            status,
            driver,
        } = self;
        let vxlan = &config.vxlan;

        info!(
            interface = %vxlan.interface,
            vni = vxlan.vni,
            source = %source_ip,
            services = watch_set.len(),
            "Starting kubelan manager"
        );

        let interface = match OverlayInterface::create(
            driver,
            &vxlan.interface,
            vxlan.vni,
            source_ip,
            vxlan.port,
            vxlan.mtu,
        ) {
            Ok(interface) => interface,
            Err(e) => {
                error!(error = %e, "Failed to create VXLAN interface");
                watch.stop().await;
                hooks.cancel();
                return Err(e);
            }
        };

        if let Err(e) = hooks.fire("up", &config.hooks.up, up_env(&vxlan.interface)) {
            warn!(error = %e, "Failed to fire up hook");
        }

        let observer = ChangeHook::new(
            hooks.clone(),
            vxlan.interface.clone(),
            config.hooks.change.clone(),
        );
        let mut reconciler = MembershipReconciler::new(watch_set, source_ip, interface, observer);

        status.set_started(true);
        info!("kubelan manager started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                event = watch.next_event() => match event {
                    Some(event) => {
                        reconciler.handle_event(&event);
                    }
                    None => {
                        warn!("Watch source ended");
                        break;
                    }
                },
            }
        }

        info!("Stopping kubelan manager");
        status.set_started(false);

        watch.stop().await;
        debug!("Watch stopped");

        hooks.cancel();
        hooks.wait().await;
        debug!("Hooks cancelled");

        let interface = reconciler.into_peer_table();
        interface.delete().inspect_err(|e| {
            error!(error = %e, "Failed to delete VXLAN interface");
        })?;

        info!("kubelan manager stopped");
        Ok(())
    }
}
