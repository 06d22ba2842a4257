//! Host package manager and service control.

use async_trait::async_trait;
use tracing::info;

use crate::command::{HostCommand, HostError};

/// Ways of starting the container daemon, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DaemonStart {
    Systemctl,
    Service,
}

impl DaemonStart {
    pub const ORDER: [DaemonStart; 2] = [DaemonStart::Systemctl, DaemonStart::Service];

    pub fn label(self) -> &'static str {
        match self {
            Self::Systemctl => "systemctl",
            Self::Service => "service",
        }
    }
}

/// Package database and init system of the host.
#[async_trait]
pub trait HostSystem: Send + Sync {
    async fn package_installed(&self, name: &str) -> Result<bool, HostError>;
    async fn refresh_package_index(&self) -> Result<(), HostError>;
    /// Install a package. Installing an installed package succeeds.
    async fn install_package(&self, name: &str) -> Result<(), HostError>;
    async fn start_daemon(&self, service: &str, method: DaemonStart) -> Result<(), HostError>;
}

/// Debian/Ubuntu host: dpkg + apt-get, systemd or SysV service control.
#[derive(Debug, Default)]
pub struct AptHost;

impl AptHost {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HostSystem for AptHost {
    async fn package_installed(&self, name: &str) -> Result<bool, HostError> {
        let output = HostCommand::new("dpkg-query")
            .args(["-W", "-f=${Status}", name])
            .output()
            .await?;
        Ok(output.success() && output.stdout.contains("install ok installed"))
    }

    async fn refresh_package_index(&self) -> Result<(), HostError> {
        info!("Refreshing package index");
        HostCommand::new("apt-get")
            .args(["update", "-q"])
            .env("DEBIAN_FRONTEND", "noninteractive")
            .checked()
            .await?;
        Ok(())
    }

    async fn install_package(&self, name: &str) -> Result<(), HostError> {
        info!("Installing package {}", name);
        HostCommand::new("apt-get")
            .args(["install", "-y", "-q", "--no-install-recommends", name])
            .env("DEBIAN_FRONTEND", "noninteractive")
            .checked()
            .await?;
        Ok(())
    }

    async fn start_daemon(&self, service: &str, method: DaemonStart) -> Result<(), HostError> {
        info!("Starting {} via {}", service, method.label());
        let cmd = match method {
            DaemonStart::Systemctl => HostCommand::new("systemctl").args(["start", service]),
            DaemonStart::Service => HostCommand::new("service").args([service, "start"]),
        };
        cmd.checked().await?;
        Ok(())
    }
}
