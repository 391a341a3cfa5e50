//! Network association.
//!
//! Before the gateway can reach its server the host must be associated with
//! the wireless network. [`associate`] asks a [`NetworkLink`] to start
//! association and then polls until it reports success, blinking the
//! activity indicator on every poll so the device visibly shows it is
//! waiting.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Credentials,
    error::{Error, Result},
    indicator::ActivityIndicator,
    tracing::prelude::*,
    types::RetryPolicy,
};

/// Interval between association polls.
pub const ASSOCIATION_POLL: Duration = Duration::from_millis(500);

/// A network link the supervisor can bring up and watch.
#[async_trait]
pub trait NetworkLink: Send {
    /// Start associating with the given credentials.
    ///
    /// Failures are logged by the implementation; the supervisor keeps
    /// polling regardless, since the network may come up on its own.
    async fn begin(&mut self, credentials: &Credentials);

    /// Whether the link is associated right now.
    async fn is_associated(&mut self) -> bool;
}

/// Link that is always up: wired hosts, or association handled elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct Preassociated;

#[async_trait]
impl NetworkLink for Preassociated {
    async fn begin(&mut self, _credentials: &Credentials) {}

    async fn is_associated(&mut self) -> bool {
        true
    }
}

/// Wireless link managed by NetworkManager.
///
/// Association is started with `nmcli` and observed through the kernel's
/// operational state for the interface.
#[derive(Debug, Clone)]
pub struct NetworkManagerLink {
    interface: String,
    sysfs_net: PathBuf,
}

impl NetworkManagerLink {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            sysfs_net: PathBuf::from("/sys/class/net"),
        }
    }

    fn operstate_path(&self) -> PathBuf {
        self.sysfs_net.join(&self.interface).join("operstate")
    }
}

/// Interpret the contents of a `/sys/class/net/<iface>/operstate` file.
pub fn operstate_is_up(contents: &str) -> bool {
    contents.trim() == "up"
}

#[async_trait]
impl NetworkLink for NetworkManagerLink {
    async fn begin(&mut self, credentials: &Credentials) {
        let mut cmd = Command::new("nmcli");
        cmd.args(["device", "wifi", "connect", credentials.ssid.as_str()]);
        if let Some(password) = &credentials.password {
            cmd.args(["password", password.as_str()]);
        }
        cmd.args(["ifname", self.interface.as_str()]);

        info!(ssid = %credentials.ssid, interface = %self.interface, "Associating");
        match cmd.output().await {
            Ok(out) if out.status.success() => {
                debug!(interface = %self.interface, "nmcli accepted connection request");
            }
            Ok(out) => {
                warn!(
                    interface = %self.interface,
                    status = %out.status,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "nmcli connection request failed"
                );
            }
            Err(e) => {
                warn!(error = %e, "Cannot run nmcli; waiting for link anyway");
            }
        }
    }

    async fn is_associated(&mut self) -> bool {
        match tokio::fs::read_to_string(self.operstate_path()).await {
            Ok(state) => operstate_is_up(&state),
            Err(e) => {
                trace!(interface = %self.interface, error = %e, "No operstate");
                false
            }
        }
    }
}

/// Bring the link up and wait until it is associated.
///
/// Polls every [`ASSOCIATION_POLL`]. The policy only bounds the number of
/// polls; its delay is not used. With an unbounded policy this returns only
/// on success or cancellation.
pub async fn associate<L, I>(
    link: &mut L,
    credentials: Option<&Credentials>,
    policy: &RetryPolicy,
    indicator: &mut I,
    cancel: &CancellationToken,
) -> Result<()>
where
    L: NetworkLink + ?Sized,
    I: ActivityIndicator + ?Sized,
{
    if let Some(credentials) = credentials {
        link.begin(credentials).await;
    }

    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        if link.is_associated().await {
            indicator.set_connected(false);
            info!(polls = attempt, "Network associated");
            return Ok(());
        }

        if !policy.allows(attempt + 1) {
            error!(polls = attempt, "Gave up waiting for network association");
            return Err(Error::AssociationTimeout { attempts: attempt });
        }

        indicator.pulse();
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(ASSOCIATION_POLL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::CountingIndicator;

    /// Link that comes up after a fixed number of polls.
    struct FlakyLink {
        up_after: u32,
        polls: u32,
        begun_with: Option<Credentials>,
    }

    impl FlakyLink {
        fn new(up_after: u32) -> Self {
            Self {
                up_after,
                polls: 0,
                begun_with: None,
            }
        }
    }

    #[async_trait]
    impl NetworkLink for FlakyLink {
        async fn begin(&mut self, credentials: &Credentials) {
            self.begun_with = Some(credentials.clone());
        }

        async fn is_associated(&mut self) -> bool {
            self.polls += 1;
            self.polls > self.up_after
        }
    }

    fn creds() -> Credentials {
        Credentials {
            ssid: "shop-floor".into(),
            password: Some("hunter2".into()),
        }
    }

    #[test]
    fn test_operstate_parsing() {
        assert!(operstate_is_up("up\n"));
        assert!(!operstate_is_up("down\n"));
        assert!(!operstate_is_up("dormant"));
        assert!(!operstate_is_up(""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_associate_polls_until_up() {
        let mut link = FlakyLink::new(3);
        let mut indicator = CountingIndicator::default();
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();

        associate(
            &mut link,
            Some(&creds()),
            &RetryPolicy::default(),
            &mut indicator,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(link.polls, 4);
        assert_eq!(link.begun_with, Some(creds()));
        assert_eq!(indicator.pulses(), 3);
        assert_eq!(start.elapsed(), ASSOCIATION_POLL * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_associate_without_credentials_skips_begin() {
        let mut link = FlakyLink::new(0);
        let mut indicator = CountingIndicator::default();
        associate(
            &mut link,
            None,
            &RetryPolicy::default(),
            &mut indicator,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(link.begun_with.is_none());
        assert_eq!(indicator.pulses(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_associate_gives_up_at_cap() {
        let mut link = FlakyLink::new(u32::MAX);
        let mut indicator = CountingIndicator::default();
        let policy = RetryPolicy::fixed(ASSOCIATION_POLL).with_max_attempts(5);

        let err = associate(
            &mut link,
            None,
            &policy,
            &mut indicator,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::AssociationTimeout { attempts: 5 }));
        assert_eq!(link.polls, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_associate_cancelled() {
        let mut link = FlakyLink::new(u32::MAX);
        let mut indicator = CountingIndicator::default();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            canceller.cancel();
        });

        let err = associate(
            &mut link,
            None,
            &RetryPolicy::default(),
            &mut indicator,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_network_manager_link_reads_operstate() {
        let root = std::env::temp_dir().join(format!("picolink-net-{}", std::process::id()));
        let iface_dir = root.join("wlan9");
        std::fs::create_dir_all(&iface_dir).unwrap();

        let mut link = NetworkManagerLink {
            interface: "wlan9".into(),
            sysfs_net: root.clone(),
        };
        assert!(!link.is_associated().await);

        std::fs::write(iface_dir.join("operstate"), "dormant\n").unwrap();
        assert!(!link.is_associated().await);

        std::fs::write(iface_dir.join("operstate"), "up\n").unwrap();
        assert!(link.is_associated().await);

        let _ = std::fs::remove_dir_all(&root);
    }
}
