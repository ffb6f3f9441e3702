use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::control::ControlPlane;
use crate::rtc::RtcFactory;
use crate::session::{SessionConfig, SessionCoordinator, SessionHandle};
use crate::wsproto::Role;

const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub session_id: String,
    pub role: Role,
    /// Files or directories queued as soon as the session starts.
    pub files: Vec<PathBuf>,
}

/// A running session plus its optional control plane.
pub struct Daemon {
    session: SessionHandle,
    control: Option<ControlPlane>,
    task: JoinHandle<()>,
    control_stop: Arc<Notify>,
}

impl Daemon {
    /// Install logging, start the session coordinator, bind the control plane
    /// when `http_addr` is configured and queue the initial files.
    pub async fn start(cfg: Config, opts: DaemonOptions) -> Result<Self> {
        let log_path = cfg.log_file();
        crate::logging::init_log_file(&log_path)?;
        info!(
            version = env!("CARGO_PKG_VERSION"),
            session = %opts.session_id,
            role = opts.role.as_str(),
            relay = %cfg.relay_url,
            log = %log_path.display(),
            "daemon start"
        );

        let session_cfg = SessionConfig::from_config(&cfg, &opts.session_id, opts.role)
            .context("session config")?;
        let (session, task) =
            SessionCoordinator::spawn(session_cfg, RtcFactory::new(cfg.ice_servers.clone()));

        let control_stop = Arc::new(Notify::new());
        let control = match cfg.http_addr.as_deref() {
            Some(addr) => {
                let cp = ControlPlane::start(
                    addr,
                    cfg.http_token.clone(),
                    session.clone(),
                    control_stop.clone(),
                )
                .await?;
                info!(addr = %cp.bound_addr(), token = cp.token(), "control plane ready");
                Some(cp)
            }
            None => None,
        };

        for path in &opts.files {
            let ids = session
                .send_file(path)
                .await
                .with_context(|| format!("queue {}", path.display()))?;
            info!(path = %path.display(), files = ids.len(), "queued for sending");
        }

        Ok(Self {
            session,
            control,
            task,
            control_stop,
        })
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn control(&self) -> Option<&ControlPlane> {
        self.control.as_ref()
    }

    /// Run until `shutdown` fires or the session ends on its own, then stop
    /// everything.
    pub async fn wait(mut self, shutdown: Arc<Notify>) -> Result<()> {
        let ended = tokio::select! {
            _ = shutdown.notified() => false,
            res = &mut self.task => {
                if let Err(e) = res {
                    warn!(error = %e, "session task failed");
                }
                true
            }
        };
        info!("daemon stopping");
        self.control_stop.notify_one();
        if !ended {
            self.session.shutdown();
            if tokio::time::timeout(STOP_GRACE, &mut self.task).await.is_err() {
                warn!("session did not stop in time");
                self.task.abort();
            }
        }
        info!("daemon stopped");
        Ok(())
    }
}
