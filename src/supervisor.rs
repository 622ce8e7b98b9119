//! Starts, watches and stops the protocol tasks.
//!
//! Each enabled protocol runs as one task in a [`JoinSet`] with its own
//! child cancellation token. A fatal error from any task is surfaced by
//! [`Supervisor::wait`] so the caller can stop everything; any other error
//! only ends the task that raised it. [`Supervisor::run_until`] keeps the
//! process alive after the last task ends, until a signal arrives.

use std::fmt;

use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::Context;
use crate::dhcp::DhcpClient;
use crate::error::Result;
use crate::ipfix::IpfixExporter;
use crate::metrics::report_periodically;
use crate::radius::{Accountant, Authenticator};
use crate::upnp::UpnpDiscovery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Dhcp,
    Upnp,
    Authentication,
    Accounting,
    Ipfix,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dhcp => write!(f, "dhcp"),
            Self::Upnp => write!(f, "upnp"),
            Self::Authentication => write!(f, "authentication"),
            Self::Accounting => write!(f, "accounting"),
            Self::Ipfix => write!(f, "ipfix"),
        }
    }
}

pub struct Supervisor {
    ctx: Context,
    cancel: CancellationToken,
    tasks: JoinSet<(Service, Result<()>)>,
    handles: Vec<(Service, AbortHandle)>,
    reporter: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Spawns one task per enabled protocol plus the statistics reporter.
    ///
    /// Building a protocol can fail fatally (unresolvable interface, bad
    /// DHCP options); in that case nothing is left running.
    pub fn start(ctx: Context) -> Result<Self> {
        let mut supervisor = Self {
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            handles: Vec::new(),
            reporter: None,
            ctx,
        };

        if let Err(error) = supervisor.spawn_enabled() {
            supervisor.cancel.cancel();
            supervisor.tasks.abort_all();
            return Err(error);
        }

        let settings = &supervisor.ctx.settings.general;
        if !settings.stats_interval.is_zero() {
            supervisor.reporter = Some(tokio::spawn(report_periodically(
                supervisor.ctx.metrics.clone(),
                settings.stats_interval,
                supervisor.cancel.child_token(),
            )));
        }

        info!(
            "Supervisor started {} protocol task(s): {:?}",
            supervisor.handles.len(),
            supervisor.running()
        );
        Ok(supervisor)
    }

    fn spawn_enabled(&mut self) -> Result<()> {
        let ctx = self.ctx.clone();
        let settings = &ctx.settings;
        let device = &settings.general.device;

        if settings.dhcp.enabled {
            let client = DhcpClient::new(&settings.dhcp, device, ctx.interface()?, ctx.observer())?;
            let token = self.cancel.child_token();
            self.spawn(Service::Dhcp, async move { client.run(token).await });
        }

        if settings.upnp.enabled {
            let discovery =
                UpnpDiscovery::new(settings.upnp.clone(), ctx.interface()?, ctx.observer());
            let token = self.cancel.child_token();
            self.spawn(Service::Upnp, async move { discovery.run(token).await });
        }

        if settings.authentication.enabled {
            let authenticator = Authenticator::new(
                settings.authentication.clone(),
                device.clone(),
                ctx.radius_pool.clone(),
                ctx.observer(),
            );
            let token = self.cancel.child_token();
            self.spawn(Service::Authentication, async move {
                authenticator.run(token).await
            });
        }

        if settings.accounting.enabled {
            let accountant = Accountant::new(
                settings.accounting.clone(),
                device.clone(),
                ctx.radius_pool.clone(),
                ctx.observer(),
            );
            let token = self.cancel.child_token();
            self.spawn(Service::Accounting, async move { accountant.run(token).await });
        }

        if settings.ipfix.enabled {
            let exporter = IpfixExporter::new(
                &settings.ipfix,
                device,
                ctx.limiter.clone(),
                ctx.observer(),
            );
            let token = self.cancel.child_token();
            self.spawn(Service::Ipfix, async move { exporter.run(token).await });
        }

        Ok(())
    }

    fn spawn<F>(&mut self, service: Service, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let handle = self.tasks.spawn(async move { (service, task.await) });
        self.handles.push((service, handle));
    }

    /// Protocols whose task has not finished yet.
    pub fn running(&self) -> Vec<Service> {
        self.handles
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(service, _)| *service)
            .collect()
    }

    /// Waits until every task has finished or one fails fatally.
    ///
    /// Returns the fatal error, if any. Tasks that end with a transient
    /// error are logged and left stopped.
    pub async fn wait(&mut self) -> Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((service, Ok(()))) => info!("{} task finished", service),
                Ok((service, Err(err))) if err.is_fatal() => {
                    error!("{} task failed: {}", service, err);
                    return Err(err);
                }
                Ok((service, Err(err))) => warn!("{} task stopped: {}", service, err),
                Err(join_error) if join_error.is_panic() => {
                    error!("Protocol task panicked: {}", join_error)
                }
                Err(_) => {}
            }
        }
        Ok(())
    }

    /// Runs until `signal` resolves or a task fails fatally.
    ///
    /// Tasks running out on their own does not end the run; the simulator
    /// keeps idling until `signal` fires. Returns the signal's output.
    pub async fn run_until<S: Future>(&mut self, signal: S) -> Result<S::Output> {
        tokio::pin!(signal);

        tokio::select! {
            result = self.wait() => {
                result?;
                info!("No protocol task running, waiting for a signal");
            }
            output = &mut signal => return Ok(output),
        }

        Ok(signal.await)
    }

    /// Cancels every task and waits for them to exit.
    pub async fn shutdown(mut self) {
        info!("Shutting down protocol tasks");
        self.cancel.cancel();
        self.ctx.limiter.close();

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((service, Err(err))) => warn!("{} task ended with: {}", service, err),
                Ok((service, Ok(()))) => info!("{} task stopped", service),
                Err(join_error) => warn!("Protocol task did not stop cleanly: {}", join_error),
            }
        }
        if let Some(reporter) = self.reporter.take() {
            let _ = reporter.await;
        }
        self.ctx.metrics.log_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn test_nothing_enabled_starts_nothing() {
        let ctx = Context::new(
            ConfigStore::parse(
                "[general]\nstats_interval = 0\n[dhcp]\nenabled = no\n[upnp]\nenabled = no\n\
                 [authentication]\nenabled = no\nserver = 10.0.0.2\n[ipfix]\nenabled = no\n",
            )
            .unwrap(),
        );
        let mut supervisor = Supervisor::start(ctx).unwrap();

        assert!(supervisor.running().is_empty());
        supervisor.wait().await.unwrap();
        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_simulator_keeps_running_until_signal() {
        let ctx = Context::new(
            ConfigStore::parse(
                "[general]\nstats_interval = 0\n[dhcp]\nenabled = no\n[upnp]\nenabled = no\n\
                 [authentication]\nenabled = no\nserver = 10.0.0.2\n[ipfix]\nenabled = no\n",
            )
            .unwrap(),
        );
        let mut supervisor = Supervisor::start(ctx).unwrap();
        let (stop, signal) = tokio::sync::oneshot::channel::<&str>();

        let run = tokio::spawn(async move {
            let result = supervisor.run_until(signal).await;
            supervisor.shutdown().await;
            result
        });

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!run.is_finished());

        stop.send("stop").unwrap();
        let output = run.await.unwrap().unwrap();
        assert_eq!(output, Ok("stop"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_keeps_running_until_signal() {
        let ctx = Context::new(
            ConfigStore::parse("[general]\nstats_interval = 0\n[ipfix]\nenabled = true\ntraffic = []\n")
                .unwrap(),
        );
        let mut supervisor = Supervisor::start(ctx).unwrap();
        let token = CancellationToken::new();
        let signal = token.clone();

        let run = tokio::spawn(async move {
            let result = supervisor.run_until(async move { signal.cancelled().await }).await;
            let running = supervisor.running();
            supervisor.shutdown().await;
            (result, running)
        });

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(!run.is_finished());

        token.cancel();
        let (result, running) = run.await.unwrap();
        assert!(result.is_ok());
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn test_fatal_error_ends_run_before_signal() {
        let mut supervisor = Supervisor {
            ctx: Context::new(ConfigStore::parse("").unwrap()),
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            handles: Vec::new(),
            reporter: None,
        };
        supervisor.spawn(Service::Dhcp, async {
            Err(crate::error::Error::Interface {
                name: "devsim-missing0".to_string(),
                reason: "not found".to_string(),
            })
        });

        let error = supervisor
            .run_until(std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(error.is_fatal());
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_dhcp_without_interface_is_fatal() {
        let ctx = Context::new(
            ConfigStore::parse("[general]\ninterface = devsim-missing0\n[dhcp]\nenabled = true\n")
                .unwrap(),
        );
        let error = Supervisor::start(ctx).err().unwrap();
        assert!(error.is_fatal());
    }

    #[tokio::test]
    async fn test_ipfix_end_to_end() {
        let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = collector.local_addr().unwrap().port();
        let ini = format!(
            "[general]\nclientip = 10.0.0.50\n\
             [ipfix]\nenabled = true\ndestination_ip = 127.0.0.1\ndestination_port = {}\n\
             traffic = [{{\"SourceIP\": \"10.0.0.50\", \"DestinationIP\": \"10.0.0.1\", \
             \"SourcePort\": 40000, \"DestinationPort\": 443, \"Packets\": 10, \"Octets\": 1500}}]\n",
            port
        );
        let ctx = Context::new(ConfigStore::parse(&ini).unwrap());
        let metrics = ctx.metrics.clone();
        let supervisor = Supervisor::start(ctx).unwrap();
        assert_eq!(supervisor.running(), vec![Service::Ipfix]);

        let mut buf = [0u8; 1500];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), collector.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, 229);
        assert_eq!(&buf[0..2], &[0, 10]);

        supervisor.shutdown().await;
        assert_eq!(metrics.snapshot().ipfix_packets, 1);
    }

    #[tokio::test]
    async fn test_transient_task_error_is_not_fatal() {
        let ctx = Context::new(
            ConfigStore::parse("[ipfix]\nenabled = true\ntraffic = []\n").unwrap(),
        );
        let mut supervisor = Supervisor::start(ctx).unwrap();
        supervisor.wait().await.unwrap();
        assert!(supervisor.running().is_empty());
        supervisor.shutdown().await;
    }
}
