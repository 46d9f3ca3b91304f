use crate::alert::Alerter;
use crate::config::Config;
use crate::mailer::Mailer;
use crate::present::{build_status, Presenter};
use crate::series::AppendError;
use crate::server::InboundRecord;
use crate::store::{IngestError, SeriesStore};
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The single writer over all series. Drains the inbound queue, classifies
/// every series for the alerter, publishes renderer snapshots and flushes
/// the alert outbox, once per tick.
pub struct Supervisor {
    store: SeriesStore,
    alerter: Alerter,
    mailer: Mailer,
    presenter: Presenter,
    inbound: mpsc::Receiver<InboundRecord>,
    tick_interval: std::time::Duration,
    history_interval: Duration,
    timezone: Tz,
    memory_limit_mb: u64,
    cancel: CancellationToken,
    system: System,
    last_history: Option<DateTime<Utc>>,
}

impl Supervisor {
    pub fn new(
        config: &Config,
        store: SeriesStore,
        mailer: Mailer,
        presenter: Presenter,
        inbound: mpsc::Receiver<InboundRecord>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            alerter: Alerter::new(config.pause_warn_value, config.pause_warn_failure),
            mailer,
            presenter,
            inbound,
            tick_interval: config.tick_interval,
            history_interval: Duration::from_std(config.history_interval)
                .unwrap_or_else(|_| Duration::minutes(10)),
            timezone: config.timezone,
            memory_limit_mb: config.memory_limit_mb,
            cancel,
            system: System::new(),
            last_history: None,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.tick(Utc::now()).await?;
                }
            }
        }
        // Final pass so late records and queued alerts are not lost on a
        // clean shutdown.
        self.tick(Utc::now()).await?;
        tracing::info!("supervisor stopped");
        Ok(())
    }

    pub(crate) async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.drain_inbound(now);

        for series in self.store.iter() {
            self.alerter.observe(series, now);
        }

        let snapshot = build_status(&self.store, now, self.timezone);
        if let Err(err) = self.presenter.publish_status(&snapshot) {
            tracing::error!(error = %err, "status publish failed");
        }

        let history_due = self
            .last_history
            .map_or(true, |last| now - last >= self.history_interval);
        if history_due {
            if let Err(err) = self.presenter.publish_history(&self.store, now) {
                tracing::error!(error = %err, "history publish failed");
            }
            self.last_history = Some(now);
        }

        if let Some(body) = self.alerter.flush() {
            self.mailer.send_user("Warnung", &body).await;
        }

        self.memory_check()?;
        Ok(())
    }

    fn drain_inbound(&mut self, now: DateTime<Utc>) {
        let mut accepted = 0usize;
        loop {
            let inbound = match self.inbound.try_recv() {
                Ok(inbound) => inbound,
                Err(mpsc::error::TryRecvError::Empty)
                | Err(mpsc::error::TryRecvError::Disconnected) => break,
            };
            match self.store.ingest(&inbound.name, inbound.record, now) {
                Ok(()) => accepted += 1,
                Err(IngestError::Append(AppendError::OlderThanPrevious { timestamp, last })) => {
                    tracing::warn!(
                        series = %inbound.name,
                        %timestamp,
                        %last,
                        "ignore record older than previous"
                    );
                }
                Err(err) => {
                    tracing::warn!(series = %inbound.name, error = %err, "record dropped");
                }
            }
        }
        if accepted > 0 {
            tracing::debug!(accepted, "drained inbound records");
        }
    }

    /// The long-running process must not creep; a leak is a crash, not a
    /// slow death (surfaced to the admin through the crash mail path).
    fn memory_check(&mut self) -> Result<()> {
        let pid = sysinfo::get_current_pid().map_err(|err| anyhow!("current pid: {err}"))?;
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let Some(process) = self.system.process(pid) else {
            return Ok(());
        };
        let rss_mb = process.memory() / (1024 * 1024);
        tracing::debug!(rss_mb, "memory usage");
        if rss_mb > self.memory_limit_mb {
            bail!("memory ceiling exceeded: {rss_mb} MB > {} MB", self.memory_limit_mb);
        }
        Ok(())
    }
}
