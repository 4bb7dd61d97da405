use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend;
use crate::capture;
use crate::config::Config;
use crate::flow::Aggregator;
use crate::metrics::Collector;
use crate::publish::Publisher;

/// Agent wires the capture source, the flow aggregator, the metrics
/// collector and the publisher together and owns their shutdown.
pub struct Agent {
    cfg: Config,
    cancel: CancellationToken,
    capture_thread: Option<std::thread::JoinHandle<()>>,
    update_task: Option<tokio::task::JoinHandle<()>>,
    publisher_task: Option<tokio::task::JoinHandle<()>>,
}

impl Agent {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            cancel: CancellationToken::new(),
            capture_thread: None,
            update_task: None,
            publisher_task: None,
        }
    }

    /// Token cancelled when the agent shuts down, including shutdown
    /// triggered by packet-source termination.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start all components and begin capturing.
    pub async fn start(&mut self) -> Result<()> {
        let iface = self.cfg.iface.clone().unwrap_or_default();

        // 1. Resolve the interface's local addresses. A failure here
        // degrades to an empty set: capture still works, but every packet
        // then counts as inbound.
        let local_ips = match capture::local_ips_for_interface(&iface) {
            Ok(ips) => ips,
            Err(e) => {
                warn!(iface = %iface, error = %e, "could not resolve local IPs, using empty set");
                HashSet::new()
            }
        };
        if local_ips.is_empty() {
            warn!(iface = %iface, "no local addresses; all traffic will be accounted as inbound");
        }

        // 2. Synthesize the capture filter unless one was given.
        let filter_expr = match &self.cfg.filter {
            Some(expr) if !expr.is_empty() => expr.clone(),
            _ => capture::filter::build_default_filter(
                "tcp or udp or icmp",
                self.cfg.direction,
                &local_ips,
            ),
        };

        // 3. Build the pipeline pieces.
        let agg = Arc::new(Aggregator::new(
            &self.cfg.host_id,
            self.cfg.dedup_mode,
            self.cfg.idle_ttl,
            local_ips,
        ));
        let metrics = Arc::new(Collector::new(0));

        let client = backend::Client::new(
            &self.cfg.backend_url,
            self.cfg.http_timeout,
            &self.cfg.tenant_id,
            &self.cfg.auth_token,
        )
        .context("creating backend client")?;

        // 4. Open the capture and spawn its thread.
        let (capture_thread, mut packets) = capture::start(
            &iface,
            &filter_expr,
            self.cfg.snaplen,
            self.cfg.promisc,
            self.cancel.clone(),
        )
        .context("starting capture")?;
        self.capture_thread = Some(capture_thread);

        info!(
            iface = %iface,
            direction = ?self.cfg.direction,
            filter = %filter_expr,
            backend = %self.cfg.backend_url,
            flush = ?self.cfg.flush_interval,
            dedup = ?self.cfg.dedup_mode,
            "capture started",
        );

        // 5. Update task: drain packet events into the aggregator. When
        // the stream ends the source is gone, so shut the agent down.
        {
            let agg = Arc::clone(&agg);
            let cancel = self.cancel.clone();
            self.update_task = Some(tokio::spawn(async move {
                while let Some(ev) = packets.recv().await {
                    agg.update(
                        ev.timestamp,
                        ev.src_ip,
                        ev.dst_ip,
                        ev.src_port,
                        ev.dst_port,
                        ev.protocol,
                        ev.length,
                    );
                }
                info!("packet stream ended, shutting down");
                cancel.cancel();
            }));
        }

        // 6. Publisher task.
        {
            let publisher = Publisher::new(
                agg,
                metrics,
                client,
                self.cfg.max_batch_conns,
                self.cfg.max_batch_bytes,
                self.cancel.clone(),
            );
            let flush_interval = self.cfg.flush_interval;
            let metrics_interval = self.cfg.metrics_interval;
            self.publisher_task = Some(tokio::spawn(async move {
                publisher.run(flush_interval, metrics_interval).await;
            }));
        }

        info!("agent started");

        Ok(())
    }

    /// Gracefully stop: cancel, then join the publisher, the updater and
    /// the capture thread. The publisher finishes its in-flight request;
    /// no additional flush is attempted.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.publisher_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "publisher task join failed");
            }
        }

        if let Some(task) = self.update_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "update task join failed");
            }
        }

        if let Some(thread) = self.capture_thread.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(_)) => error!("capture thread panicked"),
                Err(e) => error!(error = %e, "capture thread join failed"),
            }
        }

        info!("agent stopped");

        Ok(())
    }
}
