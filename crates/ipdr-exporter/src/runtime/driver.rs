//! Event loop feeding socket activity and timer ticks into the exporter.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::tcp::TransportEvent;
use crate::error::{ExporterError, ExporterResult};
use crate::exporter::Exporter;
use crate::protocol::BasicProtocol;

/// How often due timers are processed.
pub const DEFAULT_TICK: Duration = Duration::from_millis(50);

pub struct ExporterDriver {
    exporter: Exporter,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    tick: Duration,
}

impl ExporterDriver {
    pub fn new(exporter: Exporter, events: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        Self {
            exporter,
            events,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Runs until `shutdown` flips to true or the transport goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_ms = self.tick.as_millis() as u64, "exporter driver started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let fired = self.exporter.process_timers();
                    if fired > 0 {
                        debug!(fired, "timers processed");
                    }
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }
        info!("exporter driver stopped");
    }

    fn handle(&self, event: TransportEvent) {
        let result = match event {
            TransportEvent::Accepted { handle, peer } => self
                .exporter
                .inbound_connection(handle, peer)
                .map(|collector| debug!(%handle, %peer, %collector, "inbound connection")),
            TransportEvent::Connected { handle, peer } => {
                self.exporter.connection_established(handle, Some(peer))
            }
            TransportEvent::ConnectFailed { handle, error } => {
                debug!(%handle, %error, "connection attempt failed");
                self.exporter.connection_failed(handle)
            }
            TransportEvent::Frame { handle, frame } => {
                BasicProtocol::handle_frame(&self.exporter, handle, &frame)
            }
            TransportEvent::Closed { handle, reason } => {
                self.exporter.connection_closed(handle, reason)
            }
        };
        report(result);
    }
}

fn report(result: ExporterResult<()>) {
    match result {
        Ok(()) => {}
        // Races between a local close and in-flight socket events.
        Err(ExporterError::ConnectionNotFound(handle)) => {
            debug!(%handle, "event for a connection that is already gone")
        }
        Err(e) => warn!(error = %e, "failed to process transport event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterStore;
    use crate::transport::MemoryTransport;
    use crate::types::TransportHandle;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_driver_stops_on_shutdown() {
        let exporter = Exporter::init(ParameterStore::new(), Arc::new(MemoryTransport::new())).unwrap();
        let (_tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(ExporterDriver::new(exporter, rx).with_tick(Duration::from_millis(5)).run(stop_rx));
        stop_tx.send(true).unwrap();
        tokio_test::assert_ok!(task.await);
    }

    #[tokio::test]
    async fn test_driver_stops_when_transport_drops() {
        let exporter = Exporter::init(ParameterStore::new(), Arc::new(MemoryTransport::new())).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(ExporterDriver::new(exporter, rx).run(stop_rx));
        tx.send(TransportEvent::Closed {
            handle: TransportHandle(99),
            reason: crate::events::DisconnectReason::Tcp,
        })
        .unwrap();
        drop(tx);
        tokio_test::assert_ok!(task.await);
    }

    #[tokio::test]
    async fn test_inbound_connection_creates_dummy_collector() {
        let exporter = Exporter::init(ParameterStore::new(), Arc::new(MemoryTransport::new())).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(ExporterDriver::new(exporter.clone(), rx).run(stop_rx));
        tx.send(TransportEvent::Accepted {
            handle: TransportHandle(1),
            peer: "10.1.1.1:40000".parse().unwrap(),
        })
        .unwrap();
        drop(tx);
        tokio_test::assert_ok!(task.await);

        let collectors = exporter.list_collectors();
        assert_eq!(collectors.len(), 1);
        assert!(collectors[0].is_dummy);
    }
}
