//! Background connect, health check and reconnect supervision.
//!
//! The supervisor connects with a bounded number of attempts, then probes the
//! engine with control pings on a private channel. Repeated probe timeouts
//! mark the engine as not responding, any other probe failure as
//! disconnected. Either way the session is torn down and re-established.

use crate::adapter::AdapterError;
use crate::channel::{ChannelCore, VppRequest};
use crate::connection::ConnectionInner;
use crate::error::ClientError;
use crate::events::{ConnectionEvent, ConnectionState};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use vppapi_protocol::ControlPing;

/// Runs until disconnect, or until reconnecting gives up.
pub(crate) async fn supervise(
    conn: Arc<ConnectionInner>,
    events: mpsc::Sender<ConnectionEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::select! {
        _ = run(&conn, &events) => {}
        _ = shutdown.recv() => {
            tracing::debug!("connection supervisor shutting down");
        }
    }
}

async fn run(conn: &Arc<ConnectionInner>, events: &mpsc::Sender<ConnectionEvent>) {
    loop {
        if let Err(err) = connect_loop(conn).await {
            emit(events, ConnectionEvent::new(ConnectionState::Failed).with_error(err));
            return;
        }
        emit(events, ConnectionEvent::new(ConnectionState::Connected));

        health_check_loop(conn, events).await;

        conn.disconnect_vpp();
        if conn.is_closed() {
            return;
        }
    }
}

/// Connects, retrying up to `max_reconnect_attempts` times after the first
/// failed attempt.
async fn connect_loop(conn: &Arc<ConnectionInner>) -> Result<(), ClientError> {
    let retries = conn.config.max_reconnect_attempts;
    let mut last_err = ClientError::NotConnected;

    for attempt in 0..=retries {
        if attempt > 0 {
            tokio::time::sleep(conn.config.reconnect_interval()).await;
        }

        let task_conn = conn.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<(), ClientError> {
            task_conn.adapter.wait_ready()?;
            task_conn.connect_vpp()
        })
        .await
        .unwrap_or_else(|e| Err(AdapterError::Connect(e.to_string()).into()));

        match result {
            Ok(()) => return Ok(()),
            Err(ClientError::ConnectionClosed) => return Err(ClientError::ConnectionClosed),
            Err(err) => {
                tracing::warn!("connect attempt {}/{} failed: {}", attempt + 1, retries + 1, err);
                last_err = err;
            }
        }
    }

    tracing::error!("giving up after {} connect attempt(s)", retries + 1);
    Err(last_err)
}

/// Probes the engine until it stops responding or a probe fails.
async fn health_check_loop(conn: &Arc<ConnectionInner>, events: &mpsc::Sender<ConnectionEvent>) {
    let probe = match conn.new_probe_channel() {
        Ok(probe) => probe,
        Err(err) => {
            tracing::error!("failed to open health check channel: {}", err);
            emit(events, ConnectionEvent::new(ConnectionState::Disconnected).with_error(err));
            return;
        }
    };

    let threshold = conn.config.health_check_threshold;
    let timeout = conn.config.health_check_reply_timeout();
    let mut failed: u32 = 0;

    loop {
        tokio::time::sleep(conn.config.health_check_probe_interval()).await;
        if !conn.is_connected() {
            tracing::debug!("health check stopped, not connected");
            return;
        }

        let stale = probe.drain_replies();
        if stale > 0 {
            tracing::debug!("discarded {} late probe replies", stale);
        }

        match send_probe(conn, &probe).await {
            Ok(()) => {
                if failed > 0 {
                    tracing::info!("VPP health check recovered after {} failed probe(s)", failed);
                    failed = 0;
                }
            }
            Err(ClientError::ProbeTimeout(_)) => {
                if conn.since_last_reply() < timeout {
                    tracing::debug!("probe reply late but VPP is busy replying, probing again");
                    continue;
                }
                failed += 1;
                tracing::warn!(
                    "VPP health check probe timed out after {:?} ({} consecutive)",
                    timeout,
                    failed
                );
                if failed > threshold {
                    tracing::error!("VPP not responding, {} probes failed", failed);
                    emit(
                        events,
                        ConnectionEvent::new(ConnectionState::NotResponding)
                            .with_error(ClientError::ProbeTimeout(timeout)),
                    );
                    return;
                }
            }
            Err(err) => {
                tracing::error!("VPP health check failed: {}", err);
                emit(events, ConnectionEvent::new(ConnectionState::Disconnected).with_error(err));
                return;
            }
        }
    }
}

/// Sends one ping and waits for the reply carrying its sequence number.
/// Replies to earlier probes are discarded.
async fn send_probe(conn: &Arc<ConnectionInner>, probe: &ChannelCore) -> Result<(), ClientError> {
    let seq_num = probe.next_seq();
    let req = VppRequest {
        msg: Arc::new(ControlPing),
        seq_num,
        multipart: false,
    };
    conn.process_request(probe.id(), &req)?;

    let timeout = conn.config.health_check_reply_timeout();
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ClientError::ProbeTimeout(timeout));
        }
        let reply = match probe.recv_raw(remaining, None).await {
            Ok(reply) => reply,
            Err(ClientError::Timeout { .. }) => return Err(ClientError::ProbeTimeout(timeout)),
            Err(err) => return Err(err),
        };
        if let Some(err) = reply.err {
            return Err(err);
        }
        if reply.seq_num != seq_num {
            tracing::debug!(
                "discarding late probe reply seq_num={} (expected {})",
                reply.seq_num,
                seq_num
            );
            continue;
        }
        return Ok(());
    }
}

fn emit(events: &mpsc::Sender<ConnectionEvent>, event: ConnectionEvent) {
    tracing::debug!("connection event: {}", event);
    match events.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            tracing::warn!("connection event queue full, dropping {} event", event.state);
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockAdapter;
    use crate::config::ConnectionConfig;
    use crate::Connection;
    use std::time::Duration;
    use vppapi_protocol::{ControlPingReply, RequestContext};

    #[tokio::test]
    async fn test_late_ping_reply_does_not_answer_next_check() {
        let adapter = Arc::new(MockAdapter::new());
        let config = ConnectionConfig::default().with_health_check(
            Duration::from_secs(1),
            Duration::from_millis(30),
            1,
        );
        let conn = Connection::new(adapter.clone(), config).unwrap();
        conn.connect().await.unwrap();
        let inner = conn.inner().clone();
        let checker = inner.new_probe_channel().unwrap();

        adapter.set_unresponsive(true);
        let err = send_probe(&inner, &checker).await.unwrap_err();
        assert!(matches!(err, ClientError::ProbeTimeout(_)));

        // the engine answers the first ping only after it was given up on
        let late = RequestContext::new(checker.id(), false, 1).pack();
        adapter.inject(&ControlPingReply::default(), late).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = send_probe(&inner, &checker).await.unwrap_err();
        assert!(matches!(err, ClientError::ProbeTimeout(_)));

        adapter.set_unresponsive(false);
        send_probe(&inner, &checker).await.unwrap();
    }

    #[tokio::test]
    async fn test_busy_engine_is_checked_again() {
        let adapter = Arc::new(MockAdapter::new());
        let config = ConnectionConfig::default().with_health_check(
            Duration::from_millis(20),
            Duration::from_millis(200),
            0,
        );
        let conn = Connection::new(adapter.clone(), config).unwrap();
        conn.connect().await.unwrap();
        let inner = conn.inner().clone();
        let (events_tx, mut events_rx) = mpsc::channel(4);

        adapter.set_unresponsive(true);
        let check = tokio::spawn({
            let inner = inner.clone();
            async move { health_check_loop(&inner, &events_tx).await }
        });

        // keep replies flowing on another channel while pings go unanswered
        let busy = inner.new_channel_core(4).unwrap();
        let busy_ctx = RequestContext::new(busy.id(), false, 1).pack();
        for _ in 0..20 {
            adapter.inject(&ControlPingReply::default(), busy_ctx).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            busy.drain_replies();
        }
        assert!(events_rx.try_recv().is_err());

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.state, ConnectionState::NotResponding);
        check.await.unwrap();
    }
}
