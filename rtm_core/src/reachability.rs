//! Connectivity observation, independent of the transfer coordinators.
//!
//! A spawned monitor samples a [`ConnectivityProbe`] on a fixed interval and
//! emits changes as an event stream: `Start` once with the first sample,
//! then `UpdateStatus` / `UpdateInterfaceType` only when the respective
//! field actually changed.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One observation of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSample {
    pub connected: bool,
    pub cellular: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityEvent {
    Start { connected: bool, cellular: bool },
    UpdateStatus { connected: bool },
    UpdateInterfaceType { cellular: bool },
}

/// Source of connectivity samples.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync + 'static {
    async fn sample(&self) -> LinkSample;
}

/// Probes connectivity by attempting TCP connects to well-known endpoints.
/// Reports `connected` on the first successful connect; this probe cannot
/// tell interface types apart, so `cellular` is always `false`.
pub struct TcpProbe {
    endpoints: Vec<SocketAddr>,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(endpoints: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self { endpoints, timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            endpoints: vec![
                SocketAddr::from(([1, 1, 1, 1], 53)),
                SocketAddr::from(([8, 8, 8, 8], 53)),
            ],
            timeout: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn sample(&self) -> LinkSample {
        for endpoint in &self.endpoints {
            let attempt = tokio::time::timeout(self.timeout, TcpStream::connect(endpoint)).await;
            if matches!(attempt, Ok(Ok(_))) {
                return LinkSample {
                    connected: true,
                    cellular: false,
                };
            }
        }
        LinkSample {
            connected: false,
            cellular: false,
        }
    }
}

/// Receiving end of the observer's event stream. Ends when the observer is
/// stopped.
#[derive(Debug)]
pub struct ReachabilityStream {
    rx: mpsc::Receiver<ReachabilityEvent>,
}

impl ReachabilityStream {
    pub async fn recv(&mut self) -> Option<ReachabilityEvent> {
        self.rx.recv().await
    }
}

impl Stream for ReachabilityStream {
    type Item = ReachabilityEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Single-shot connectivity monitor: `start` spawns the sampling loop,
/// `stop` cancels it for good.
pub struct ReachabilityObserver {
    cancel: CancellationToken,
}

impl ReachabilityObserver {
    pub fn start(
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
    ) -> (Self, ReachabilityStream) {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let monitor_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut last: Option<LinkSample> = None;
            loop {
                if monitor_cancel.is_cancelled() {
                    return;
                }
                let sample = tokio::select! {
                    _ = monitor_cancel.cancelled() => return,
                    sample = probe.sample() => sample,
                };
                match last {
                    None => {
                        let event = ReachabilityEvent::Start {
                            connected: sample.connected,
                            cellular: sample.cellular,
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Some(previous) => {
                        if previous.connected != sample.connected {
                            let event = ReachabilityEvent::UpdateStatus {
                                connected: sample.connected,
                            };
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        if previous.cellular != sample.cellular {
                            let event = ReachabilityEvent::UpdateInterfaceType {
                                cellular: sample.cellular,
                            };
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                last = Some(sample);
                tokio::select! {
                    _ = monitor_cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        (Self { cancel }, ReachabilityStream { rx })
    }

    /// Cancels the monitor. The observer cannot be restarted.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Replays a scripted sequence of samples, repeating the last one.
    struct ScriptedProbe {
        samples: StdMutex<Vec<LinkSample>>,
    }

    impl ScriptedProbe {
        fn new(mut samples: Vec<LinkSample>) -> Self {
            samples.reverse();
            Self {
                samples: StdMutex::new(samples),
            }
        }
    }

    #[async_trait]
    impl ConnectivityProbe for ScriptedProbe {
        async fn sample(&self) -> LinkSample {
            let mut samples = self.samples.lock().unwrap();
            if samples.len() > 1 {
                samples.pop().unwrap()
            } else {
                samples[0]
            }
        }
    }

    fn sample(connected: bool, cellular: bool) -> LinkSample {
        LinkSample {
            connected,
            cellular,
        }
    }

    #[tokio::test]
    async fn emits_start_once_then_only_changes() {
        let probe = Arc::new(ScriptedProbe::new(vec![
            sample(true, false),
            sample(true, false), // no change, no event
            sample(false, false),
            sample(false, true),
        ]));
        let (observer, mut stream) =
            ReachabilityObserver::start(probe, Duration::from_millis(1));

        assert_eq!(
            stream.recv().await,
            Some(ReachabilityEvent::Start {
                connected: true,
                cellular: false
            })
        );
        assert_eq!(
            stream.recv().await,
            Some(ReachabilityEvent::UpdateStatus { connected: false })
        );
        assert_eq!(
            stream.recv().await,
            Some(ReachabilityEvent::UpdateInterfaceType { cellular: true })
        );

        observer.stop();
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn stop_ends_the_stream_while_the_monitor_is_idle() {
        let probe = Arc::new(ScriptedProbe::new(vec![sample(true, false)]));
        let (observer, mut stream) =
            ReachabilityObserver::start(probe, Duration::from_secs(3600));
        // Let the first event through, then cancel mid-sleep.
        let first = stream.recv().await;
        assert!(matches!(first, Some(ReachabilityEvent::Start { .. })));
        observer.stop();
        assert_eq!(stream.recv().await, None);
    }
}
