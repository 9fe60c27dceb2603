//! Purpose: Periodically forward node status snapshots to an upstream collector.
//! Exports: `ReportConfig`, `report_once`, `run_reporter`.
//! Role: Background task started by the node server when reporting is configured.
//! Invariants: A failed report is logged and skipped; it never stops the node.
//! Invariants: Reports carry the snapshot only; the reporting token goes in a header.

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

use crate::api::{Error, ErrorKind, Node};

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct ReportConfig {
    pub url: Url,
    pub token: Option<String>,
    pub interval: Duration,
}

impl ReportConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            token: None,
            interval: DEFAULT_REPORT_INTERVAL,
        }
    }
}

/// POST one snapshot to the collector. Any non-2xx answer is a transport error.
pub fn report_once(node: &Node, config: &ReportConfig, access: &str) -> Result<(), Error> {
    let snapshot = node.status(access);
    let body = serde_json::to_string(&snapshot).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode status snapshot")
            .with_source(err)
    })?;
    let mut request = ureq::post(config.url.as_str())
        .timeout(Duration::from_secs(10))
        .set("Content-Type", "application/json");
    if let Some(token) = &config.token {
        request = request.set("Authorization", &format!("Bearer {token}"));
    }
    match request.send_string(&body) {
        Ok(response) if (200..300).contains(&response.status()) => Ok(()),
        Ok(response) => Err(Error::new(ErrorKind::Transport)
            .with_message(format!("status report answered {}", response.status()))),
        Err(ureq::Error::Status(code, _)) => Err(Error::new(ErrorKind::Transport)
            .with_message(format!("status report rejected with status {code}"))),
        Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Transport)
            .with_message("status report failed")
            .with_source(err)),
    }
}

pub async fn run_reporter(
    node: Node,
    config: ReportConfig,
    access: String,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let node = node.clone();
                let config = config.clone();
                let access = access.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || report_once(&node, &config, &access)).await;
                match outcome {
                    Ok(Ok(())) => debug!("status reported"),
                    Ok(Err(err)) => warn!(error = %err, "status report failed; skipping"),
                    Err(err) => warn!(error = %err, "status report task failed; skipping"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ReportConfig, report_once, run_reporter};
    use crate::api::{ErrorKind, FunctionTable, Node, NodeConfig};
    use std::time::Duration;

    #[test]
    fn unreachable_collector_is_transport_error() {
        let node = Node::new(NodeConfig::default(), FunctionTable::new());
        let config = ReportConfig::new(url::Url::parse("http://127.0.0.1:9/report").expect("url"));
        let err = report_once(&node, &config, "read_write").expect_err("unreachable");
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn reporter_survives_failures_and_stops_on_shutdown() {
        let node = Node::new(NodeConfig::default(), FunctionTable::new());
        let mut config =
            ReportConfig::new(url::Url::parse("http://127.0.0.1:9/report").expect("url"));
        config.interval = Duration::from_millis(10);
        let (stop, rx) = tokio::sync::oneshot::channel();
        let task = tokio::spawn(run_reporter(node, config, "read_write".to_string(), rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.send(()).expect("send stop");
        tokio::time::timeout(Duration::from_secs(15), task)
            .await
            .expect("reporter stopped")
            .expect("join");
    }
}
