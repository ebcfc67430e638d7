use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tally_metrics::{DisabledSubMetrics, MetricBatch};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::services::backend::{Backend, BackendError, LineFormat};

/// Writes batches as graphite lines to stdout or appends them to a file.
///
/// Events are written as one JSON object per line, prefixed with `event`.
#[derive(Debug)]
pub struct StdoutBackend {
    path: Option<PathBuf>,
    format: Arc<LineFormat>,
}

impl StdoutBackend {
    /// Creates a backend writing to `path`, or to stdout if no path is given.
    pub fn new(path: Option<PathBuf>, disabled: DisabledSubMetrics) -> Self {
        Self {
            path,
            format: Arc::new(LineFormat::default().with_disabled(disabled)),
        }
    }
}

fn render(format: &LineFormat, batch: &MetricBatch) -> Result<String, BackendError> {
    let mut output = format.render(batch);
    for event in &batch.events {
        output.push_str("event ");
        output.push_str(&serde_json::to_string(event)?);
        output.push('\n');
    }
    Ok(output)
}

async fn write_all<W>(mut writer: W, output: &str) -> Result<(), BackendError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(output.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

impl Backend for StdoutBackend {
    fn name(&self) -> &'static str {
        "stdout"
    }

    fn send(&self, batch: Arc<MetricBatch>) -> BoxFuture<'static, Result<(), BackendError>> {
        let path = self.path.clone();
        let format = self.format.clone();

        async move {
            let output = render(&format, &batch)?;
            if output.is_empty() {
                return Ok(());
            }

            match path {
                Some(path) => {
                    let file = tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .await?;
                    write_all(file, &output).await
                }
                None => write_all(tokio::io::stdout(), &output).await,
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tally_metrics::{AlertType, Event, FlushedGauge, FlushedTimer, Tags, TimerSummary};

    use super::*;

    #[tokio::test]
    async fn test_append_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.txt");

        let mut event = Event::new("deploy", "new release");
        event.alert_type = AlertType::Success;

        let batch = Arc::new(MetricBatch {
            timestamp: 10,
            gauges: vec![FlushedGauge {
                name: "queue.size".to_owned(),
                tags: Tags::new(),
                value: 4.0,
            }],
            events: vec![event],
            ..Default::default()
        });

        let backend = StdoutBackend::new(Some(path.clone()), DisabledSubMetrics::default());
        backend.send(batch.clone()).await.unwrap();
        backend.send(batch).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        insta::assert_snapshot!(contents, @r#"
        stats.gauges.queue.size 4 10
        event {"title":"deploy","text":"new release","priority":"normal","alert_type":"success","tags":[]}
        stats.gauges.queue.size 4 10
        event {"title":"deploy","text":"new release","priority":"normal","alert_type":"success","tags":[]}
        "#);
    }

    #[tokio::test]
    async fn test_disabled_sub_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.txt");

        let summary =
            TimerSummary::compute(vec![2.0, 4.0], 2.0, &[], Duration::from_secs(1)).unwrap();
        let batch = Arc::new(MetricBatch {
            timestamp: 10,
            timers: vec![FlushedTimer {
                name: "latency".to_owned(),
                tags: Tags::new(),
                summary,
            }],
            ..Default::default()
        });

        let disabled = DisabledSubMetrics {
            lower: true,
            upper: true,
            count_per_second: true,
            median: true,
            std: true,
            sum_squares: true,
            ..Default::default()
        };
        let backend = StdoutBackend::new(Some(path.clone()), disabled);
        backend.send(batch).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        insta::assert_snapshot!(contents, @r"
        stats.timers.latency.count 2 10
        stats.timers.latency.mean 3 10
        stats.timers.latency.sum 6 10
        ");
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let backend = StdoutBackend::new(None, DisabledSubMetrics::default());
        backend.send(Arc::default()).await.unwrap();
    }
}
