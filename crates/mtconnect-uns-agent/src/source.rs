//! Observation feeds.

use mtconnect_uns_core::Observation;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// One line of a JSON feed: a single observation or a batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedLine {
    One(Observation),
    Batch(Vec<Observation>),
}

/// Parse one line of newline-delimited JSON.
///
/// Blank lines yield no observations.
///
/// # Errors
///
/// Returns error if the line is neither an observation nor an array of them.
pub fn parse_line(line: &str) -> Result<Vec<Observation>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }

    Ok(match serde_json::from_str(line)? {
        FeedLine::One(observation) => vec![observation],
        FeedLine::Batch(observations) => observations,
    })
}

/// Read newline-delimited JSON observations from `reader`.
///
/// Returns a channel receiver for parsed observations. Lines that fail to
/// parse are logged and skipped; the channel closes at end of input.
pub fn spawn_json_lines<R>(reader: R, capacity: usize) -> mpsc::Receiver<Observation>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut line_number = 0_u64;

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read observation feed");
                    break;
                }
            };
            line_number += 1;

            let observations = match parse_line(&line) {
                Ok(observations) => observations,
                Err(err) => {
                    tracing::warn!(line_number, error = %err, "Skipping malformed observation");
                    continue;
                }
            };

            for observation in observations {
                if tx.send(observation).await.is_err() {
                    tracing::warn!("Observation receiver dropped, stopping feed");
                    return;
                }
            }
        }

        tracing::debug!(lines = line_number, "Observation feed ended");
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_and_batch_lines() {
        let one = parse_line(
            r#"{"deviceUuid":"D1","dataItemId":"X","timestamp":"2024-03-01T00:00:00Z","value":1}"#,
        )
        .unwrap();
        assert_eq!(one.len(), 1);

        let batch = parse_line(
            r#"[{"deviceUuid":"D1","dataItemId":"X","timestamp":"2024-03-01T00:00:00Z","value":1},
                {"deviceUuid":"D1","dataItemId":"Y","timestamp":"2024-03-01T00:00:00Z","value":"ON"}]"#,
        )
        .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].data_item_id, "Y");

        assert!(parse_line("   ").unwrap().is_empty());
        assert!(parse_line("{not json").is_err());
        assert!(parse_line(r#"{"deviceUuid":"D1"}"#).is_err());
    }

    #[tokio::test]
    async fn feed_skips_bad_lines_and_closes_at_eof() {
        let input: &'static [u8] = b"{\"deviceUuid\":\"D1\",\"dataItemId\":\"X\",\"timestamp\":\"2024-03-01T00:00:00Z\",\"value\":1}\n\
garbage\n\
\n\
{\"deviceUuid\":\"D1\",\"dataItemId\":\"X\",\"timestamp\":\"2024-03-01T00:00:01Z\",\"value\":2}\n";

        let mut feed = spawn_json_lines(input, 4);

        let mut values = Vec::new();
        while let Some(observation) = feed.recv().await {
            values.push(observation.value);
        }

        assert_eq!(values, vec![serde_json::json!(1), serde_json::json!(2)]);
    }
}
