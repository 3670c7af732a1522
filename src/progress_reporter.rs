use std::time::Duration;

use circular_buffer::CircularBuffer;
use indicatif::{MultiProgress, ProgressBar, ProgressState, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::types::ByteCount;

const SPEED_UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// Consumes per-chunk byte counts and drives the progress display: a bar
/// when the total is known, a spinner otherwise. Instantaneous speed is
/// computed over a sliding window of recent samples so a single slow chunk
/// doesn't crater the reading; the average over the whole transfer is shown
/// on finish.
pub(crate) fn spawn_progress_reporter(
    total_size: Option<ByteCount>,
    mut rx_progress: mpsc::Receiver<ByteCount>,
    multi: MultiProgress,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pb = total_size.map_or_else(ProgressBar::new_spinner, ProgressBar::new);
        let pb = multi.add(pb);
        pb.set_style(ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta}) ({msg})")
            .unwrap()
            .with_key("eta", |state: &ProgressState, w: &mut dyn std::fmt::Write| write!(w, "{:.1}s", state.eta().as_secs_f64()).unwrap())
            .progress_chars("#>-"));

        let mut window = CircularBuffer::<64, (ByteCount, Instant)>::new();
        let mut received: ByteCount = 0;
        let mut last_refresh = Instant::now();

        while let Some(chunk_size) = rx_progress.recv().await {
            received += chunk_size;
            pb.set_position(received);
            window.push_back((received, Instant::now()));

            if last_refresh.elapsed() < SPEED_UPDATE_INTERVAL {
                continue;
            }
            last_refresh = Instant::now();
            if let (Some(&(oldest, oldest_at)), Some(&(latest, latest_at))) =
                (window.front(), window.back())
            {
                if latest > oldest {
                    let speed = (latest - oldest) as f64
                        / latest_at.duration_since(oldest_at).as_secs_f64();
                    pb.set_message(format_speed(speed));
                }
            }
        }

        let average = received as f64 / pb.elapsed().as_secs_f64().max(f64::EPSILON);
        pb.finish_with_message(format!("avg {}", format_speed(average)));
    })
}

pub(crate) fn format_speed(bytes_per_sec: f64) -> String {
    const MB: f64 = 1024.0 * 1024.0;
    if bytes_per_sec >= MB {
        format!("{:.1} MB/s", bytes_per_sec / MB)
    } else if bytes_per_sec >= 1024.0 {
        format!("{:.1} kB/s", bytes_per_sec / 1024.0)
    } else {
        format!("{bytes_per_sec:.0} B/s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_formatting_picks_sane_units() {
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(8.5 * 1024.0), "8.5 kB/s");
        assert_eq!(format_speed(3.0 * 1024.0 * 1024.0), "3.0 MB/s");
    }

    #[tokio::test]
    async fn reporter_drains_channel_and_finishes() {
        let (tx, rx) = mpsc::channel(8);
        let multi =
            MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden());
        let handle = spawn_progress_reporter(Some(100), rx, multi);
        for _ in 0..4 {
            tx.send(25).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();
    }
}
