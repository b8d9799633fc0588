//! Refresh cadence of the dashboard loop under paused time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use valkit_core::dashboard::{App, DashboardOptions, DashboardSnapshot, Program, Screen, SnapshotSource, Terminal};
use valkit_core::metrics::MetricsSnapshot;
use valkit_core::ringbuf::SharedRingBuffer;
use valkit_core::Result;

/// Answers each fetch with the next catching-up flag and cancels the loop
/// once the script runs out.
struct SyncScript {
    catching_up: Vec<bool>,
    fetched_at: Mutex<Vec<Instant>>,
    cancel: CancellationToken,
}

#[async_trait]
impl SnapshotSource for SyncScript {
    async fn fetch(&self) -> Result<DashboardSnapshot> {
        let n = {
            let mut fetched = self.fetched_at.lock();
            fetched.push(Instant::now());
            fetched.len()
        };
        if n >= self.catching_up.len() {
            self.cancel.cancel();
        }
        let mut metrics = MetricsSnapshot::default();
        metrics.node.rpc_listening = true;
        metrics.chain.catching_up = self.catching_up[(n - 1).min(self.catching_up.len() - 1)];
        Ok(DashboardSnapshot {
            metrics,
            ..DashboardSnapshot::default()
        })
    }

    async fn rewards(&self, _operator: &str) -> Result<String> {
        Ok(String::new())
    }
}

struct CountingTerminal;

impl Terminal for CountingTerminal {
    fn size(&self) -> Result<(u16, u16)> {
        Ok((100, 30))
    }

    fn draw(&mut self, screen: &Screen) -> Result<()> {
        assert!(screen.to_text().lines().count() <= 30);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn cadence_follows_sync_state_both_ways() {
    let cancel = CancellationToken::new();
    let script = Arc::new(SyncScript {
        catching_up: vec![true, true, false, false, true, true, true],
        fetched_at: Mutex::new(Vec::new()),
        cancel: cancel.clone(),
    });
    let options = DashboardOptions::default();
    assert_eq!(options.refresh_catching_up, Duration::from_secs(1));
    assert_eq!(options.refresh_in_sync, Duration::from_secs(5));

    let start = Instant::now();
    let app = Program::new(
        App::new(options, SharedRingBuffer::new(10)),
        script.clone(),
        CountingTerminal,
    )
    .run(cancel)
    .await
    .unwrap();

    let offsets: Vec<u64> = script
        .fetched_at
        .lock()
        .iter()
        .map(|t| (*t - start).as_secs())
        .collect();
    // Catching up polls every second, in sync every five, and falling behind
    // again switches back straight away.
    assert_eq!(offsets, vec![0, 1, 2, 7, 12, 13, 14]);
    assert_eq!(app.refresh_interval(), Duration::from_secs(1));
}
