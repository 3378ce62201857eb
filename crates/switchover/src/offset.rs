use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use std::time::Duration;

const SAMPLES: usize = 10;

// One reading of the database clock.
#[derive(Debug, Clone, Copy)]
struct Sample {
    sent_at: DateTime<Utc>,
    round_trip: Duration,
    db_time: DateTime<Utc>,
}

impl Sample {
    // The database's clock reading is assumed to be taken halfway through the round trip.
    fn offset(&self) -> chrono::Duration {
        let half = chrono::Duration::from_std(self.round_trip / 2)
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.db_time - (self.sent_at + half)
    }
}

/// Measure the offset of the database clock relative to the local clock,
/// such that `local + offset = database`.
///
/// Several samples are taken and the one with the shortest round trip is
/// used, as it bounds the measurement error most tightly.
#[tracing::instrument(skip_all)]
pub async fn calc_db_offset(conn: &mut PgConnection) -> anyhow::Result<chrono::Duration> {
    let mut samples = Vec::with_capacity(SAMPLES);

    for _ in 0..SAMPLES {
        let sent_at = Utc::now();
        let started = std::time::Instant::now();

        let db_time: DateTime<Utc> = sqlx::query_scalar("select clock_timestamp()")
            .fetch_one(&mut *conn)
            .await
            .context("querying database clock")?;

        samples.push(Sample {
            sent_at,
            round_trip: started.elapsed(),
            db_time,
        });
    }

    let sample = best_sample(&samples).context("no clock samples")?;
    let offset = sample.offset();
    tracing::info!(
        offset_ms = offset.num_milliseconds(),
        round_trip = ?sample.round_trip,
        "measured database clock offset"
    );
    Ok(offset)
}

fn best_sample(samples: &[Sample]) -> Option<Sample> {
    samples.iter().min_by_key(|s| s.round_trip).copied()
}
