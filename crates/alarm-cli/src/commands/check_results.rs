use std::io::Write;

use alarm_detect::{CheckResultStore, TrimStats};

/// Apply the size and age bounds to stored check results.
pub async fn trim(
    store: &CheckResultStore,
    strategy_id: Option<u64>,
    now: i64,
    out: &mut impl Write,
) -> anyhow::Result<TrimStats> {
    let stats = store.trim_all(strategy_id, now).await?;
    writeln!(
        out,
        "trimmed {} member(s) across {} key(s) (max {} points, ttl {}s)",
        stats.removed,
        stats.keys,
        store.max_points(),
        store.ttl_secs()
    )?;
    Ok(stats)
}
