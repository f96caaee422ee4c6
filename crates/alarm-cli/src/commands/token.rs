use std::collections::BTreeSet;
use std::io::Write;

use alarm_access::{TokenBucket, TokenEntry};
use alarm_strategy::StrategySnapshot;

/// Which counters `token list` shows.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenFilter {
    pub bk_biz_id: Option<i64>,
    /// Include counters that still have tokens left.
    pub all: bool,
}

pub async fn list(
    bucket: &TokenBucket,
    snapshot: &StrategySnapshot,
    filter: TokenFilter,
    out: &mut impl Write,
) -> anyhow::Result<Vec<TokenEntry>> {
    let mut shown = Vec::new();
    for entry in bucket.list().await? {
        if !filter.all && !entry.is_exhausted() {
            continue;
        }
        let owners: Vec<_> = snapshot.by_query_md5(&entry.query_md5).collect();
        if let Some(biz) = filter.bk_biz_id {
            if !owners.iter().any(|r| r.strategy.bk_biz_id == biz) {
                continue;
            }
        }
        let strategies: BTreeSet<u64> = owners.iter().map(|r| r.strategy.id).collect();
        let strategies = strategies
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let ttl = entry.ttl.map_or_else(|| "-".to_string(), |t| format!("{t}s"));
        writeln!(
            out,
            "{}\tremaining={}\tttl={}\tstrategies={}",
            entry.query_md5,
            entry.remaining,
            ttl,
            if strategies.is_empty() { "-" } else { &strategies },
        )?;
        shown.push(entry);
    }
    if shown.is_empty() {
        writeln!(out, "no matching token counters")?;
    }
    Ok(shown)
}
