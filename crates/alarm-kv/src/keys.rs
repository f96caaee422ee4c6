//! Key schema. Every key the pipeline reads or writes is built here so
//! other services sharing the same Redis see identical names.

use alarm_core::Level;

pub const PREFIX: &str = "bkmonitor";

pub const ACCESS_PRIORITY_TTL_SECS: u64 = 10 * 60;
pub const TOKEN_TTL_SECS: u64 = 10 * 60;
pub const MD5_TO_DIM_TTL_SECS: u64 = 24 * 60 * 60;
pub const DETECT_HISTORY_TTL_SECS: u64 = 8 * 24 * 60 * 60;
pub const SUBSCRIBE_TTL_SECS: u64 = 24 * 60 * 60;

/// Sentinel dimension: newest point seen for the item, whatever its dimensions.
pub const LATEST_POINT_WITH_ALL_KEY: &str = "__latest_point_with_all__";
/// Sentinel dimension: cursor of the no-data sweeper.
pub const LATEST_NO_DATA_CHECK_POINT: &str = "__latest_no_data_check_point__";

pub const CACHE_ROUTER: &str = "bkmonitor.CACHE_ROUTER";
pub const CACHE_NODE: &str = "bkmonitor.CACHE_NODE";
/// Hash of `strategy_id -> strategy json`, maintained by the config service.
pub const STRATEGY: &str = "bkmonitor.STRATEGY";
/// Hash of `subscription_id -> subscription json`, the subscribe refresh input.
pub const NOTICE_SUBSCRIBE: &str = "bkmonitor.NOTICE_SUBSCRIBE";

pub fn access_priority(priority_group_key: &str) -> String {
    format!("{PREFIX}.ACCESS_PRIORITY.{priority_group_key}")
}

pub fn access_duplicate(group: &str, timestamp: i64) -> String {
    format!("{PREFIX}.ACCESS_DUPLICATE.{group}.{timestamp}")
}

pub fn check_result(strategy_id: u64, item_id: u64, dimensions_md5: &str, level: Level) -> String {
    format!(
        "{PREFIX}.CHECK_RESULT.{strategy_id}.{item_id}.{dimensions_md5}.{}",
        level.as_u8()
    )
}

/// Glob over check-result keys, optionally limited to one strategy.
pub fn check_result_pattern(strategy_id: Option<u64>) -> String {
    match strategy_id {
        Some(sid) => format!("{PREFIX}.CHECK_RESULT.{sid}.*"),
        None => format!("{PREFIX}.CHECK_RESULT.*"),
    }
}

pub fn last_checkpoints(strategy_id: u64, item_id: u64) -> String {
    format!("{PREFIX}.LAST_CHECKPOINTS.{strategy_id}.{item_id}")
}

/// Field inside the last-checkpoints hash.
pub fn checkpoint_field(dimensions_md5: &str, level: Level) -> String {
    format!("{dimensions_md5}|{}", level.as_u8())
}

pub fn md5_to_dim(service: &str, strategy_id: u64, item_id: u64) -> String {
    format!("{PREFIX}.MD5_TO_DIM.{service}.{strategy_id}.{item_id}")
}

pub fn md5_to_dim_pattern(service: &str) -> String {
    format!("{PREFIX}.MD5_TO_DIM.{service}.*")
}

/// `(strategy_id, item_id)` of a dimension-map key of `service`.
pub fn parse_md5_to_dim(service: &str, key: &str) -> Option<(u64, u64)> {
    let rest = key.strip_prefix(&format!("{PREFIX}.MD5_TO_DIM.{service}."))?;
    let (strategy_id, item_id) = rest.split_once('.')?;
    Some((strategy_id.parse().ok()?, item_id.parse().ok()?))
}

pub fn token(query_md5: &str) -> String {
    format!("{PREFIX}.TOKEN.{query_md5}")
}

pub fn token_pattern() -> String {
    format!("{PREFIX}.TOKEN.*")
}

pub fn subscribe_biz(bk_biz_id: i64) -> String {
    format!("{PREFIX}.SUBSCRIBE.biz_{bk_biz_id}")
}

pub fn subscribe_user(bk_biz_id: i64, username: &str) -> String {
    format!("{PREFIX}.SUBSCRIBE.user_{bk_biz_id}_{username}")
}

pub fn subscribe_pattern() -> String {
    format!("{PREFIX}.SUBSCRIBE.*")
}

pub fn detect_history(strategy_id: u64, item_id: u64, dimensions_md5: &str) -> String {
    format!("{PREFIX}.DETECT_HISTORY.{strategy_id}.{item_id}.{dimensions_md5}")
}

/// Hash of `host key -> json list of "bk_obj_id|bk_inst_id"` per business.
pub fn topology(bk_biz_id: i64) -> String {
    format!("{PREFIX}.TOPO.biz_{bk_biz_id}")
}

/// Hash of `group_id -> json list of target strings` per business.
pub fn dynamic_group(bk_biz_id: i64) -> String {
    format!("{PREFIX}.DYNAMIC_GROUP.biz_{bk_biz_id}")
}

/// Parsed form of a check-result key.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResultKey {
    pub strategy_id: u64,
    pub item_id: u64,
    pub dimensions_md5: String,
    pub level: Level,
}

impl CheckResultKey {
    pub fn new(strategy_id: u64, item_id: u64, dimensions_md5: &str, level: Level) -> Self {
        Self {
            strategy_id,
            item_id,
            dimensions_md5: dimensions_md5.to_string(),
            level,
        }
    }

    pub fn key(&self) -> String {
        check_result(self.strategy_id, self.item_id, &self.dimensions_md5, self.level)
    }

    pub fn checkpoint_field(&self) -> String {
        checkpoint_field(&self.dimensions_md5, self.level)
    }
}

pub fn parse_check_result(key: &str) -> Option<CheckResultKey> {
    let rest = key.strip_prefix(&format!("{PREFIX}.CHECK_RESULT."))?;
    let mut parts = rest.splitn(3, '.');
    let strategy_id = parts.next()?.parse().ok()?;
    let item_id = parts.next()?.parse().ok()?;
    let tail = parts.next()?;
    let (dimensions_md5, level) = tail.rsplit_once('.')?;
    let level = Level::try_from(level.parse::<u8>().ok()?).ok()?;
    Some(CheckResultKey {
        strategy_id,
        item_id,
        dimensions_md5: dimensions_md5.to_string(),
        level,
    })
}

pub fn parse_token(key: &str) -> Option<&str> {
    key.strip_prefix(&format!("{PREFIX}.TOKEN."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_schema_is_exact() {
        assert_eq!(access_priority("g1"), "bkmonitor.ACCESS_PRIORITY.g1");
        assert_eq!(
            check_result(1, 2, "d", Level::Reminder),
            "bkmonitor.CHECK_RESULT.1.2.d.3"
        );
        assert_eq!(last_checkpoints(1, 2), "bkmonitor.LAST_CHECKPOINTS.1.2");
        assert_eq!(md5_to_dim("detect", 1, 2), "bkmonitor.MD5_TO_DIM.detect.1.2");
        assert_eq!(token("qm1"), "bkmonitor.TOKEN.qm1");
        assert_eq!(subscribe_biz(2), "bkmonitor.SUBSCRIBE.biz_2");
        assert_eq!(subscribe_user(2, "alice"), "bkmonitor.SUBSCRIBE.user_2_alice");
        assert_eq!(checkpoint_field("d", Level::Fatal), "d|1");
    }

    #[test]
    fn check_result_key_parses_back() {
        let key = check_result(42, 7, "abc", Level::Warning);
        let parsed = parse_check_result(&key).unwrap();
        assert_eq!(parsed.strategy_id, 42);
        assert_eq!(parsed.item_id, 7);
        assert_eq!(parsed.dimensions_md5, "abc");
        assert_eq!(parsed.level, Level::Warning);

        assert!(parse_check_result("bkmonitor.CHECK_RESULT.x.7.abc.2").is_none());
        assert!(parse_check_result("bkmonitor.TOKEN.qm1").is_none());
    }

    #[test]
    fn dimension_map_key_parses_back() {
        let key = md5_to_dim("detect", 3, 31);
        assert_eq!(parse_md5_to_dim("detect", &key), Some((3, 31)));
        assert_eq!(parse_md5_to_dim("nodata", &key), None);
        assert_eq!(md5_to_dim_pattern("detect"), "bkmonitor.MD5_TO_DIM.detect.*");
    }

    #[test]
    fn token_key_parses_back() {
        assert_eq!(parse_token("bkmonitor.TOKEN.qm1"), Some("qm1"));
        assert_eq!(parse_token("bkmonitor.CHECK_RESULT.1"), None);
    }
}
