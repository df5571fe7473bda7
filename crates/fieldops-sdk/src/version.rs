//! SDK 版本与运行时元信息
//!
//! - **SDK Version** → Cargo.toml
//! - **Migration Version** → migrations 文件（文件即版本，由 refinery 管理）

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（由 vergen 在 build.rs 中生成）
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");

/// build time（由 vergen 在 build.rs 中生成）
pub const BUILD_TIME: &str = env!("VERGEN_BUILD_TIMESTAMP");

/// 路线历史库支持的最高 migration 版本，由 build.rs 扫描 migrations/ 生成。
/// 启动时若 DB 版本高于此值则拒绝打开。
pub const SDK_DB_VERSION: i64 = parse_db_version(env!("SDK_DB_VERSION"));

/// 发往服务端的 User-Agent
pub fn user_agent() -> String {
    format!("fieldops-sdk/{}", SDK_VERSION)
}

const fn parse_db_version(s: &str) -> i64 {
    let b = s.as_bytes();
    let mut v = 0i64;
    let mut i = 0usize;
    while i < b.len() {
        if b[i] >= b'0' && b[i] <= b'9' {
            v = v * 10 + (b[i] - b'0') as i64;
        }
        i += 1;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_carries_version() {
        assert!(user_agent().starts_with("fieldops-sdk/"));
        assert!(user_agent().ends_with(SDK_VERSION));
        assert!(SDK_DB_VERSION >= 1);
    }
}
