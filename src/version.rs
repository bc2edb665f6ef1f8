//! 构建信息端点：暴露 shadow-rs 采集的版本与构建环境。

use axum::response::Json as JsonResponse;
use serde::Serialize;

use crate::error::ApiError;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    version: &'static str,
    commit: &'static str,
    build_time: &'static str,
    build_env: String,
}

impl VersionInfo {
    fn current() -> Self {
        Self {
            version: crate::build::PKG_VERSION,
            commit: crate::build::SHORT_COMMIT,
            build_time: crate::build::BUILD_TIME,
            build_env: format!(
                "{},{}",
                crate::build::RUST_VERSION,
                crate::build::RUST_CHANNEL
            ),
        }
    }
}

/// 返回当前版本信息。
pub async fn get_version_info() -> Result<JsonResponse<VersionInfo>, ApiError> {
    Ok(JsonResponse(VersionInfo::current()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn version_payload_carries_build_fields() {
        let JsonResponse(info) = get_version_info()
            .await
            .unwrap_or_else(|_| panic!("version endpoint failed"));
        assert!(!info.version.is_empty());
        assert!(info.build_env.contains(','));
    }
}
