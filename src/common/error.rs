use thiserror::Error;

/// 路由核心错误分类。
///
/// Per-connection errors terminate only that connection's task;
/// configuration errors abort the reload and keep the previous snapshot.
#[derive(Error, Debug)]
pub enum RouteError {
    #[error("metadata invalid: neither host nor destination address is set")]
    InvalidMetadata,

    #[error("resolve {host} failed: {reason}")]
    ResolveFailure { host: String, reason: String },

    #[error("no alive proxy in group '{0}'")]
    NoAliveProxy(String),

    #[error("dial via '{proxy}' failed: {reason}")]
    DialFailure { proxy: String, reason: String },

    #[error("health check timed out")]
    HealthCheckTimeout,

    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("cycle detected among proxy groups: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    #[error("invalid rule '{rule}': {reason}")]
    RuleParse { rule: String, reason: String },
}

impl RouteError {
    /// 配置期错误（中止加载，保留旧配置）
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            RouteError::CycleDetected(_) | RouteError::RuleParse { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_lists_groups() {
        let err = RouteError::CycleDetected(vec!["A".to_string(), "B".to_string()]);
        assert_eq!(
            err.to_string(),
            "cycle detected among proxy groups: A, B"
        );
        assert!(err.is_config_error());
    }

    #[test]
    fn rule_parse_error_names_rule() {
        let err = RouteError::RuleParse {
            rule: "BOGUS,foo,DIRECT".to_string(),
            reason: "unknown rule type".to_string(),
        };
        assert!(err.to_string().contains("BOGUS,foo,DIRECT"));
        assert!(err.is_config_error());
    }

    #[test]
    fn connection_errors_are_not_config_errors() {
        assert!(!RouteError::InvalidMetadata.is_config_error());
        assert!(!RouteError::HealthCheckTimeout.is_config_error());
    }
}
