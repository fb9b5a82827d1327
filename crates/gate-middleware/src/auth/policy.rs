use arc_swap::ArcSwap;
use gate_core::{retry, EndpointProtectionRule, PolicySource, Result, RetryPolicy};
use metrics::{gauge, increment_counter};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::path_matcher;

/// 某个 (method, path) 的授权判定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// 公开端点，跳过权限检查
    Public,
    /// 需要登录并持有该权限
    RequiresPermission(String),
    /// 受保护但未配置权限码：只要求登录
    RequiresAuthentication,
    /// 没有任何规则匹配（拒绝）
    NoMatch,
}

/// 不可变的规则快照
#[derive(Debug)]
pub struct PolicySnapshot {
    version: u64,
    rules: Vec<EndpointProtectionRule>,
}

impl PolicySnapshot {
    pub fn new(version: u64, rules: Vec<EndpointProtectionRule>) -> Self {
        Self { version, rules }
    }

    /// 版本 0：启动时的空快照，拒绝一切
    pub fn empty() -> Self {
        Self::new(0, Vec::new())
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn rules(&self) -> &[EndpointProtectionRule] {
        &self.rules
    }

    /// 优先级最高的匹配规则；同优先级时先插入的规则胜出
    pub fn winning_rule(&self, method: &str, path: &str) -> Option<(usize, &EndpointProtectionRule)> {
        let mut winner: Option<(usize, &EndpointProtectionRule)> = None;

        for (index, rule) in self.rules.iter().enumerate() {
            if !rule.active || !rule.method_matches(method) || !path_matcher::matches(&rule.path_pattern, path) {
                continue;
            }
            match winner {
                Some((_, best)) if best.priority >= rule.priority => {}
                _ => winner = Some((index, rule)),
            }
        }
        winner
    }

    pub fn decide(&self, method: &str, path: &str) -> PolicyDecision {
        match self.winning_rule(method, path) {
            None => PolicyDecision::NoMatch,
            Some((_, rule)) if rule.is_public => PolicyDecision::Public,
            Some((_, rule)) => match rule.permission_code.as_deref() {
                Some(code) if !code.is_empty() => PolicyDecision::RequiresPermission(code.to_string()),
                _ => PolicyDecision::RequiresAuthentication,
            },
        }
    }
}

/// 策略缓存：持有当前快照并负责从策略源刷新
///
/// 读路径只做一次原子加载，从不等待网络。
pub struct PolicyCache {
    current: ArcSwap<PolicySnapshot>,
    source: Arc<dyn PolicySource>,
    retry: RetryPolicy,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl PolicyCache {
    pub fn new(source: Arc<dyn PolicySource>, retry: RetryPolicy) -> Self {
        Self {
            current: ArcSwap::from_pointee(PolicySnapshot::empty()),
            source,
            retry,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// 当前快照；调用者在整个请求内持有同一份快照
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.load_full()
    }

    pub fn decide(&self, method: &str, path: &str) -> PolicyDecision {
        self.current.load().decide(method, path)
    }

    /// 原子替换为新规则集，返回新版本号
    pub async fn install(&self, rules: Vec<EndpointProtectionRule>) -> u64 {
        let _guard = self.refresh_lock.lock().await;
        self.swap_locked(rules)
    }

    fn swap_locked(&self, rules: Vec<EndpointProtectionRule>) -> u64 {
        let version = self.current.load().version() + 1;
        let rule_count = rules.len();
        self.current.store(Arc::new(PolicySnapshot::new(version, rules)));

        gauge!("gate_policy_snapshot_version", version as f64);
        gauge!("gate_policy_rules", rule_count as f64);
        info!(version, rules = rule_count, "Policy snapshot installed");
        version
    }

    /// 从策略源拉取并替换快照；失败时保留旧快照
    pub async fn refresh(&self) -> Result<u64> {
        let _guard = self.refresh_lock.lock().await;

        let source = &self.source;
        match retry(&self.retry, "policy.fetch_rules", move || source.fetch_rules()).await {
            Ok(rules) => {
                increment_counter!("gate_policy_refresh_total", "result" => "ok");
                Ok(self.swap_locked(rules))
            }
            Err(e) => {
                increment_counter!("gate_policy_refresh_total", "result" => "error");
                warn!(
                    error = %e,
                    kept_version = self.current.load().version(),
                    "Policy refresh failed, keeping previous snapshot"
                );
                Err(e)
            }
        }
    }

    /// 周期刷新任务；第一次立即执行
    pub fn start_refresh_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;
                match cache.refresh().await {
                    Ok(version) => debug!(version, "Scheduled policy refresh done"),
                    Err(e) => error!(error = %e, "Scheduled policy refresh failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gate_core::GateError;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn scenario_rules() -> Vec<EndpointProtectionRule> {
        vec![
            EndpointProtectionRule::public("GET", "/public/**", 100),
            EndpointProtectionRule::protected("POST", "/orders/**", "ORDER:CREATE", 10),
        ]
    }

    #[test]
    fn test_scenario_decisions() {
        let snapshot = PolicySnapshot::new(1, scenario_rules());

        assert_eq!(snapshot.decide("GET", "/public/info"), PolicyDecision::Public);
        assert_eq!(
            snapshot.decide("POST", "/orders/5"),
            PolicyDecision::RequiresPermission("ORDER:CREATE".to_string())
        );
        // 方法不匹配
        assert_eq!(snapshot.decide("DELETE", "/orders/5"), PolicyDecision::NoMatch);
        assert_eq!(snapshot.decide("GET", "/admin"), PolicyDecision::NoMatch);
    }

    #[test]
    fn test_highest_priority_wins() {
        let snapshot = PolicySnapshot::new(
            1,
            vec![
                EndpointProtectionRule::public("*", "/api/**", 1),
                EndpointProtectionRule::protected("GET", "/api/admin/**", "ADMIN", 50),
                EndpointProtectionRule::public("GET", "/api/admin/ping", 10),
            ],
        );

        assert_eq!(
            snapshot.decide("GET", "/api/admin/ping"),
            PolicyDecision::RequiresPermission("ADMIN".to_string())
        );
        assert_eq!(snapshot.decide("POST", "/api/things"), PolicyDecision::Public);
    }

    #[test]
    fn test_equal_priority_first_inserted_wins() {
        let rules = vec![
            EndpointProtectionRule::protected("GET", "/items/**", "ITEM:READ", 5),
            EndpointProtectionRule::public("GET", "/items/*", 5),
        ];
        let snapshot = PolicySnapshot::new(1, rules.clone());

        for _ in 0..10 {
            let (index, _) = snapshot.winning_rule("GET", "/items/7").unwrap();
            assert_eq!(index, 0);
        }

        let reversed = PolicySnapshot::new(1, rules.into_iter().rev().collect());
        assert_eq!(reversed.decide("GET", "/items/7"), PolicyDecision::Public);
    }

    #[test]
    fn test_inactive_rules_ignored_and_missing_code() {
        let snapshot = PolicySnapshot::new(
            1,
            vec![
                EndpointProtectionRule::public("GET", "/beta/**", 100).inactive(),
                EndpointProtectionRule {
                    permission_code: None,
                    ..EndpointProtectionRule::protected("GET", "/profile", "", 0)
                },
            ],
        );

        assert_eq!(snapshot.decide("GET", "/beta/x"), PolicyDecision::NoMatch);
        assert_eq!(snapshot.decide("GET", "/profile"), PolicyDecision::RequiresAuthentication);
    }

    #[test]
    fn test_empty_snapshot_denies_everything() {
        let snapshot = PolicySnapshot::empty();
        assert_eq!(snapshot.version(), 0);
        assert_eq!(snapshot.decide("GET", "/"), PolicyDecision::NoMatch);
    }

    struct FlakySource {
        fail: AtomicBool,
    }

    #[async_trait]
    impl PolicySource for FlakySource {
        async fn fetch_rules(&self) -> Result<Vec<EndpointProtectionRule>> {
            if self.fail.load(Ordering::SeqCst) {
                Err(GateError::UpstreamUnavailable("policy source down".to_string()))
            } else {
                Ok(scenario_rules())
            }
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let source = Arc::new(FlakySource {
            fail: AtomicBool::new(false),
        });
        let cache = PolicyCache::new(source.clone(), RetryPolicy::none());

        assert_eq!(cache.refresh().await.unwrap(), 1);
        let in_flight = cache.snapshot();

        source.fail.store(true, Ordering::SeqCst);
        assert!(cache.refresh().await.is_err());
        assert_eq!(cache.snapshot().version(), 1);
        assert_eq!(cache.decide("GET", "/public/info"), PolicyDecision::Public);

        source.fail.store(false, Ordering::SeqCst);
        assert_eq!(cache.refresh().await.unwrap(), 2);
        // 旧快照仍可被持有者完整读取
        assert_eq!(in_flight.version(), 1);
        assert_eq!(in_flight.rules().len(), 2);
    }

    #[tokio::test]
    async fn test_install_bumps_version() {
        let source = Arc::new(FlakySource {
            fail: AtomicBool::new(true),
        });
        let cache = PolicyCache::new(source, RetryPolicy::none());

        assert_eq!(cache.decide("GET", "/public/info"), PolicyDecision::NoMatch);
        assert_eq!(cache.install(scenario_rules()).await, 1);
        assert_eq!(cache.install(Vec::new()).await, 2);
        assert_eq!(cache.decide("GET", "/public/info"), PolicyDecision::NoMatch);
    }
}
