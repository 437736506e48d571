// Policy-based routing for the tunnel

//! Policy-based routing for the tunnel
//!
//! A [`RoutingAgent`] installs the rules that send unmarked traffic into a
//! dedicated routing table whose default route is the tunnel.
//! [`RoutingPolicyController`] switches between a [`NoopAgent`] and the real
//! agent and remembers the last applied rule so it can be replayed when
//! routing is enabled again.

use crate::error::{Error, Result, StepExt};
use crate::types::Interface;
use std::future::Future;
use tokio::process::Command;
use tokio::sync::Mutex;

/// Installs and removes the tunnel's routing rules
pub trait RoutingAgent: Send {
    /// Route traffic through `iface`, also for IPv6 when `ipv6` is set
    fn apply_rules(
        &mut self,
        iface: &Interface,
        ipv6: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove everything `apply_rules` installed
    fn clear_rules(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Routing table the rules point into
    fn table_id(&self) -> u32;
}

/// Agent used while routing is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAgent;

impl RoutingAgent for NoopAgent {
    async fn apply_rules(&mut self, _iface: &Interface, _ipv6: bool) -> Result<()> {
        Ok(())
    }

    async fn clear_rules(&mut self) -> Result<()> {
        Ok(())
    }

    fn table_id(&self) -> u32 {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn flag(self) -> &'static str {
        match self {
            Family::V4 => "-4",
            Family::V6 => "-6",
        }
    }
}

/// Agent driving `ip rule` / `ip route`
///
/// Per address family it installs:
/// - `default dev <iface>` in the tunnel table
/// - `not fwmark <mark> table <table>` at `priority`, so everything except the
///   engine's own marked packets uses the tunnel table
/// - `table main suppress_prefixlength 0` at `priority - 1`, so more specific
///   routes of the main table (LAN, link-local) still win
pub struct PolicyRuleAgent {
    fwmark: u32,
    table_id: u32,
    priority: u32,
    installed: Vec<Family>,
}

impl PolicyRuleAgent {
    /// Agent exempting packets marked `fwmark` from table `table_id`
    pub fn new(fwmark: u32, table_id: u32, priority: u32) -> Self {
        Self {
            fwmark,
            table_id,
            priority,
            installed: Vec::new(),
        }
    }

    fn apply_commands(&self, iface: &str, family: Family) -> Vec<Vec<String>> {
        let flag = family.flag().to_string();
        let table = self.table_id.to_string();
        vec![
            vec![
                flag.clone(),
                "route".into(),
                "replace".into(),
                "default".into(),
                "dev".into(),
                iface.to_string(),
                "table".into(),
                table.clone(),
            ],
            vec![
                flag.clone(),
                "rule".into(),
                "add".into(),
                "not".into(),
                "fwmark".into(),
                format!("{:#x}", self.fwmark),
                "table".into(),
                table,
                "priority".into(),
                self.priority.to_string(),
            ],
            vec![
                flag,
                "rule".into(),
                "add".into(),
                "table".into(),
                "main".into(),
                "suppress_prefixlength".into(),
                "0".into(),
                "priority".into(),
                self.priority.saturating_sub(1).to_string(),
            ],
        ]
    }

    fn clear_commands(&self, family: Family) -> Vec<Vec<String>> {
        let flag = family.flag().to_string();
        vec![
            vec![
                flag.clone(),
                "rule".into(),
                "del".into(),
                "priority".into(),
                self.priority.to_string(),
            ],
            vec![
                flag.clone(),
                "rule".into(),
                "del".into(),
                "priority".into(),
                self.priority.saturating_sub(1).to_string(),
            ],
            vec![
                flag,
                "route".into(),
                "flush".into(),
                "table".into(),
                self.table_id.to_string(),
            ],
        ]
    }

    async fn remove_family(&self, family: Family) -> Result<()> {
        for args in self.clear_commands(family) {
            let output = Command::new("ip")
                .args(&args)
                .output()
                .await
                .map_err(|e| Error::routing("clearing routing rules", e))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                // already gone
                if is_missing_entry(&stderr) {
                    continue;
                }
                return Err(Error::routing("clearing routing rules", stderr.trim()));
            }
        }
        Ok(())
    }
}

/// Whether `ip` failed only because the entry did not exist
fn is_missing_entry(stderr: &str) -> bool {
    stderr.contains("No such file or directory")
        || stderr.contains("No such process")
        || stderr.contains("FIB table does not exist")
}

impl RoutingAgent for PolicyRuleAgent {
    async fn apply_rules(&mut self, iface: &Interface, ipv6: bool) -> Result<()> {
        if !self.installed.is_empty() {
            self.clear_rules().await?;
        }

        let mut families = vec![Family::V4];
        if ipv6 {
            families.push(Family::V6);
        }

        for family in families {
            // rules of a half-configured family are still removed on clear
            self.installed.push(family);

            for args in self.apply_commands(&iface.name, family) {
                log::debug!("ip {}", args.join(" "));
                let output = Command::new("ip")
                    .args(&args)
                    .output()
                    .await
                    .map_err(|e| Error::routing("applying routing rules", e))?;

                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let err = Error::routing("applying routing rules", stderr.trim());
                    if let Err(e) = self.clear_rules().await {
                        log::error!("Cleanup after failed rule setup: {}", e);
                    }
                    return Err(err);
                }
            }
        }

        log::info!(
            "Routing through {} via table {} (ipv6: {})",
            iface.name,
            self.table_id,
            ipv6
        );
        Ok(())
    }

    async fn clear_rules(&mut self) -> Result<()> {
        while let Some(family) = self.installed.last().copied() {
            self.remove_family(family).await?;
            self.installed.pop();
        }
        log::info!("Routing rules for table {} removed", self.table_id);
        Ok(())
    }

    fn table_id(&self) -> u32 {
        self.table_id
    }
}

/// Which agent currently handles rule operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// Rules are accepted and ignored
    Noop,
    /// Rules are installed
    Working,
}

/// Last successfully applied rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedRuleSnapshot {
    /// Interface the rules point at
    pub interface: Interface,
    /// IPv6 rules were requested too
    pub ipv6: bool,
}

struct RoutingState<N, W> {
    noop: N,
    working: W,
    current: AgentKind,
    snapshot: Option<AppliedRuleSnapshot>,
    enabled: bool,
}

impl<N: RoutingAgent, W: RoutingAgent> RoutingState<N, W> {
    async fn apply_current(&mut self, iface: &Interface, ipv6: bool) -> Result<()> {
        match self.current {
            AgentKind::Noop => self.noop.apply_rules(iface, ipv6).await,
            AgentKind::Working => self.working.apply_rules(iface, ipv6).await,
        }
    }

    async fn clear_current(&mut self) -> Result<()> {
        match self.current {
            AgentKind::Noop => self.noop.clear_rules().await,
            AgentKind::Working => self.working.clear_rules().await,
        }
    }
}

/// Enables and disables policy routing independently of the tunnel
pub struct RoutingPolicyController<N, W> {
    state: Mutex<RoutingState<N, W>>,
}

impl<N: RoutingAgent, W: RoutingAgent> RoutingPolicyController<N, W> {
    /// `enabled` selects the agent rule operations start out with
    pub fn new(noop: N, working: W, enabled: bool) -> Self {
        let current = if enabled {
            AgentKind::Working
        } else {
            AgentKind::Noop
        };
        Self {
            state: Mutex::new(RoutingState {
                noop,
                working,
                current,
                snapshot: None,
                enabled,
            }),
        }
    }

    /// Apply rules through the current agent and remember them
    pub async fn apply_rules(&self, iface: &Interface, ipv6: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .apply_current(iface, ipv6)
            .await
            .step("applying routing rules")?;
        state.snapshot = Some(AppliedRuleSnapshot {
            interface: iface.clone(),
            ipv6,
        });
        Ok(())
    }

    /// Clear rules through the current agent and forget them
    pub async fn clear_rules(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .clear_current()
            .await
            .step("clearing routing rules")?;
        state.snapshot = None;
        Ok(())
    }

    /// Routing table of the current agent
    pub async fn table_id(&self) -> u32 {
        let state = self.state.lock().await;
        match state.current {
            AgentKind::Noop => state.noop.table_id(),
            AgentKind::Working => state.working.table_id(),
        }
    }

    /// Switch to the working agent, replaying the remembered rule
    ///
    /// Nothing changes if the replay fails.
    pub async fn enable(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.enabled {
            return Ok(());
        }

        if let Some(snapshot) = state.snapshot.clone() {
            state
                .working
                .apply_rules(&snapshot.interface, snapshot.ipv6)
                .await
                .step("re-applying routing rules")?;
        }

        state.current = AgentKind::Working;
        state.enabled = true;
        log::info!("Policy routing enabled");
        Ok(())
    }

    /// Clear the installed rules and switch to the no-op agent
    ///
    /// The remembered rule is kept for the next [`Self::enable`].
    pub async fn disable(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.enabled {
            return Ok(());
        }

        state
            .clear_current()
            .await
            .step("clearing routing rules")?;

        state.current = AgentKind::Noop;
        state.enabled = false;
        log::info!("Policy routing disabled");
        Ok(())
    }

    /// Whether policy routing is on
    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    /// Agent handling rule operations
    pub async fn current(&self) -> AgentKind {
        self.state.lock().await.current
    }

    /// Last rule applied and not cleared since
    pub async fn snapshot(&self) -> Option<AppliedRuleSnapshot> {
        self.state.lock().await.snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum AgentCall {
        Apply(String, bool),
        Clear,
    }

    #[derive(Default)]
    struct Journal {
        calls: Vec<AgentCall>,
        fail_apply: bool,
        fail_clear: bool,
    }

    #[derive(Clone, Default)]
    struct RecordingAgent {
        journal: Arc<StdMutex<Journal>>,
    }

    impl RecordingAgent {
        fn calls(&self) -> Vec<AgentCall> {
            self.journal.lock().unwrap().calls.clone()
        }

        fn fail_apply(&self, fail: bool) {
            self.journal.lock().unwrap().fail_apply = fail;
        }

        fn fail_clear(&self, fail: bool) {
            self.journal.lock().unwrap().fail_clear = fail;
        }
    }

    impl RoutingAgent for RecordingAgent {
        async fn apply_rules(&mut self, iface: &Interface, ipv6: bool) -> Result<()> {
            let mut journal = self.journal.lock().unwrap();
            journal
                .calls
                .push(AgentCall::Apply(iface.name.clone(), ipv6));
            if journal.fail_apply {
                return Err(Error::routing("fake agent", "apply failed"));
            }
            Ok(())
        }

        async fn clear_rules(&mut self) -> Result<()> {
            let mut journal = self.journal.lock().unwrap();
            journal.calls.push(AgentCall::Clear);
            if journal.fail_clear {
                return Err(Error::routing("fake agent", "clear failed"));
            }
            Ok(())
        }

        fn table_id(&self) -> u32 {
            205
        }
    }

    fn eth0() -> Interface {
        Interface {
            name: "eth0".to_string(),
            index: 2,
        }
    }

    fn controller(enabled: bool) -> (RoutingPolicyController<NoopAgent, RecordingAgent>, RecordingAgent) {
        let agent = RecordingAgent::default();
        (
            RoutingPolicyController::new(NoopAgent, agent.clone(), enabled),
            agent,
        )
    }

    #[tokio::test]
    async fn test_scenario_enable_replays_rule_applied_while_disabled() {
        let (routing, agent) = controller(false);
        assert_eq!(routing.current().await, AgentKind::Noop);

        routing.apply_rules(&eth0(), false).await.unwrap();
        assert!(agent.calls().is_empty());
        assert_eq!(
            routing.snapshot().await,
            Some(AppliedRuleSnapshot {
                interface: eth0(),
                ipv6: false,
            })
        );

        routing.enable().await.unwrap();

        assert_eq!(agent.calls(), vec![AgentCall::Apply("eth0".to_string(), false)]);
        assert!(routing.is_enabled().await);
        assert_eq!(routing.current().await, AgentKind::Working);
    }

    #[tokio::test]
    async fn test_enable_without_snapshot_only_switches() {
        let (routing, agent) = controller(false);
        routing.enable().await.unwrap();
        assert!(agent.calls().is_empty());
        assert_eq!(routing.current().await, AgentKind::Working);
        assert_eq!(routing.table_id().await, 205);
    }

    #[tokio::test]
    async fn test_enable_twice_is_noop() {
        let (routing, agent) = controller(false);
        routing.apply_rules(&eth0(), true).await.unwrap();
        routing.enable().await.unwrap();
        routing.enable().await.unwrap();
        assert_eq!(agent.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_enable_leaves_state_unchanged() {
        let (routing, agent) = controller(false);
        routing.apply_rules(&eth0(), false).await.unwrap();
        agent.fail_apply(true);

        let err = routing.enable().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Routing);
        assert!(!routing.is_enabled().await);
        assert_eq!(routing.current().await, AgentKind::Noop);

        agent.fail_apply(false);
        routing.enable().await.unwrap();
        assert!(routing.is_enabled().await);
    }

    #[tokio::test]
    async fn test_disable_when_disabled_is_noop() {
        let (routing, agent) = controller(false);
        routing.disable().await.unwrap();
        assert!(agent.calls().is_empty());
        assert_eq!(routing.current().await, AgentKind::Noop);
    }

    #[tokio::test]
    async fn test_disable_clears_and_keeps_snapshot_for_replay() {
        let (routing, agent) = controller(true);
        routing.apply_rules(&eth0(), false).await.unwrap();

        routing.disable().await.unwrap();
        assert_eq!(routing.current().await, AgentKind::Noop);
        assert!(routing.snapshot().await.is_some());

        routing.enable().await.unwrap();
        assert_eq!(
            agent.calls(),
            vec![
                AgentCall::Apply("eth0".to_string(), false),
                AgentCall::Clear,
                AgentCall::Apply("eth0".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_disable_leaves_state_unchanged() {
        let (routing, agent) = controller(true);
        agent.fail_clear(true);

        assert!(routing.disable().await.is_err());
        assert!(routing.is_enabled().await);
        assert_eq!(routing.current().await, AgentKind::Working);
    }

    #[tokio::test]
    async fn test_apply_failure_keeps_previous_snapshot() {
        let (routing, agent) = controller(true);
        routing.apply_rules(&eth0(), false).await.unwrap();
        agent.fail_apply(true);

        let wlan0 = Interface {
            name: "wlan0".to_string(),
            index: 3,
        };
        assert!(routing.apply_rules(&wlan0, true).await.is_err());
        assert_eq!(routing.snapshot().await.unwrap().interface, eth0());
    }

    #[tokio::test]
    async fn test_clear_rules_forgets_snapshot() {
        let (routing, agent) = controller(true);
        routing.apply_rules(&eth0(), false).await.unwrap();
        routing.clear_rules().await.unwrap();
        assert_eq!(routing.snapshot().await, None);

        routing.disable().await.unwrap();
        routing.enable().await.unwrap();
        assert_eq!(
            agent.calls(),
            vec![
                AgentCall::Apply("eth0".to_string(), false),
                AgentCall::Clear,
                AgentCall::Clear,
            ]
        );
    }

    #[test]
    fn test_policy_rule_commands() {
        let agent = PolicyRuleAgent::new(0xe1f1, 205, 32000);
        let commands: Vec<String> = agent
            .apply_commands("nordlynx", Family::V4)
            .iter()
            .map(|args| args.join(" "))
            .collect();
        assert_eq!(
            commands,
            vec![
                "-4 route replace default dev nordlynx table 205",
                "-4 rule add not fwmark 0xe1f1 table 205 priority 32000",
                "-4 rule add table main suppress_prefixlength 0 priority 31999",
            ]
        );

        let commands: Vec<String> = agent
            .clear_commands(Family::V6)
            .iter()
            .map(|args| args.join(" "))
            .collect();
        assert_eq!(
            commands,
            vec![
                "-6 rule del priority 32000",
                "-6 rule del priority 31999",
                "-6 route flush table 205",
            ]
        );
    }

    #[test]
    fn test_is_missing_entry() {
        assert!(is_missing_entry("RTNETLINK answers: No such file or directory"));
        assert!(is_missing_entry("Error: FIB table does not exist."));
        assert!(!is_missing_entry("RTNETLINK answers: Operation not permitted"));
    }

    #[tokio::test]
    async fn test_noop_agent() {
        let mut agent = NoopAgent;
        agent.apply_rules(&eth0(), true).await.unwrap();
        agent.clear_rules().await.unwrap();
        assert_eq!(agent.table_id(), 0);
    }

    #[tokio::test]
    async fn test_policy_agent_clear_without_rules_runs_nothing() {
        let mut agent = PolicyRuleAgent::new(0xe1f1, 205, 32000);
        agent.clear_rules().await.unwrap();
        assert_eq!(agent.table_id(), 205);
    }
}
