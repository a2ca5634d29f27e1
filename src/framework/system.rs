use chrono::TimeDelta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationState {
    #[default]
    Primary,
    PerformanceStandby,
    PerformanceSecondary,
}

/// Mount-level facts supplied by the broker.
pub trait SystemView: Send + Sync + 'static {
    fn default_lease_ttl(&self) -> TimeDelta;

    fn max_lease_ttl(&self) -> TimeDelta;

    fn replication_state(&self) -> ReplicationState {
        ReplicationState::Primary
    }
}

#[derive(Debug, Clone, bon::Builder)]
pub struct StaticSystemView {
    #[builder(default = TimeDelta::hours(768))]
    pub default_lease_ttl: TimeDelta,
    #[builder(default = TimeDelta::hours(768))]
    pub max_lease_ttl: TimeDelta,
    #[builder(default)]
    pub replication_state: ReplicationState,
}

impl Default for StaticSystemView {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SystemView for StaticSystemView {
    fn default_lease_ttl(&self) -> TimeDelta {
        self.default_lease_ttl
    }

    fn max_lease_ttl(&self) -> TimeDelta {
        self.max_lease_ttl
    }

    fn replication_state(&self) -> ReplicationState {
        self.replication_state
    }
}
